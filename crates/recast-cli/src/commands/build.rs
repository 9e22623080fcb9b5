//! `recast build`: build recipes into images.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use recast_build::graph::build_order;
use recast_build::{Builder, RecipeSet};
use recast_common::config::RecastConfig;
use recast_runtime::cancel::CancelToken;
use recast_runtime::chroot::ChrootRunner;

/// Arguments for the `build` command.
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Tag for the built images; parents without a tag inherit it.
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Prefix for local image names (e.g. `myorg/`).
    #[arg(long, env = "RECAST_PREFIX")]
    pub prefix: Option<String>,

    /// Directory containing one sub-directory per recipe.
    #[arg(long = "recipes", value_name = "DIR", default_value = ".")]
    pub recipes_dir: PathBuf,

    /// Environment variable passed to every stage.
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<String>,

    /// Recipes to build; local parents among them are built first.
    #[arg(required = true)]
    pub recipes: Vec<String>,
}

fn parse_env(entry: &str) -> Result<String, String> {
    match entry.split_once('=') {
        Some((key, _)) if !key.is_empty() => Ok(entry.to_owned()),
        _ => Err(format!("expected KEY=VALUE, got '{entry}'")),
    }
}

/// Executes the `build` command.
///
/// # Errors
///
/// Returns an error if a recipe cannot be loaded or a build fails.
pub fn execute(args: BuildArgs, config: &RecastConfig, cancel: &CancelToken) -> anyhow::Result<()> {
    let set = RecipeSet::open(&args.recipes_dir)?;
    let recipes = args
        .recipes
        .iter()
        .map(|name| set.load(name).with_context(|| format!("loading recipe {name}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let ordered = build_order(recipes)?;

    let runner = ChrootRunner::new().context("stage containers are unavailable")?;
    let store = super::open_store(config)?;
    let builder = Builder::new(store, runner).with_workspace_base(&config.workspace_base);
    let tag = config.tag_or_default(args.tag.as_deref().unwrap_or_default());
    let prefix = args.prefix.as_deref().unwrap_or(&config.image_prefix);

    for recipe in &ordered {
        let outcome = builder
            .build_recipe(recipe, tag, prefix, &args.env, cancel)
            .with_context(|| format!("building recipe {}", recipe.name))?;
        println!("{}\t{}", outcome.reference, outcome.manifest.digest);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_entries_need_a_key() {
        assert_eq!(parse_env("A=1").expect("valid"), "A=1");
        assert_eq!(parse_env("EMPTY=").expect("valid"), "EMPTY=");
        assert!(parse_env("=1").is_err());
        assert!(parse_env("NOVALUE").is_err());
    }
}
