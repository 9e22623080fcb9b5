//! Recipe definitions.
//!
//! A recipes directory holds one sub-directory per recipe, each with a
//! `recipe.yml`:
//!
//! ```yaml
//! inherits: base
//! inherits_external: false
//! env:
//!   LANG: C.UTF-8
//! ```
//!
//! The directory name is the recipe name. The whole recipes directory is
//! what stage containers see at `/recipes`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use recast_common::error::{RecastError, Result};
use serde::Deserialize;

/// File describing a recipe inside its directory.
pub const RECIPE_FILE_NAME: &str = "recipe.yml";

/// A buildable recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipe {
    /// Recipe name; becomes the image repository (after the prefix).
    pub name: String,
    /// Parent image reference.
    pub inherits: String,
    /// Whether `inherits` is fully qualified outside the local prefix.
    pub inherits_external: bool,
    /// Directory mounted read-only into every stage.
    pub recipes_dir: PathBuf,
    /// Environment applied to every stage.
    pub env: BTreeMap<String, String>,
}

impl Recipe {
    /// Environment as `KEY=VALUE` entries.
    #[must_use]
    pub fn env_entries(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    /// Name of the local recipe this one inherits from, if any.
    #[must_use]
    pub fn local_parent(&self) -> Option<&str> {
        if self.inherits_external {
            return None;
        }
        let last_slash = self.inherits.rfind('/').map_or(0, |i| i + 1);
        let end = self.inherits[last_slash..]
            .find(':')
            .map_or(self.inherits.len(), |i| last_slash + i);
        Some(&self.inherits[..end])
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecipeFile {
    inherits: String,
    #[serde(default)]
    inherits_external: bool,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// A directory of recipes.
#[derive(Debug, Clone)]
pub struct RecipeSet {
    dir: PathBuf,
}

impl RecipeSet {
    /// Opens a recipes directory.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `dir` is not a directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(RecastError::NotFound {
                kind: "recipes directory",
                id: dir.display().to_string(),
            });
        }
        Ok(Self { dir })
    }

    /// The recipes directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads one recipe by name.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the recipe does not exist, and `Config` if the
    /// name is not a plain directory name or the file is malformed.
    pub fn load(&self, name: &str) -> Result<Recipe> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(RecastError::Config {
                message: format!("invalid recipe name '{name}'"),
            });
        }
        let path = self.dir.join(name).join(RECIPE_FILE_NAME);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RecastError::NotFound {
                    kind: "recipe",
                    id: name.to_owned(),
                });
            }
            Err(e) => return Err(RecastError::io(&path, e)),
        };
        let file: RecipeFile = serde_yaml::from_str(&text).map_err(|e| RecastError::Config {
            message: format!("invalid {}: {e}", path.display()),
        })?;
        if file.inherits.trim().is_empty() {
            return Err(RecastError::Config {
                message: format!("{}: inherits must not be empty", path.display()),
            });
        }
        tracing::debug!(recipe = name, inherits = %file.inherits, external = file.inherits_external, "recipe loaded");
        Ok(Recipe {
            name: name.to_owned(),
            inherits: file.inherits,
            inherits_external: file.inherits_external,
            recipes_dir: self.dir.clone(),
            env: file.env,
        })
    }

    /// Names of every recipe in the directory, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn names(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| RecastError::io(&self.dir, e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| RecastError::io(&self.dir, e))?;
            if entry.path().join(RECIPE_FILE_NAME).is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_recipe(dir: &Path, name: &str, yaml: &str) {
        std::fs::create_dir_all(dir.join(name)).expect("mkdir");
        std::fs::write(dir.join(name).join(RECIPE_FILE_NAME), yaml).expect("write");
    }

    #[test]
    fn loads_recipe_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_recipe(dir.path(), "app", "inherits: base\n");
        let recipe = RecipeSet::open(dir.path()).expect("open").load("app").expect("load");
        assert_eq!(recipe.name, "app");
        assert_eq!(recipe.inherits, "base");
        assert!(!recipe.inherits_external);
        assert_eq!(recipe.recipes_dir, dir.path());
        assert!(recipe.env.is_empty());
    }

    #[test]
    fn loads_env_and_external_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_recipe(
            dir.path(),
            "base",
            "inherits: docker.io/library/debian:12\ninherits_external: true\nenv:\n  LANG: C.UTF-8\n  DEBUG: \"1\"\n",
        );
        let recipe = RecipeSet::open(dir.path()).expect("open").load("base").expect("load");
        assert!(recipe.inherits_external);
        assert_eq!(recipe.local_parent(), None);
        assert_eq!(recipe.env_entries(), vec!["DEBUG=1", "LANG=C.UTF-8"]);
    }

    #[test]
    fn local_parent_drops_tag() {
        let recipe = Recipe {
            name: "app".into(),
            inherits: "base:v2".into(),
            inherits_external: false,
            recipes_dir: PathBuf::from("/recipes"),
            env: BTreeMap::new(),
        };
        assert_eq!(recipe.local_parent(), Some("base"));
    }

    #[test]
    fn missing_recipe_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = RecipeSet::open(dir.path()).expect("open").load("ghost").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn rejects_unknown_fields_and_bad_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_recipe(dir.path(), "odd", "inherits: base\nparent: other\n");
        let set = RecipeSet::open(dir.path()).expect("open");
        assert!(matches!(set.load("odd"), Err(RecastError::Config { .. })));
        assert!(matches!(set.load("../odd"), Err(RecastError::Config { .. })));
    }

    #[test]
    fn names_lists_only_recipe_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_recipe(dir.path(), "b", "inherits: a\n");
        write_recipe(dir.path(), "a", "inherits: x\ninherits_external: true\n");
        std::fs::create_dir(dir.path().join("scripts")).expect("mkdir");
        let names = RecipeSet::open(dir.path()).expect("open").names().expect("names");
        assert_eq!(names, vec!["a", "b"]);
    }
}
