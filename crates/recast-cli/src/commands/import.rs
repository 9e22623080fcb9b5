//! `recast import`: import a base image from a local source.

use std::path::Path;

use clap::Args;
use recast_common::config::RecastConfig;
use recast_image::media::SchemaFamily;
use recast_image::reference::ImageRef;
use recast_image::source::resolve_source;

/// Arguments for the `import` command.
#[derive(Args, Debug)]
pub struct ImportArgs {
    /// `file://DIR`, `tar://ARCHIVE`, or a plain path to either.
    pub source: String,

    /// Name to register the image under.
    pub name: String,

    /// Write Docker schema 2 media types instead of OCI.
    #[arg(long)]
    pub docker: bool,
}

/// Turns a plain path into a source URI.
fn source_uri(source: &str) -> String {
    if source.contains("://") {
        return source.to_owned();
    }
    if Path::new(source).is_dir() {
        format!("file://{source}")
    } else {
        format!("tar://{source}")
    }
}

/// Executes the `import` command.
///
/// # Errors
///
/// Returns an error if the source or name is invalid or the import fails.
pub fn execute(args: ImportArgs, config: &RecastConfig) -> anyhow::Result<()> {
    let source = resolve_source(&source_uri(&args.source))?;
    let reference = ImageRef::parse(&args.name)?;
    let family = if args.docker {
        SchemaFamily::Docker
    } else {
        SchemaFamily::Oci
    };
    let store = super::open_store(config)?;
    let record = store.import(&source, &reference, family)?;
    println!("{}\t{}", record.name, record.target.digest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_paths_get_a_scheme() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().to_str().expect("utf-8");
        assert_eq!(source_uri(path), format!("file://{path}"));
        assert_eq!(source_uri("/tmp/rootfs.tar.gz"), "tar:///tmp/rootfs.tar.gz");
        assert_eq!(source_uri("tar:///x.tar"), "tar:///x.tar");
    }
}
