//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for recast data on Linux with root access.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/recast";

/// Returns the data directory, preferring `$HOME/.recast` when it can be
/// created, falling back to `/var/lib/recast`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".recast");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Base directory under which scratch workspaces are allocated.
pub const DEFAULT_WORKSPACE_BASE: &str = "/tmp";

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Tag applied when a reference or build omits one.
pub const DEFAULT_TAG: &str = "latest";

/// In-container path where the recipes directory is bind-mounted read-only.
pub const RECIPES_MOUNT_PATH: &str = "/recipes";

/// In-container scratch mounts backed by the build workspace: (workspace subdir, destination).
pub const SCRATCH_MOUNTS: [(&str, &str); 2] = [("tmp", "/tmp"), ("cache", "/var/cache/recast")];

/// Entry point run by the prepare stage.
pub const PREPARE_HOOK: &str = "/recast-prepare";

/// Entry point run by the build stage; receives the recipe name.
pub const BUILD_HOOK: &str = "/recast-build";

/// Entry point run by the teardown stage.
pub const TEARDOWN_HOOK: &str = "/recast-teardown";

/// Content label carrying a layer blob's uncompressed digest.
pub const LABEL_UNCOMPRESSED: &str = "io.recast.uncompressed";

/// Prefix of content labels that protect referenced blobs from collection.
pub const LABEL_GC_REF_CONTENT_PREFIX: &str = "io.recast.gc.ref.content.";

/// Default number of seconds to wait for a per-name lock.
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;

/// SHA-256 digest length in hex characters.
pub const SHA256_HEX_LENGTH: usize = 64;

/// Maximum number of layers in an image.
pub const MAX_IMAGE_LAYERS: usize = 128;

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "recast";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "recast";
