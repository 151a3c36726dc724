//! System-wide constants and default paths.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Default base directory for berth data when running as root.
pub const SYSTEM_DATA_DIR: &str = "/var/lib/berth";

/// Returns the data directory, preferring `$HOME/.berth` and falling back
/// to `/var/lib/berth`.
fn resolve_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let user_dir = PathBuf::from(home).join(".berth");
        if std::fs::create_dir_all(&user_dir).is_ok() {
            return user_dir;
        }
    }
    PathBuf::from(SYSTEM_DATA_DIR)
}

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Returns the resolved default data directory for this session.
pub fn data_dir() -> &'static PathBuf {
    DATA_DIR.get_or_init(resolve_data_dir)
}

/// Default recipe file name inside a build context.
pub const RECIPE_FILE: &str = "Berthfile";

/// Ignore file consulted when copying the build context.
pub const IGNORE_FILE: &str = ".berthignore";

/// Config file name looked up inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Prefix marking a deletion inside a layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Reference naming the empty base filesystem.
pub const SCRATCH_BASE: &str = "scratch";

/// Login name and numeric identity of the privileged builder.
pub const BUILDER_USER: &str = "root";

/// First uid/gid handed to accounts created during a build.
pub const FIRST_ACCOUNT_ID: u32 = 1000;

/// Longest login name accepted by account creation.
pub const MAX_ACCOUNT_NAME_LEN: usize = 32;

/// `PATH` used for `argv[0]` lookup when the image does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Seconds between SIGTERM and SIGKILL when stopping a container.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 10;

/// SHA-256 digest length in hex characters.
pub const SHA256_HEX_LENGTH: usize = 64;

/// Maximum number of layers in an image.
pub const MAX_IMAGE_LAYERS: usize = 128;

/// Application name used in CLI output and state files.
pub const APP_NAME: &str = "berth";
