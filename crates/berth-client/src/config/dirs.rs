use directories::ProjectDirs;
use std::path::PathBuf;

const CONFIG_FILE_NAME: &str = "config.json";

/// Config directory following the XDG layout (`~/.config/berth` on Linux).
///
/// Returns `None` when no home directory can be determined.
#[must_use]
pub fn default_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "berth").map(|project| project.config_dir().to_path_buf())
}

/// Location of the client config file.
///
/// An explicit path wins over the XDG default.
#[must_use]
pub fn config_file(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| default_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME)))
}
