use std::path::PathBuf;

/// Fleet map cache directory: `~/.cache/esxctl/`
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("esxctl")
}

/// Cached fleet map for one configuration: `~/.cache/esxctl/fleet-<id>.json`
pub fn cache_file(id: &str) -> PathBuf {
    cache_dir().join(format!("fleet-{id}.json"))
}

/// Per-configuration state directory: `~/.local/share/esxctl/<id>/`
pub fn data_dir(id: &str) -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("esxctl")
        .join(id)
}

/// Run journals of apply/destroy invocations.
pub fn logs_dir(id: &str) -> PathBuf {
    data_dir(id).join("logs")
}

/// Records which config file owns a data directory.
pub fn config_path_file(id: &str) -> PathBuf {
    data_dir(id).join("config_path")
}
