use std::path::PathBuf;

/// Env var that overrides the config file location.
pub const CONFIG_ENV: &str = "VKLAYER_CONFIG";

/// File name of the layer configuration.
pub const CONFIG_FILE_NAME: &str = "vklayer.toml";

/// Returns the system-wide configuration directory for the layer.
pub fn system_config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        let programdata =
            std::env::var("PROGRAMDATA").unwrap_or_else(|_| r"C:\ProgramData".to_string());
        PathBuf::from(programdata).join("vklayer")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/etc/vklayer")
    }
}

/// Candidate config paths, most specific first:
/// 1. `$VKLAYER_CONFIG`
/// 2. system-wide `vklayer.toml`
/// 3. `./vklayer.toml`
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::with_capacity(3);
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            paths.push(PathBuf::from(path));
        }
    }
    paths.push(system_config_dir().join(CONFIG_FILE_NAME));
    paths.push(PathBuf::from(CONFIG_FILE_NAME));
    paths
}

/// Returns the platform name string.
pub fn platform_name() -> &'static str {
    #[cfg(target_os = "windows")]
    { "windows" }
    #[cfg(target_os = "linux")]
    { "linux" }
    #[cfg(target_os = "macos")]
    { "macos" }
    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    { "unknown" }
}
