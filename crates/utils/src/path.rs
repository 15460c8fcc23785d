/// Expand a leading `~` to the user's home directory.
///
/// Leaves the path untouched if it has no `~` prefix or the home directory
/// cannot be resolved.
pub fn expand_tilde(path: &str) -> std::path::PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = directories::UserDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}
