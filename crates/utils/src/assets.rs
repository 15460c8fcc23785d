use directories::ProjectDirs;

use crate::path::expand_tilde;

/// Root directory for all control-plane state (data, logs, legacy instance JSON).
///
/// Respects `IMX_DATA_DIR`. Defaults to the OS-appropriate data directory:
/// macOS -> `~/Library/Application Support/infermux`, Linux -> `~/.local/share/infermux`
/// (honoring `XDG_DATA_HOME`), Windows -> `%APPDATA%\infermux`.
pub fn data_dir() -> std::path::PathBuf {
    let path = if let Ok(p) = std::env::var("IMX_DATA_DIR") {
        expand_tilde(&p)
    } else {
        ProjectDirs::from("dev", "infermux", "infermux")
            .expect("OS didn't give us a home directory")
            .data_dir()
            .to_path_buf()
    };

    if !path.exists() {
        std::fs::create_dir_all(&path).expect("failed to create data directory");
    }

    path
}

/// Directory for rotated stdout/stderr log files of supervised children.
///
/// Respects `IMX_LOGS_DIR`. Default: `{data_dir}/logs`.
pub fn logs_dir() -> std::path::PathBuf {
    let path = if let Ok(p) = std::env::var("IMX_LOGS_DIR") {
        expand_tilde(&p)
    } else {
        data_dir().join("logs")
    };

    if !path.exists() {
        std::fs::create_dir_all(&path).expect("failed to create logs directory");
    }

    path
}

/// Legacy per-instance JSON directory, migrated into the relational store on startup.
///
/// Respects `IMX_INSTANCES_DIR`. Default: `{data_dir}/instances`.
pub fn instances_dir() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("IMX_INSTANCES_DIR") {
        return expand_tilde(&p);
    }
    data_dir().join("instances")
}

/// Path to the SQLite database file.
///
/// Respects `IMX_DATABASE_PATH`. Default: `{data_dir}/instances.sqlite`.
pub fn database_path() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("IMX_DATABASE_PATH") {
        return expand_tilde(&p);
    }
    data_dir().join("instances.sqlite")
}

#[cfg(test)]
mod tests {
    use std::env;

    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn database_path_default_is_under_data_dir() {
        unsafe { env::remove_var("IMX_DATABASE_PATH") };
        let path = database_path();
        assert!(path.ends_with("instances.sqlite"));
    }

    #[test]
    #[serial]
    fn database_path_env_override() {
        unsafe { env::set_var("IMX_DATABASE_PATH", "/tmp/custom/test.db") };
        let path = database_path();
        unsafe { env::remove_var("IMX_DATABASE_PATH") };
        assert_eq!(path, std::path::PathBuf::from("/tmp/custom/test.db"));
    }

    #[test]
    #[serial]
    fn database_path_tilde_expansion() {
        unsafe { env::set_var("IMX_DATABASE_PATH", "~/infermux/test.db") };
        let path = database_path();
        unsafe { env::remove_var("IMX_DATABASE_PATH") };
        assert!(!path.to_string_lossy().contains('~'));
        assert!(path.is_absolute());
    }

    #[test]
    #[serial]
    fn instances_dir_default_is_under_data_dir() {
        unsafe { env::remove_var("IMX_INSTANCES_DIR") };
        let dir = instances_dir();
        assert!(dir.ends_with("instances"));
    }
}
