//! Ambient configuration: log directory/level and a default database path,
//! loaded with the same precedence the rest of the ecosystem uses --
//! explicit override, then environment variables, then a TOML file, then
//! built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FileConfig {
    db_path: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    log_level: Option<String>,
}

/// Resolved configuration for a `Db` instance.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config { db_path: None, log_dir: None, log_level: "info".to_string() }
    }
}

impl Config {
    /// Load configuration, searching (in order) an explicit path, the
    /// `VAULTCORE_CONFIG` environment variable, `~/.config/vaultcore.toml`,
    /// and `./vaultcore.toml`. Later sources only fill in fields the earlier
    /// ones left unset; an unreadable or malformed file is silently skipped
    /// rather than failing the whole load.
    #[must_use]
    pub fn load(explicit_path: Option<&Path>) -> Self {
        let mut file_cfg = FileConfig::default();
        let mut candidates = Vec::new();
        if let Some(p) = explicit_path {
            candidates.push(p.to_path_buf());
        }
        if let Ok(p) = std::env::var("VAULTCORE_CONFIG") {
            candidates.push(PathBuf::from(p));
        }
        if let Some(home) = dirs_next::config_dir() {
            candidates.push(home.join("vaultcore.toml"));
        }
        if let Ok(cur) = std::env::current_dir() {
            candidates.push(cur.join("vaultcore.toml"));
        }

        for path in candidates {
            if !path.exists() {
                continue;
            }
            let Ok(s) = std::fs::read_to_string(&path) else { continue };
            let Ok(parsed) = toml::from_str::<FileConfig>(&s) else {
                log::warn!("ignoring malformed config file {}", path.display());
                continue;
            };
            if file_cfg.db_path.is_none() {
                file_cfg.db_path = parsed.db_path;
            }
            if file_cfg.log_dir.is_none() {
                file_cfg.log_dir = parsed.log_dir;
            }
            if file_cfg.log_level.is_none() {
                file_cfg.log_level = parsed.log_level;
            }
        }

        let log_dir = file_cfg.log_dir.or_else(|| std::env::var("VAULTCORE_LOG_DIR").ok().map(PathBuf::from));
        let log_level = std::env::var("VAULTCORE_LOG_LEVEL").ok().or(file_cfg.log_level).unwrap_or_else(|| "info".to_string());

        Config { db_path: file_cfg.db_path, log_dir, log_level }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_info_log_level() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.db_path.is_none());
    }

    #[test]
    fn load_reads_explicit_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vaultcore.toml");
        std::fs::write(&path, "db_path = \"/tmp/example.db\"\nlog_level = \"debug\"\n").unwrap();
        let cfg = Config::load(Some(&path));
        assert_eq!(cfg.db_path, Some(PathBuf::from("/tmp/example.db")));
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn load_with_no_sources_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.toml");
        let cfg = Config::load(Some(&missing));
        assert_eq!(cfg.log_level, "info");
    }
}
