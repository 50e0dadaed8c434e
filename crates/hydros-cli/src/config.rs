//! Configuration Vault – reads/writes `~/.hydros/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hydros_kernel::{InterlockConfig, OrchestratorConfig};

/// Persisted operator configuration stored in `~/.hydros/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// SQLite file holding control state, the control log and sensor history.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// How long a request waits for a busy control.
    #[serde(default = "default_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Deadline for a single storage round-trip.
    #[serde(default = "default_timeout_ms")]
    pub storage_timeout_ms: u64,

    /// Extra attempts per control for bulk mode changes and emergency stop.
    #[serde(default = "default_bulk_retries")]
    pub bulk_retries: u32,

    /// Reservoir level (percent) below which pumps refuse to start.
    #[serde(default = "default_min_water_level")]
    pub min_water_level: f64,

    /// Block pumps when no water level reading is available.
    #[serde(default)]
    pub require_sensor_reading: bool,

    /// Per-topic capacity of the event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn default_database_path() -> PathBuf {
    hydros_dir_for_home(&home_dir()).join("hydros.db")
}
fn default_timeout_ms() -> u64 {
    2_000
}
fn default_bulk_retries() -> u32 {
    2
}
fn default_min_water_level() -> f64 {
    15.0
}
fn default_event_bus_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            lock_timeout_ms: default_timeout_ms(),
            storage_timeout_ms: default_timeout_ms(),
            bulk_retries: default_bulk_retries(),
            min_water_level: default_min_water_level(),
            require_sensor_reading: false,
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl Config {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn interlock(&self) -> InterlockConfig {
        InterlockConfig {
            min_water_level: self.min_water_level,
            require_sensor_reading: self.require_sensor_reading,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            bulk_retries: self.bulk_retries,
        }
    }

    /// Reject values TOML accepts but the interlocks cannot use.
    pub fn validate(&self) -> Result<(), String> {
        if !self.min_water_level.is_finite() {
            return Err(format!(
                "min_water_level must be a finite number, got {}",
                self.min_water_level
            ));
        }
        Ok(())
    }

    /// A zero capacity would make the broadcast channel panic.
    pub fn bus_capacity(&self) -> usize {
        self.event_bus_capacity.max(1)
    }
}

/// Return the path to `~/.hydros/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

fn hydros_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".hydros")
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    hydros_dir_for_home(home).join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    cfg.validate()?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `HYDROS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HYDROS_DATABASE_PATH` | `database_path` |
/// | `HYDROS_MIN_WATER_LEVEL` | `min_water_level` |
/// | `HYDROS_LOCK_TIMEOUT_MS` | `lock_timeout_ms` |
/// | `HYDROS_STORAGE_TIMEOUT_MS` | `storage_timeout_ms` |
///
/// Unparsable numeric values are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("HYDROS_DATABASE_PATH")
        && !v.trim().is_empty()
    {
        cfg.database_path = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("HYDROS_MIN_WATER_LEVEL")
        && let Ok(level) = v.trim().parse::<f64>()
        && level.is_finite()
    {
        cfg.min_water_level = level;
    }
    if let Ok(v) = std::env::var("HYDROS_LOCK_TIMEOUT_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.lock_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("HYDROS_STORAGE_TIMEOUT_MS")
        && let Ok(ms) = v.trim().parse::<u64>()
    {
        cfg.storage_timeout_ms = ms;
    }
}

/// Save the config to disk, creating `~/.hydros/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.storage_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.bulk_retries, 2);
        assert_eq!(cfg.min_water_level, 15.0);
        assert!(!cfg.require_sensor_reading);
        assert_eq!(cfg.event_bus_capacity, 256);
        assert!(cfg.database_path.ends_with(".hydros/hydros.db"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_custom_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config {
            database_path: dir.path().join("grow.db"),
            min_water_level: 22.5,
            require_sensor_reading: true,
            bulk_retries: 5,
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.database_path, dir.path().join("grow.db"));
        assert_eq!(loaded.min_water_level, 22.5);
        assert!(loaded.require_sensor_reading);
        assert_eq!(loaded.orchestrator().bulk_retries, 5);
        assert_eq!(loaded.interlock().min_water_level, 22.5);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "min_water_level = 30.0\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.min_water_level, 30.0);
        assert_eq!(loaded.lock_timeout_ms, 2_000);
        assert_eq!(loaded.event_bus_capacity, 256);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "min_water_level = \"plenty\"\n").unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn non_finite_water_level_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        for raw in ["min_water_level = nan\n", "min_water_level = -inf\n"] {
            std::fs::write(&path, raw).unwrap();
            let err = load_from(&path).unwrap_err();
            assert!(err.contains("min_water_level"), "{err}");
        }
    }

    #[test]
    fn config_path_points_to_hydros_dir() {
        let p = config_path_for_home("/home/grower");
        assert_eq!(p, PathBuf::from("/home/grower/.hydros/config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn zero_bus_capacity_is_clamped() {
        let cfg = Config {
            event_bus_capacity: 0,
            ..Config::default()
        };
        assert_eq!(cfg.bus_capacity(), 1);
    }

    #[test]
    fn apply_env_overrides_changes_database_path() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("HYDROS_DATABASE_PATH", "/var/lib/hydros/state.db") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.database_path, PathBuf::from("/var/lib/hydros/state.db"));
        unsafe { std::env::remove_var("HYDROS_DATABASE_PATH") };
    }

    #[test]
    fn apply_env_overrides_changes_water_level() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("HYDROS_MIN_WATER_LEVEL", "25") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.min_water_level, 25.0);
        unsafe { std::env::remove_var("HYDROS_MIN_WATER_LEVEL") };
    }

    #[test]
    fn apply_env_overrides_changes_timeouts_and_ignores_garbage() {
        // SAFETY: no other test reads these variables.
        unsafe {
            std::env::set_var("HYDROS_LOCK_TIMEOUT_MS", "500");
            std::env::set_var("HYDROS_STORAGE_TIMEOUT_MS", "soon");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.lock_timeout_ms, 500);
        assert_eq!(cfg.storage_timeout_ms, 2_000);
        unsafe {
            std::env::remove_var("HYDROS_LOCK_TIMEOUT_MS");
            std::env::remove_var("HYDROS_STORAGE_TIMEOUT_MS");
        }
    }
}
