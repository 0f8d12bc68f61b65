//! Settings file – reads/writes `~/.keel/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_kernel::LaunchExtras;
use keel_runtime::SupervisorConfig;
use serde::{Deserialize, Serialize};

/// Persisted supervisor settings.  Every field has a default, so an empty
/// file (or no file at all) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Supervision tick period in milliseconds.
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,

    /// Grace period per service at shutdown.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Grace period when stopping a crashed service before respawning it.
    #[serde(default = "default_restart_stop_timeout_ms")]
    pub restart_stop_timeout_ms: u64,

    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    #[serde(default = "default_lock_name")]
    pub lock_name: String,

    /// Root of the file-backed parameter store.
    #[serde(default = "default_params_dir")]
    pub params_dir: PathBuf,

    /// Unix datagram socket that receives the start token.
    #[serde(default = "default_start_socket")]
    pub start_socket: PathBuf,

    /// Image names accepted as the companion application.
    #[serde(default = "default_trusted_images")]
    pub trusted_images: Vec<String>,

    /// Image of the service that receives forwarded environment variables.
    #[serde(default = "default_companion_app")]
    pub companion_app: String,

    /// Environment variables forwarded to the companion app as `-e NAME VALUE`.
    #[serde(default = "default_forward_env")]
    pub forward_env: Vec<String>,

    /// Refuse to boot when `Passive` is neither stored nor given via `PASSIVE`.
    #[serde(default)]
    pub require_passive: bool,

    /// Parameters written at boot unless already present.
    #[serde(default)]
    pub default_params: BTreeMap<String, String>,
}

fn default_tick_period_ms() -> u64 {
    1000
}
fn default_stop_timeout_ms() -> u64 {
    5000
}
fn default_restart_stop_timeout_ms() -> u64 {
    1000
}
fn default_lock_dir() -> PathBuf {
    PathBuf::from("/tmp")
}
fn default_lock_name() -> String {
    "keel".to_string()
}
fn default_params_dir() -> PathBuf {
    keel_dir_for_home(&home()).join("params")
}
fn default_start_socket() -> PathBuf {
    PathBuf::from("/tmp/keel-start.sock")
}
fn default_trusted_images() -> Vec<String> {
    ["java", "ai.flow.android", "java.exe", "ai.flow.app"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_companion_app() -> String {
    "ai.flow.app".to_string()
}
fn default_forward_env() -> Vec<String> {
    [
        "USE_CUDA",
        "USE_PARAMS_CLIENT",
        "ZMQ_MESSAGING_PROTOCOL",
        "ZMQ_MESSAGING_ADDRESS",
        "USE_VIDEO_STREAM",
        "SIMULATION",
        "FINGERPRINT",
        "MSGQ",
        "PASSIVE",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_period_ms: default_tick_period_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            restart_stop_timeout_ms: default_restart_stop_timeout_ms(),
            lock_dir: default_lock_dir(),
            lock_name: default_lock_name(),
            params_dir: default_params_dir(),
            start_socket: default_start_socket(),
            trusted_images: default_trusted_images(),
            companion_app: default_companion_app(),
            forward_env: default_forward_env(),
            require_passive: false,
            default_params: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Supervisor tunables for one run.
    pub fn supervisor_config(&self, log_dir: Option<PathBuf>, passive: Option<bool>) -> SupervisorConfig {
        SupervisorConfig {
            tick_period: Duration::from_millis(self.tick_period_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            restart_stop_timeout: Duration::from_millis(self.restart_stop_timeout_ms),
            lock_dir: self.lock_dir.clone(),
            lock_name: self.lock_name.clone(),
            log_dir,
            extras: LaunchExtras::from_env(self.companion_app.clone(), &self.forward_env),
            default_params: self.default_params.clone(),
            passive,
            require_passive: self.require_passive,
        }
    }
}

fn home() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn keel_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".keel")
}

/// Return the path to `~/.keel/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    keel_dir_for_home(home).join("config.toml")
}

/// Load `path` (or the default location), fall back to defaults when the
/// file is absent, then apply environment overrides.
pub fn resolve(path: Option<&Path>) -> Result<Config, String> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let mut cfg = load_from(&path)?.unwrap_or_default();
    apply_env_overrides(&mut cfg);
    Ok(cfg)
}

/// Load the config from a specific path.  Returns `None` if the file does not
/// exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    Ok(Some(cfg))
}

/// Apply `KEEL_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `KEEL_TICK_PERIOD_MS` | `tick_period_ms` |
/// | `KEEL_PARAMS_DIR` | `params_dir` |
/// | `KEEL_LOCK_DIR` | `lock_dir` |
/// | `KEEL_START_SOCKET` | `start_socket` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("KEEL_TICK_PERIOD_MS")
        && let Ok(ms) = v.parse::<u64>()
        && ms > 0
    {
        cfg.tick_period_ms = ms;
    }
    if let Ok(v) = std::env::var("KEEL_PARAMS_DIR") {
        cfg.params_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("KEEL_LOCK_DIR") {
        cfg.lock_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("KEEL_START_SOCKET") {
        cfg.start_socket = PathBuf::from(v);
    }
}

/// `PASSIVE` is an integer flag; anything unparsable leaves the parameter
/// untouched.
pub fn passive_from(value: Option<&str>) -> Option<bool> {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|n| n != 0)
}

/// Save the config to a specific path, creating the parent directory.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
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

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap())
            .expect("dir metadata")
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.tick_period_ms = 250;
        cfg.forward_env = vec!["MAPBOX_TOKEN".to_string()];
        cfg.default_params.insert("HasAcceptedTerms".to_string(), "1".to_string());
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn empty_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.tick_period_ms, 1000);
        assert_eq!(loaded.stop_timeout_ms, 5000);
        assert_eq!(loaded.lock_name, "keel");
        assert_eq!(loaded.companion_app, "ai.flow.app");
        assert_eq!(loaded.trusted_images.len(), 4);
        assert!(loaded.trusted_images.iter().any(|i| i == "java.exe"));
        assert!(!loaded.require_passive);
    }

    #[test]
    fn companion_forwarding_defaults_to_launch_flags() {
        let cfg = Config::default();
        assert_eq!(cfg.forward_env.len(), 9);
        assert_eq!(cfg.forward_env.first().map(String::as_str), Some("USE_CUDA"));
        assert!(cfg.forward_env.iter().any(|v| v == "PASSIVE"));

        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "forward_env = []\nrequire_passive = true\n").unwrap();
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert!(loaded.forward_env.is_empty());
        assert!(loaded.require_passive);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "lock_name = \"keel-dev\"\n\n[default_params]\nIsMetric = \"1\"\n",
        )
        .unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.lock_name, "keel-dev");
        assert_eq!(loaded.lock_dir, PathBuf::from("/tmp"));
        assert_eq!(loaded.default_params.get("IsMetric").map(String::as_str), Some("1"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "tick_period_ms = \"fast\"").unwrap();
        assert!(load_from(&path).unwrap_err().contains("parse"));
    }

    #[test]
    fn config_path_points_to_keel_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.keel/config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn supervisor_config_converts_units() {
        let mut cfg = Config::default();
        cfg.tick_period_ms = 250;
        cfg.restart_stop_timeout_ms = 40;
        let sup = cfg.supervisor_config(Some(PathBuf::from("/var/log/keel")), Some(true));
        assert_eq!(sup.tick_period, Duration::from_millis(250));
        assert_eq!(sup.stop_timeout, Duration::from_secs(5));
        assert_eq!(sup.restart_stop_timeout, Duration::from_millis(40));
        assert_eq!(sup.log_dir.as_deref(), Some(Path::new("/var/log/keel")));
        assert_eq!(sup.passive, Some(true));
        assert!(!sup.require_passive);
    }

    #[test]
    fn passive_flag_parsing() {
        assert_eq!(passive_from(Some("1")), Some(true));
        assert_eq!(passive_from(Some(" 0 ")), Some(false));
        assert_eq!(passive_from(Some("yes")), None);
        assert_eq!(passive_from(None), None);
    }

    // Env-mutating tests each own a distinct variable.

    #[test]
    fn apply_env_overrides_changes_tick_period() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("KEEL_TICK_PERIOD_MS", "50") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.tick_period_ms, 50);
        unsafe { std::env::set_var("KEEL_TICK_PERIOD_MS", "often") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.tick_period_ms, 1000);
        unsafe { std::env::remove_var("KEEL_TICK_PERIOD_MS") };
    }

    #[test]
    fn apply_env_overrides_changes_params_dir() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("KEEL_PARAMS_DIR", "/data/params") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.params_dir, PathBuf::from("/data/params"));
        unsafe { std::env::remove_var("KEEL_PARAMS_DIR") };
    }

    #[test]
    fn apply_env_overrides_changes_start_socket() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("KEEL_START_SOCKET", "/run/keel.sock") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.start_socket, PathBuf::from("/run/keel.sock"));
        unsafe { std::env::remove_var("KEEL_START_SOCKET") };
    }
}
