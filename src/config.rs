//! Engine configuration: override precedence (flag > env > file > default),
//! normalization, validation, and atomic persistence — adapted from this
//! codebase's own layered config loader, generalized from a single
//! server/session pair to the full §6 configuration surface.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::conflict::ConflictStrategyKind;

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    state_store_root: Option<PathBuf>,
    #[serde(default)]
    log_path: Option<PathBuf>,
    #[serde(default)]
    include_patterns: Option<Vec<String>>,
    #[serde(default)]
    exclude_patterns: Option<Vec<String>>,
    #[serde(default)]
    conflict_resolution: Option<ConflictStrategyKind>,
    #[serde(default)]
    poll_interval_secs: Option<u64>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    watch_mode: Option<bool>,
    #[serde(default)]
    manifest: Option<PartialManifestConfig>,
}

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialManifestConfig {
    batch_size: Option<usize>,
    batch_timeout_ms: Option<u64>,
    worker_count: Option<usize>,
    retry_max: Option<u32>,
    retry_backoff_ms: Option<u64>,
    concurrent_limit: Option<usize>,
}

/// Manifest-update worker-pool tuning (§6 "manifest-update config").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestUpdateConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub worker_count: usize,
    pub retry_max: u32,
    pub retry_backoff_ms: u64,
    pub concurrent_limit: usize,
}

impl Default for ManifestUpdateConfig {
    fn default() -> Self {
        ManifestUpdateConfig {
            batch_size: 10,
            batch_timeout_ms: 500,
            worker_count: 3,
            retry_max: 3,
            retry_backoff_ms: 1_000,
            concurrent_limit: 5,
        }
    }
}

/// The fully-resolved, validated configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub state_store_root: PathBuf,
    pub log_path: PathBuf,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub conflict_resolution: ConflictStrategyKind,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub watch_mode: bool,
    pub manifest: ManifestUpdateConfig,
    pub config_path: Option<PathBuf>,
}

/// Highest-precedence layer: flags / programmatic overrides.
#[derive(Debug, Default, Clone)]
pub struct EngineConfigOverrides {
    pub state_store_root: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub include_patterns: Option<Vec<String>>,
    pub exclude_patterns: Option<Vec<String>>,
    pub conflict_resolution: Option<ConflictStrategyKind>,
    pub poll_interval: Option<Duration>,
    pub max_retries: Option<u32>,
    pub watch_mode: Option<bool>,
}

pub fn default_state_store_root() -> PathBuf {
    home_dir().join(".syncore").join("state")
}

pub fn default_log_file_path() -> PathBuf {
    home_dir().join(".syncore").join("logs").join("syncore.log")
}

impl EngineConfig {
    pub fn default_config_path() -> PathBuf {
        home_dir().join(".syncore").join("config.json")
    }

    pub fn resolve_config_path(flag_path: Option<&Path>) -> PathBuf {
        if let Some(p) = flag_path {
            return absolutize_path(p);
        }

        if let Ok(env_path) = std::env::var("SYNCORE_CONFIG_PATH") {
            let env_path = env_path.trim();
            if !env_path.is_empty() {
                return absolutize_path(Path::new(env_path));
            }
        }

        let candidates = [
            Self::default_config_path(),
            home_dir().join(".config").join("syncore").join("config.json"),
        ];
        for p in candidates {
            if p.exists() {
                return absolutize_path(&p);
            }
        }

        absolutize_path(&Self::default_config_path())
    }

    pub fn load_with_overrides(path: &Path, overrides: EngineConfigOverrides) -> Result<Self> {
        let file_cfg = read_partial_file(path)?;
        let env_cfg = read_env_config();

        let state_store_root = overrides
            .state_store_root
            .or(env_cfg.state_store_root)
            .or(file_cfg.state_store_root)
            .unwrap_or_else(default_state_store_root);
        let log_path = overrides
            .log_path
            .or(env_cfg.log_path)
            .or(file_cfg.log_path)
            .unwrap_or_else(default_log_file_path);
        let include_patterns = overrides
            .include_patterns
            .or(env_cfg.include_patterns)
            .or(file_cfg.include_patterns)
            .unwrap_or_default();
        let exclude_patterns = overrides
            .exclude_patterns
            .or(env_cfg.exclude_patterns)
            .or(file_cfg.exclude_patterns)
            .unwrap_or_default();
        let conflict_resolution = overrides
            .conflict_resolution
            .or(env_cfg.conflict_resolution)
            .or(file_cfg.conflict_resolution)
            .unwrap_or(ConflictStrategyKind::Timestamp);
        let poll_interval = overrides
            .poll_interval
            .or(env_cfg.poll_interval_secs.map(Duration::from_secs))
            .or(file_cfg.poll_interval_secs.map(Duration::from_secs))
            .unwrap_or(Duration::from_secs(30));
        let max_retries = overrides
            .max_retries
            .or(env_cfg.max_retries)
            .or(file_cfg.max_retries)
            .unwrap_or(3);
        let watch_mode = overrides
            .watch_mode
            .or(env_cfg.watch_mode)
            .or(file_cfg.watch_mode)
            .unwrap_or(true);

        let manifest = merge_manifest_config(file_cfg.manifest);

        let mut cfg = EngineConfig {
            state_store_root,
            log_path,
            include_patterns,
            exclude_patterns,
            conflict_resolution,
            poll_interval,
            max_retries,
            watch_mode,
            manifest,
            config_path: Some(path.to_path_buf()),
        };
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_file_only(path: &Path) -> Result<Self> {
        Self::load_with_overrides(path, EngineConfigOverrides::default())
    }

    fn normalize(&mut self) {
        self.state_store_root = absolutize_path(&self.state_store_root);
        self.log_path = absolutize_path(&self.log_path);
        if let Some(p) = self.config_path.take() {
            self.config_path = Some(absolutize_path(&p));
        }
    }

    fn validate(&self) -> Result<()> {
        if self.manifest.worker_count == 0 {
            anyhow::bail!("manifest.worker_count must be > 0");
        }
        if self.manifest.concurrent_limit == 0 {
            anyhow::bail!("manifest.concurrent_limit must be > 0");
        }
        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be > 0");
        }
        if self.manifest.retry_backoff_ms == 0 {
            anyhow::bail!("manifest.retry_backoff_ms must be > 0");
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            anyhow::bail!("config_path missing");
        };
        save_config_file(path, self)
    }
}

fn merge_manifest_config(file: Option<PartialManifestConfig>) -> ManifestUpdateConfig {
    let defaults = ManifestUpdateConfig::default();
    let Some(file) = file else { return defaults };
    ManifestUpdateConfig {
        batch_size: file.batch_size.unwrap_or(defaults.batch_size),
        batch_timeout_ms: file.batch_timeout_ms.unwrap_or(defaults.batch_timeout_ms),
        worker_count: file.worker_count.unwrap_or(defaults.worker_count),
        retry_max: file.retry_max.unwrap_or(defaults.retry_max),
        retry_backoff_ms: file.retry_backoff_ms.unwrap_or(defaults.retry_backoff_ms),
        concurrent_limit: file.concurrent_limit.unwrap_or(defaults.concurrent_limit),
    }
}

fn read_partial_file(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        return Ok(PartialConfig::default());
    }
    let data = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    serde_json::from_str(&data).context("parse config json")
}

#[derive(Debug, Serialize)]
struct PersistedConfig<'a> {
    state_store_root: &'a Path,
    log_path: &'a Path,
    include_patterns: &'a [String],
    exclude_patterns: &'a [String],
    conflict_resolution: ConflictStrategyKind,
    poll_interval_secs: u64,
    max_retries: u32,
    watch_mode: bool,
    manifest: ManifestUpdateConfig,
}

fn save_config_file(path: &Path, cfg: &EngineConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let persisted = PersistedConfig {
        state_store_root: &cfg.state_store_root,
        log_path: &cfg.log_path,
        include_patterns: &cfg.include_patterns,
        exclude_patterns: &cfg.exclude_patterns,
        conflict_resolution: cfg.conflict_resolution,
        poll_interval_secs: cfg.poll_interval.as_secs(),
        max_retries: cfg.max_retries,
        watch_mode: cfg.watch_mode,
        manifest: cfg.manifest,
    };
    let data = serde_json::to_vec_pretty(&persisted).context("serialize config")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &data).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."))
}

fn absolutize_path(path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    let abs = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join(expanded)
    };
    clean_lexical(&abs)
}

fn expand_tilde(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(c)) if c == OsStr::new("~") => {
            let mut out = home_dir();
            for c in components {
                out.push(c.as_os_str());
            }
            out
        }
        _ => path.to_path_buf(),
    }
}

fn clean_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => {
                if !pop_normal_component(&mut out) && !out.as_os_str().is_empty() {
                    out.push("..");
                }
            }
            Component::Normal(p) => out.push(p),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

fn pop_normal_component(path: &mut PathBuf) -> bool {
    let mut comps = path.components().collect::<Vec<_>>();
    match comps.pop() {
        Some(Component::Normal(_)) => {
            *path = rebuild_components(&comps);
            true
        }
        Some(Component::Prefix(_)) | Some(Component::RootDir) | None => false,
        Some(Component::CurDir) => {
            *path = rebuild_components(&comps);
            false
        }
        Some(Component::ParentDir) => {
            *path = rebuild_components(&comps);
            false
        }
    }
}

fn rebuild_components(components: &[Component<'_>]) -> PathBuf {
    let mut out = PathBuf::new();
    for c in components {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => out.push(".."),
            Component::Normal(p) => out.push(p),
        }
    }
    out
}

fn read_env_config() -> PartialConfig {
    let mut out = PartialConfig::default();
    if let Ok(v) = std::env::var("SYNCORE_STATE_STORE_ROOT") {
        if !v.trim().is_empty() {
            out.state_store_root = Some(PathBuf::from(v.trim()));
        }
    }
    if let Ok(v) = std::env::var("SYNCORE_LOG_PATH") {
        if !v.trim().is_empty() {
            out.log_path = Some(PathBuf::from(v.trim()));
        }
    }
    if let Ok(v) = std::env::var("SYNCORE_POLL_INTERVAL_SECS") {
        if let Ok(n) = v.trim().parse() {
            out.poll_interval_secs = Some(n);
        }
    }
    if let Ok(v) = std::env::var("SYNCORE_MAX_RETRIES") {
        if let Ok(n) = v.trim().parse() {
            out.max_retries = Some(n);
        }
    }
    if let Ok(v) = std::env::var("SYNCORE_WATCH_MODE") {
        if let Ok(b) = v.trim().parse() {
            out.watch_mode = Some(b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::{env, fs};

    static ENV_LOCK: once_cell::sync::Lazy<Mutex<()>> = once_cell::sync::Lazy::new(|| Mutex::new(()));

    struct EnvGuard {
        saved: HashMap<String, Option<String>>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let mut saved = HashMap::new();
            for k in keys {
                saved.insert((*k).to_string(), env::var(k).ok());
                env::remove_var(k);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain() {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    const ENV_KEYS: &[&str] = &[
        "SYNCORE_STATE_STORE_ROOT",
        "SYNCORE_LOG_PATH",
        "SYNCORE_POLL_INTERVAL_SECS",
        "SYNCORE_MAX_RETRIES",
        "SYNCORE_WATCH_MODE",
        "SYNCORE_CONFIG_PATH",
    ];

    #[test]
    fn load_from_json_and_normalize() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let tmp = env::temp_dir().join("syncore-config-test");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        let store_root = tmp.join("state").display().to_string().replace('\\', "/");
        fs::write(
            &cfg_path,
            format!(r#"{{"state_store_root": "{store_root}", "max_retries": 5}}"#),
        )
        .unwrap();

        let cfg = EngineConfig::load_with_overrides(&cfg_path, EngineConfigOverrides::default()).unwrap();
        assert_eq!(cfg.max_retries, 5);
        assert!(cfg.state_store_root.is_absolute());
        assert_eq!(cfg.config_path.as_ref().unwrap(), &cfg_path);
    }

    #[test]
    fn overrides_beat_env_beat_file_beat_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let tmp = env::temp_dir().join("syncore-config-precedence");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        fs::write(&cfg_path, r#"{"max_retries": 1}"#).unwrap();

        env::set_var("SYNCORE_MAX_RETRIES", "2");
        let cfg = EngineConfig::load_with_overrides(&cfg_path, EngineConfigOverrides::default()).unwrap();
        assert_eq!(cfg.max_retries, 2, "env should beat file");

        let overrides = EngineConfigOverrides {
            max_retries: Some(3),
            ..Default::default()
        };
        let cfg = EngineConfig::load_with_overrides(&cfg_path, overrides).unwrap();
        assert_eq!(cfg.max_retries, 3, "explicit override should beat env");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let tmp = env::temp_dir().join("syncore-config-missing");
        let _ = fs::remove_dir_all(&tmp);
        let cfg_path = tmp.join("config.json");
        let cfg = EngineConfig::load_with_overrides(&cfg_path, EngineConfigOverrides::default()).unwrap();
        assert_eq!(cfg.manifest, ManifestUpdateConfig::default());
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn rejects_zero_worker_count() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let tmp = env::temp_dir().join("syncore-config-zero-workers");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        fs::write(&cfg_path, r#"{"manifest": {"worker_count": 0}}"#).unwrap();
        let err = EngineConfig::load_with_overrides(&cfg_path, EngineConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("worker_count"));
    }

    #[test]
    fn save_then_reload_round_trips() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let tmp = env::temp_dir().join("syncore-config-roundtrip");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");

        let mut cfg = EngineConfig::load_with_overrides(&cfg_path, EngineConfigOverrides::default()).unwrap();
        cfg.max_retries = 9;
        cfg.save().unwrap();

        let reloaded = EngineConfig::load_with_overrides(&cfg_path, EngineConfigOverrides::default()).unwrap();
        assert_eq!(reloaded.max_retries, 9);
    }

    #[test]
    fn resolve_config_path_flag_beats_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(&["HOME", "SYNCORE_CONFIG_PATH"]);

        let tmp = env::temp_dir().join("syncore-config-path-flag");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        env::set_var("HOME", &tmp);

        let env_path = tmp.join("env").join("config.json");
        let flag_path = tmp.join("flag").join("config.json");
        env::set_var("SYNCORE_CONFIG_PATH", &env_path);

        let resolved = EngineConfig::resolve_config_path(Some(&flag_path));
        assert_eq!(resolved, flag_path);
    }
}
