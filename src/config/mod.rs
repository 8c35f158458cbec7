//! Worker configuration
//!
//! Settings are a flat map of string keys. Resolution order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Settings file (`<data_dir>/settings.json`)
//! 3. Built-in defaults (lowest priority)
//!
//! Older installs wrote a nested `{"env": {...}}` file; that shape is
//! migrated to the flat form on first read with a one-time write-back.

mod display;

pub use display::{DetailField, DisplaySettings};

use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────────────
// Recognized keys
// ─────────────────────────────────────────────────────────────────────────────

pub const KEY_PROVIDER: &str = "CLAUDE_MEM_PROVIDER";
pub const KEY_CLAUDE_AUTH_METHOD: &str = "CLAUDE_MEM_CLAUDE_AUTH_METHOD";
pub const KEY_CLAUDE_BIN: &str = "CLAUDE_MEM_CLAUDE_BIN";
pub const KEY_GEMINI_MODEL: &str = "CLAUDE_MEM_GEMINI_MODEL";
pub const KEY_GEMINI_RATE_LIMITING: &str = "CLAUDE_MEM_GEMINI_RATE_LIMITING_ENABLED";
pub const KEY_OPENROUTER_MODEL: &str = "CLAUDE_MEM_OPENROUTER_MODEL";
pub const KEY_WORKER_PORT: &str = "CLAUDE_MEM_WORKER_PORT";
pub const KEY_WORKER_HOST: &str = "CLAUDE_MEM_WORKER_HOST";
pub const KEY_DATA_DIR: &str = "CLAUDE_MEM_DATA_DIR";
pub const KEY_SKIP_TOOLS: &str = "CLAUDE_MEM_SKIP_TOOLS";
pub const KEY_MAX_CONCURRENT_AGENTS: &str = "CLAUDE_MEM_MAX_CONCURRENT_AGENTS";
pub const KEY_MODE: &str = "CLAUDE_MEM_MODE";
pub const KEY_EXCLUDED_PROJECTS: &str = "CLAUDE_MEM_EXCLUDED_PROJECTS";
pub const KEY_QUEUE_RETRY_LIMIT: &str = "CLAUDE_MEM_QUEUE_RETRY_LIMIT";
pub const KEY_QUEUE_STALE_SECS: &str = "CLAUDE_MEM_QUEUE_STALE_SECS";
pub const KEY_IDLE_TIMEOUT_SECS: &str = "CLAUDE_MEM_IDLE_TIMEOUT_SECS";
pub const KEY_CHROMA_MODE: &str = "CLAUDE_MEM_CHROMA_MODE";
pub const KEY_CHROMA_HOST: &str = "CLAUDE_MEM_CHROMA_HOST";
pub const KEY_CHROMA_PORT: &str = "CLAUDE_MEM_CHROMA_PORT";
pub const KEY_CHROMA_SSL: &str = "CLAUDE_MEM_CHROMA_SSL";

// ─────────────────────────────────────────────────────────────────────────────
// Typed configuration
// ─────────────────────────────────────────────────────────────────────────────

/// LLM provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    #[default]
    Claude,
    Gemini,
    Openrouter,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "gemini" => Some(Self::Gemini),
            "openrouter" => Some(Self::Openrouter),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Gemini => "gemini",
            Self::Openrouter => "openrouter",
        }
    }
}

/// How the Claude adapter authenticates its subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaudeAuthMethod {
    /// OAuth token from the CLI login; managed API key stripped.
    #[default]
    Cli,
    /// Managed API key from the credential file.
    Api,
}

impl ClaudeAuthMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cli" => Some(Self::Cli),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

/// Vector-service connection mode. Only `Embedded` is implemented; the
/// other values are recognized so a settings file written for a different
/// deployment does not fail to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChromaMode {
    #[default]
    Embedded,
    Http,
}

/// Resolved worker configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub provider: ProviderKind,
    pub claude_auth_method: ClaudeAuthMethod,
    /// Explicit path to the Claude CLI binary, if configured.
    pub claude_bin: Option<String>,
    pub gemini_model: String,
    pub gemini_rate_limiting: bool,
    pub openrouter_model: String,
    pub worker_host: IpAddr,
    pub worker_port: u16,
    /// Tool names dropped at ingest.
    pub skip_tools: Vec<String>,
    pub max_concurrent_agents: usize,
    /// Mode id, optionally `parent--override`.
    pub mode: String,
    /// Comma glob list of projects the worker ignores.
    pub excluded_projects: Vec<String>,
    pub queue_retry_limit: u32,
    pub queue_stale_secs: u64,
    pub idle_timeout_secs: u64,
    pub chroma_mode: ChromaMode,
    /// Host/port/ssl for a remote vector service. Recognized for settings
    /// compatibility; only the embedded mode is implemented.
    pub chroma_host: Option<String>,
    pub chroma_port: Option<u16>,
    pub chroma_ssl: bool,
    pub display: DisplaySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            provider: ProviderKind::Claude,
            claude_auth_method: ClaudeAuthMethod::Cli,
            claude_bin: None,
            gemini_model: "gemini-2.5-flash-lite".to_string(),
            gemini_rate_limiting: true,
            openrouter_model: "google/gemini-2.5-flash-lite".to_string(),
            worker_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            worker_port: 37737,
            skip_tools: Vec::new(),
            max_concurrent_agents: 2,
            mode: "default".to_string(),
            excluded_projects: Vec::new(),
            queue_retry_limit: 3,
            queue_stale_secs: 180,
            idle_timeout_secs: 180,
            chroma_mode: ChromaMode::Embedded,
            chroma_host: None,
            chroma_port: None,
            chroma_ssl: false,
            display: DisplaySettings::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-mem")
}

impl Settings {
    /// Resolve the data directory alone. Needed before the settings file
    /// can be located (the file lives inside the data directory).
    pub fn resolve_data_dir() -> PathBuf {
        std::env::var(KEY_DATA_DIR)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir)
    }

    /// Resolve the full configuration: env > settings file > defaults.
    pub fn resolve() -> Self {
        let data_dir = Self::resolve_data_dir();
        let file = SettingsFile::load(&data_dir);
        Self::from_sources(data_dir, &file)
    }

    fn from_sources(data_dir: PathBuf, file: &SettingsFile) -> Self {
        let defaults = Settings::default();
        let get = |key: &str| -> Option<String> {
            std::env::var(key)
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| file.get(key).map(str::to_string))
        };

        let provider = get(KEY_PROVIDER)
            .and_then(|v| {
                ProviderKind::parse(&v).or_else(|| {
                    tracing::warn!("Unknown {}={:?}, using claude", KEY_PROVIDER, v);
                    None
                })
            })
            .unwrap_or(defaults.provider);

        let claude_auth_method = get(KEY_CLAUDE_AUTH_METHOD)
            .and_then(|v| ClaudeAuthMethod::parse(&v))
            .unwrap_or(defaults.claude_auth_method);

        let chroma_mode = match get(KEY_CHROMA_MODE).as_deref() {
            Some("http") => ChromaMode::Http,
            _ => ChromaMode::Embedded,
        };

        Self {
            provider,
            claude_auth_method,
            claude_bin: get(KEY_CLAUDE_BIN),
            gemini_model: get(KEY_GEMINI_MODEL).unwrap_or(defaults.gemini_model),
            gemini_rate_limiting: get(KEY_GEMINI_RATE_LIMITING)
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.gemini_rate_limiting),
            openrouter_model: get(KEY_OPENROUTER_MODEL).unwrap_or(defaults.openrouter_model),
            worker_host: get(KEY_WORKER_HOST)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.worker_host),
            worker_port: get(KEY_WORKER_PORT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.worker_port),
            skip_tools: get(KEY_SKIP_TOOLS)
                .map(|v| split_csv(&v))
                .unwrap_or(defaults.skip_tools),
            max_concurrent_agents: get(KEY_MAX_CONCURRENT_AGENTS)
                .and_then(|v| v.parse().ok())
                .filter(|n| *n >= 1)
                .unwrap_or(defaults.max_concurrent_agents),
            mode: get(KEY_MODE).unwrap_or(defaults.mode),
            excluded_projects: get(KEY_EXCLUDED_PROJECTS)
                .map(|v| split_csv(&v))
                .unwrap_or(defaults.excluded_projects),
            queue_retry_limit: get(KEY_QUEUE_RETRY_LIMIT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.queue_retry_limit),
            queue_stale_secs: get(KEY_QUEUE_STALE_SECS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.queue_stale_secs),
            idle_timeout_secs: get(KEY_IDLE_TIMEOUT_SECS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.idle_timeout_secs),
            chroma_mode,
            chroma_host: get(KEY_CHROMA_HOST),
            chroma_port: get(KEY_CHROMA_PORT).and_then(|v| v.parse().ok()),
            chroma_ssl: get(KEY_CHROMA_SSL).map(|v| parse_bool(&v)).unwrap_or(false),
            display: DisplaySettings::from_lookup(&get),
            data_dir,
        }
    }

    /// Path to the settings file inside the data directory.
    pub fn settings_path(data_dir: &Path) -> PathBuf {
        data_dir.join("settings.json")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("claude-mem.db")
    }

    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("vector-db").join("vectors.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn modes_dir(&self) -> PathBuf {
        self.data_dir.join("modes")
    }

    /// True when `project` matches any excluded glob.
    pub fn is_project_excluded(&self, project: &str) -> bool {
        self.excluded_projects
            .iter()
            .any(|pat| glob_match(pat, project))
    }

    /// Validate the parts that make the worker unusable if wrong. Called at
    /// startup; failures abort with a clear message.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_port == 0 {
            anyhow::bail!("{} must be a non-zero port", KEY_WORKER_PORT);
        }
        if self.mode.trim().is_empty() {
            anyhow::bail!("{} must not be empty", KEY_MODE);
        }
        if self.chroma_mode == ChromaMode::Http {
            tracing::warn!(
                "{}=http ({}:{} ssl={}) is not supported by this worker; vector mirror runs embedded",
                KEY_CHROMA_MODE,
                self.chroma_host.as_deref().unwrap_or("?"),
                self.chroma_port.unwrap_or(0),
                self.chroma_ssl
            );
        }
        Ok(())
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn split_csv(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Minimal `*` glob match for project exclusion patterns.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), text.as_bytes())
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings file (flat map + legacy migration)
// ─────────────────────────────────────────────────────────────────────────────

/// Raw settings file contents: a flat map of string keys.
#[derive(Debug, Clone, Default)]
pub struct SettingsFile {
    values: HashMap<String, String>,
}

impl SettingsFile {
    /// Load `<data_dir>/settings.json`. A legacy nested `{"env": {...}}`
    /// shape is flattened and written back once.
    pub fn load(data_dir: &Path) -> Self {
        let path = Settings::settings_path(data_dir);
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        let parsed: Value = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Unreadable settings file {}: {}", path.display(), e);
                return Self::default();
            }
        };

        let (values, migrated) = Self::flatten(parsed);
        let file = Self { values };
        if migrated {
            if let Err(e) = file.write_back(&path) {
                tracing::warn!("Could not migrate legacy settings file: {}", e);
            } else {
                tracing::info!("Migrated legacy settings file to flat form");
            }
        }
        file
    }

    /// Flatten the parsed JSON to a string map. Returns `(map, migrated)`
    /// where `migrated` is true when a legacy `env` object was unwrapped.
    fn flatten(parsed: Value) -> (HashMap<String, String>, bool) {
        let Value::Object(mut top) = parsed else {
            return (HashMap::new(), false);
        };

        let mut migrated = false;
        if let Some(Value::Object(env)) = top.remove("env") {
            // Legacy shape: flat keys win over nested ones on conflict.
            for (k, v) in env {
                top.entry(k).or_insert(v);
            }
            migrated = true;
        }

        let mut values = HashMap::new();
        for (k, v) in top {
            let s = match v {
                Value::String(s) => s,
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            values.insert(k, s);
        }
        (values, migrated)
    }

    fn write_back(&self, path: &Path) -> std::io::Result<()> {
        let mut map = serde_json::Map::new();
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        for k in keys {
            map.insert(k.clone(), Value::String(self.values[k].clone()));
        }
        std::fs::write(path, serde_json::to_string_pretty(&Value::Object(map))?)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_loopback() {
        let s = Settings::default();
        assert_eq!(s.worker_host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(s.max_concurrent_agents, 2);
        assert_eq!(s.provider, ProviderKind::Claude);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            Settings::settings_path(dir.path()),
            r#"{"CLAUDE_MEM_PROVIDER":"gemini","CLAUDE_MEM_WORKER_PORT":"4100","CLAUDE_MEM_MAX_CONCURRENT_AGENTS":3}"#,
        )
        .unwrap();

        let file = SettingsFile::load(dir.path());
        let s = Settings::from_sources(dir.path().to_path_buf(), &file);
        assert_eq!(s.provider, ProviderKind::Gemini);
        assert_eq!(s.worker_port, 4100);
        assert_eq!(s.max_concurrent_agents, 3);
    }

    #[test]
    fn legacy_env_shape_is_migrated_and_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = Settings::settings_path(dir.path());
        std::fs::write(&path, r#"{"env":{"CLAUDE_MEM_PROVIDER":"openrouter"}}"#).unwrap();

        let file = SettingsFile::load(dir.path());
        assert_eq!(file.get(KEY_PROVIDER), Some("openrouter"));

        // Write-back produced the flat shape.
        let rewritten: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(rewritten.get("env").is_none());
        assert_eq!(rewritten[KEY_PROVIDER], "openrouter");
    }

    #[test]
    fn excluded_projects_glob() {
        let mut s = Settings::default();
        s.excluded_projects = vec!["scratch-*".into(), "tmp".into()];
        assert!(s.is_project_excluded("scratch-1"));
        assert!(s.is_project_excluded("tmp"));
        assert!(!s.is_project_excluded("demo"));
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("nope"));
    }
}
