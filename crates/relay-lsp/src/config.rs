//! Workspace configuration for relay-lsp.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub(crate) const CONFIG_FILES: &[&str] = &["relay-lsp.toml", ".relay-lsp.toml"];

const READINESS_PREFIX: &str = "Child server listening on port ";

/// Relay configuration loaded from `relay-lsp.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayConfig {
    /// Config file path (if found).
    pub config_path: Option<PathBuf>,
    /// How to launch and reach the analysis engine.
    pub engine: EngineConfig,
    /// Socket bridge limits.
    pub bridge: BridgeConfig,
    /// Demo countdown timing.
    pub countdown: CountdownConfig,
}

/// Engine launch settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Working directory for the engine process.
    pub cwd: Option<PathBuf>,
    pub host: String,
    /// Port the engine announces in its readiness line.
    pub port: u16,
    /// Wait between readiness and the first connection attempt.
    pub settle_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: "python".to_string(),
            args: vec!["-u".to_string(), "child.py".to_string()],
            cwd: None,
            host: "localhost".to_string(),
            port: 51734,
            settle_delay: Duration::from_millis(1000),
        }
    }
}

impl EngineConfig {
    /// The exact stdout line the engine prints once its listener is bound.
    pub fn readiness_line(&self) -> String {
        format!("{READINESS_PREFIX}{}", self.port)
    }

    /// Socket URL for a port announced by the engine.
    pub fn socket_url(&self, port: u16) -> String {
        format!("ws://{}:{port}", self.host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// How long the engine may take to answer before the connection is
    /// re-established.
    pub reply_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountdownConfig {
    pub start: u32,
    pub step: Duration,
}

impl Default for CountdownConfig {
    fn default() -> Self {
        Self {
            start: 10,
            step: Duration::from_millis(1000),
        }
    }
}

impl RelayConfig {
    /// Load configuration for a workspace root.
    pub fn load(root: &Path) -> Self {
        let Some(path) = find_config_file(root) else {
            return RelayConfig::default();
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => RelayConfig::from_contents(root, Some(path), &contents),
            Err(err) => {
                warn!("Failed to read relay-lsp config at {}: {err}", path.display());
                RelayConfig::default()
            }
        }
    }

    /// Load an explicitly named config file. Errors are returned to the caller.
    pub fn load_file(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let root = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(RelayConfig::from_contents(
            root,
            Some(path.to_path_buf()),
            &contents,
        ))
    }

    pub fn from_contents(root: &Path, config_path: Option<PathBuf>, contents: &str) -> Self {
        let mut config = RelayConfig {
            config_path,
            ..RelayConfig::default()
        };
        let parsed: ConfigFile = match toml::from_str(contents) {
            Ok(parsed) => parsed,
            Err(err) => {
                if let Some(path) = &config.config_path {
                    warn!(
                        "Failed to parse relay-lsp config at {}: {err}",
                        path.display()
                    );
                } else {
                    warn!("Failed to parse relay-lsp config: {err}");
                }
                return config;
            }
        };

        config.engine = EngineConfig::from_section(root, parsed.engine);
        config.bridge = parsed.bridge.into();
        config.countdown = parsed.countdown.into();
        config
    }
}

impl EngineConfig {
    fn from_section(root: &Path, section: EngineSection) -> Self {
        let defaults = EngineConfig::default();
        EngineConfig {
            command: section.command.unwrap_or(defaults.command),
            args: section.args.unwrap_or(defaults.args),
            cwd: section.cwd.map(|cwd| resolve_path(root, &cwd)),
            host: section.host.unwrap_or(defaults.host),
            port: section.port.unwrap_or(defaults.port),
            settle_delay: section
                .settle_delay_ms
                .map_or(defaults.settle_delay, Duration::from_millis),
        }
    }
}

impl From<BridgeSection> for BridgeConfig {
    fn from(section: BridgeSection) -> Self {
        let defaults = BridgeConfig::default();
        BridgeConfig {
            // A zero timeout would reconnect on every request.
            reply_timeout: section
                .reply_timeout_ms
                .filter(|ms| *ms > 0)
                .map_or(defaults.reply_timeout, Duration::from_millis),
        }
    }
}

impl From<CountdownSection> for CountdownConfig {
    fn from(section: CountdownSection) -> Self {
        let defaults = CountdownConfig::default();
        CountdownConfig {
            start: section.start.unwrap_or(defaults.start),
            step: section
                .step_ms
                .map_or(defaults.step, Duration::from_millis),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    engine: EngineSection,
    #[serde(default)]
    bridge: BridgeSection,
    #[serde(default)]
    countdown: CountdownSection,
}

#[derive(Debug, Default, Deserialize)]
struct EngineSection {
    command: Option<String>,
    args: Option<Vec<String>>,
    cwd: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    settle_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BridgeSection {
    reply_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CountdownSection {
    start: Option<u32>,
    step_ms: Option<u64>,
}

pub(crate) fn find_config_file(root: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
}

fn resolve_path(root: &Path, entry: &str) -> PathBuf {
    let path = PathBuf::from(entry);
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("{prefix}-{stamp}"));
        fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn missing_config_uses_defaults() {
        let root = temp_dir("relaylsp-config-missing");
        let config = RelayConfig::load(&root);
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.engine.command, "python");
        assert_eq!(config.engine.args, vec!["-u", "child.py"]);
        assert_eq!(config.engine.port, 51734);
        assert_eq!(config.engine.settle_delay, Duration::from_millis(1000));
        assert_eq!(config.countdown.start, 10);
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn loads_engine_bridge_and_countdown_sections() {
        let root = temp_dir("relaylsp-config");
        let config_path = root.join("relay-lsp.toml");
        fs::write(
            &config_path,
            r#"
[engine]
command = "node"
args = ["engine.js", "--quiet"]
cwd = "server"
host = "127.0.0.1"
port = 40000
settle_delay_ms = 50

[bridge]
reply_timeout_ms = 250

[countdown]
start = 3
step_ms = 20
"#,
        )
        .expect("write config");

        let config = RelayConfig::load(&root);
        assert_eq!(config.config_path.as_deref(), Some(config_path.as_path()));
        assert_eq!(config.engine.command, "node");
        assert_eq!(config.engine.args, vec!["engine.js", "--quiet"]);
        assert_eq!(config.engine.cwd, Some(root.join("server")));
        assert_eq!(config.engine.port, 40000);
        assert_eq!(config.engine.settle_delay, Duration::from_millis(50));
        assert_eq!(config.bridge.reply_timeout, Duration::from_millis(250));
        assert_eq!(config.countdown.start, 3);
        assert_eq!(config.countdown.step, Duration::from_millis(20));
        assert_eq!(
            config.engine.readiness_line(),
            "Child server listening on port 40000"
        );
        assert_eq!(config.engine.socket_url(40000), "ws://127.0.0.1:40000");
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn invalid_toml_falls_back_to_defaults() {
        let root = PathBuf::from("/workspace");
        let config = RelayConfig::from_contents(&root, None, "[engine\nport = 1");
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn zero_reply_timeout_is_ignored() {
        let root = PathBuf::from("/workspace");
        let config = RelayConfig::from_contents(&root, None, "[bridge]\nreply_timeout_ms = 0\n");
        assert_eq!(config.bridge.reply_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn hidden_config_file_is_discovered() {
        let root = temp_dir("relaylsp-config-hidden");
        fs::write(root.join(".relay-lsp.toml"), "[engine]\nport = 1234\n").expect("write config");
        let config = RelayConfig::load(&root);
        assert_eq!(config.engine.port, 1234);
        fs::remove_dir_all(root).ok();
    }
}
