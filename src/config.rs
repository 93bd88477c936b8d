use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Default config directory: ~/.glimpse/
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".glimpse")
}

/// Default config file path: ~/.glimpse/settings.json
pub fn default_config_path() -> PathBuf {
    config_dir().join("settings.json")
}

pub const API_KEY_VAR: &str = "Z_AI_API_KEY";
pub const MODE_VAR: &str = "Z_AI_MODE";
/// Name the rest of the agent uses for the same key.
const API_KEY_ALT_VAR: &str = "ZAI_API_KEY";

pub const DEFAULT_PROMPT: &str = "\
Analyze this game screenshot. Report only what you can clearly see:\n\
1. Readable text: dialogue, menus, signs or UI text that is legible.\n\
2. Player position: where the player character is on screen.\n\
3. Visible characters: non-player characters you can clearly identify.\n\
4. UI elements: health bars, menu cursors, battle interfaces, text boxes.\n\
5. Obstacles: objects, walls, trees or barriers that are clearly visible.\n\
Be strictly factual. If text is too small to read, say 'text unreadable'. \
Do not speculate about anything off screen.";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// How to launch the vision server subprocess.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub api_key: Option<String>,
    pub mode: String,
    /// Extra environment for the subprocess.
    pub env: HashMap<String, String>,
    pub warmup_ms: u64,
    pub stop_grace_ms: u64,
    pub max_line_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Name of the remote tool that analyzes images.
    pub tool: String,
    /// Argument key carrying the image path.
    pub image_argument: String,
    pub default_prompt: String,
    /// Extra substrings that mark a result as capability text, not image content.
    pub contamination_markers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub list_tools_ms: u64,
    pub analyze_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Retry until the server answers.
    #[default]
    Blocking,
    /// One attempt per call, then back off and report "unavailable".
    Soft,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub mode: RetryMode,
    pub interval_ms: u64,
    pub soft_base_ms: u64,
    pub soft_max_ms: u64,
}

fn default_version() -> u32 {
    1
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            server: ServerConfig::default(),
            analysis: AnalysisConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "@z_ai/mcp-server".to_string()],
            api_key: None,
            mode: "ZAI".to_string(),
            env: HashMap::new(),
            warmup_ms: 2000,
            stop_grace_ms: 3000,
            max_line_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            tool: "image_analysis".to_string(),
            image_argument: "image_source".to_string(),
            default_prompt: DEFAULT_PROMPT.to_string(),
            contamination_markers: Vec::new(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            list_tools_ms: 10_000,
            analyze_ms: 60_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            mode: RetryMode::Blocking,
            interval_ms: 1000,
            soft_base_ms: 30_000,
            soft_max_ms: 300_000,
        }
    }
}

impl ServerConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Environment for the subprocess: credentials and mode, then extras.
    pub fn process_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(self.env.len() + 2);
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.is_empty()) {
            env.push((API_KEY_VAR.to_string(), key.clone()));
        }
        env.push((MODE_VAR.to_string(), self.mode.clone()));
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

impl TimeoutConfig {
    pub fn list_tools(&self) -> Duration {
        Duration::from_millis(self.list_tools_ms)
    }

    pub fn analyze(&self) -> Duration {
        Duration::from_millis(self.analyze_ms)
    }
}

impl RetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Settings file if present, defaults otherwise; env overrides on top.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        Ok(config.with_env_overrides())
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let key = lookup(API_KEY_VAR)
            .or_else(|| lookup(API_KEY_ALT_VAR))
            .filter(|k| !k.is_empty());
        if key.is_some() {
            self.server.api_key = key;
        }
        if let Some(mode) = lookup(MODE_VAR).filter(|m| !m.is_empty()) {
            self.server.mode = mode;
        }
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.server.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"command": "vision-server", "warmup_ms": 10},
                "retry": {"mode": "soft"}}"#,
        )
        .unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.server.command, "vision-server");
        assert_eq!(cfg.server.warmup(), Duration::from_millis(10));
        assert_eq!(cfg.server.stop_grace_ms, 3000);
        assert_eq!(cfg.analysis.tool, "image_analysis");
        assert_eq!(cfg.retry.mode, RetryMode::Soft);
        assert_eq!(cfg.timeouts.analyze(), Duration::from_secs(60));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig::load_or_default(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.server.command, "npx");
        assert_eq!(cfg.retry.mode, RetryMode::Blocking);
    }

    #[test]
    fn unparseable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = AppConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn env_overrides_prefer_primary_key_var() {
        let env: HashMap<&str, &str> = [
            ("Z_AI_API_KEY", "primary"),
            ("ZAI_API_KEY", "alt"),
            ("Z_AI_MODE", "CUSTOM"),
        ]
        .into();
        let cfg = AppConfig::default()
            .with_overrides_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.server.api_key.as_deref(), Some("primary"));
        assert_eq!(cfg.server.mode, "CUSTOM");
        assert!(cfg.has_api_key());
    }

    #[test]
    fn alt_key_var_is_accepted() {
        let cfg = AppConfig::default().with_overrides_from(|k| {
            (k == "ZAI_API_KEY").then(|| "alt".to_string())
        });
        assert_eq!(cfg.server.api_key.as_deref(), Some("alt"));
        assert_eq!(cfg.server.mode, "ZAI");
    }

    #[test]
    fn process_env_carries_credentials_and_extras() {
        let mut server = ServerConfig {
            api_key: Some("k".to_string()),
            ..ServerConfig::default()
        };
        server.env.insert("NODE_OPTIONS".to_string(), "--no-warnings".to_string());
        let env = server.process_env();
        assert!(env.contains(&("Z_AI_API_KEY".to_string(), "k".to_string())));
        assert!(env.contains(&("Z_AI_MODE".to_string(), "ZAI".to_string())));
        assert!(env.contains(&("NODE_OPTIONS".to_string(), "--no-warnings".to_string())));
    }
}
