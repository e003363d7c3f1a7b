use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Base directory for all persisted state.  Overridden at runtime by the
    /// `MERIDIAN_BASE_DIR` environment variable when set.
    pub base_dir: String,
    pub identity: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Meridian".to_string(),
            base_dir: default_base_dir(),
            identity: "I'm Meridian, a local AI assistant running entirely on your device. \
                       I can execute code, manage files, and help with development tasks \
                       while keeping your data private and working offline."
                .to_string(),
        }
    }
}

fn default_base_dir() -> String {
    env::var("HOME")
        .map(|home| format!("{home}/.meridian"))
        .unwrap_or_else(|_| ".meridian".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub binary_path: String,
    pub model_path: String,
    pub max_tokens: u32,
    pub threads: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub context_size: u32,
    pub repeat_penalty: f32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            binary_path: "./llama.cpp/build/bin/llama-cli".to_string(),
            model_path: "./models/CodeLlama-7B-Instruct.Q4_K_M.gguf".to_string(),
            max_tokens: 150,
            threads: 8,
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            context_size: 1024,
            repeat_penalty: 1.1,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub session_size: usize,
    pub long_term_size: usize,
    pub max_age_days: i64,
    pub prune_threshold: f64,
    pub relevance_window: usize,
    pub relevance_floor: f64,
    pub relevance_top_k: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            session_size: 20,
            long_term_size: 1000,
            max_age_days: 90,
            prune_threshold: 0.8,
            relevance_window: 100,
            relevance_floor: 0.2,
            relevance_top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub sync_interval_secs: u64,
    /// ISO date past which the local model is presumed uninformed.
    pub knowledge_cutoff: String,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 60,
            knowledge_cutoff: "2023-12-31".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub max_workers: usize,
    pub overall_timeout_secs: u64,
    pub per_source_timeout_secs: u64,
    pub cache_ttl_minutes: u64,
    pub use_cache: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            overall_timeout_secs: 15,
            per_source_timeout_secs: 10,
            cache_ttl_minutes: 15,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistConfig {
    pub enabled: bool,
    pub per_source_timeout_secs: u64,
    pub websearch_min_confidence: f64,
    pub uncertainty_threshold: f64,
    /// Companion assist endpoint consulted as the final cascade step.
    pub claude_endpoint: String,
    /// Environment variable holding the optional assist API key.
    pub api_key_env: String,
    pub perplexity_command: String,
}

impl Default for AssistConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_source_timeout_secs: 30,
            websearch_min_confidence: 0.5,
            uncertainty_threshold: 0.6,
            claude_endpoint: "http://127.0.0.1:5051/assist".to_string(),
            api_key_env: "MERIDIAN_ASSIST_KEY".to_string(),
            perplexity_command: "perplexity".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub exec_timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5050,
            api_key: "localonly".to_string(),
            exec_timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    pub battery_threshold_pct: u8,
    pub temp_threshold_c: f64,
    pub profile_ttl_hours: i64,
    /// Environment variable pointing at the NPU vendor SDK root.
    pub npu_sdk_env: String,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            battery_threshold_pct: 20,
            temp_threshold_c: 70.0,
            profile_ttl_hours: 24,
            npu_sdk_env: "QNN_SDK_ROOT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub clock: ClockConfig,
    pub search: SearchConfig,
    pub assist: AssistConfig,
    pub bridge: BridgeConfig,
    pub accel: AccelConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("MERIDIAN_BASE_DIR") {
            if !value.is_empty() {
                config.agent.base_dir = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn base_dir(&self) -> PathBuf {
        PathBuf::from(&self.agent.base_dir)
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.base_dir().join("memory")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_dir().join("cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir().join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = AppConfig::default();
        assert_eq!(config.memory.session_size, 20);
        assert_eq!(config.memory.long_term_size, 1000);
        assert_eq!(config.clock.knowledge_cutoff, "2023-12-31");
        assert_eq!(config.assist.uncertainty_threshold, 0.6);
        assert_eq!(config.bridge.host, "127.0.0.1");
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let config = AppConfig::load_from("/nonexistent/meridian.toml").unwrap();
        assert_eq!(config.search.max_workers, 3);
    }

    #[test]
    fn roundtrip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.toml");

        let mut config = AppConfig::default();
        config.llm.max_tokens = 512;
        config.search.cache_ttl_minutes = 5;
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.llm.max_tokens, 512);
        assert_eq!(loaded.search.cache_ttl_minutes, 5);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meridian.toml");
        fs::write(&path, "[llm]\nthreads = 4\n").unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.llm.threads, 4);
        assert_eq!(loaded.llm.max_tokens, 150);
        assert_eq!(loaded.memory.session_size, 20);
    }
}
