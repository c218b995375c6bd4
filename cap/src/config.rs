//! Capstan configuration types and loading
//!
//! YAML config with a fallback chain (explicit path, project-local
//! `.capstan.yml`, user config dir) and environment overrides for the
//! deployment-sensitive values.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapstanConfig {
    /// Model provider configuration
    pub provider: ProviderConfig,

    /// Artifact and store directories
    pub dirs: DirsConfig,

    /// Runtime tuning
    pub runtime: RuntimeConfig,
}

impl CapstanConfig {
    /// Load configuration with fallback chain, then apply env overrides
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()))?
        } else {
            Self::load_default_chain()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_default_chain() -> Self {
        let local = PathBuf::from(".capstan.yml");
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user = config_dir.join("capstan").join("capstan.yml");
            if user.exists() {
                match Self::load_from_file(&user) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Self::default()
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Environment variables win over file values
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("CAPSTAN_BASE_URL") {
            self.provider.base_url = v;
        }
        if let Ok(v) = env::var("CAPSTAN_API_KEY_ENV") {
            self.provider.api_key_env = v;
        }
        if let Ok(v) = env::var("CAPSTAN_DEFAULT_MODEL") {
            self.provider.default_model = v;
        }
        if let Ok(v) = env::var("CAPSTAN_REWRITE_MODEL") {
            self.provider.rewrite_model = Some(v);
        }
        if let Ok(v) = env::var("CAPSTAN_DATA_DIR") {
            self.dirs.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CAPSTAN_SESSION_DIR") {
            self.dirs.session_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CAPSTAN_IMAGE_DIR") {
            self.dirs.image_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CAPSTAN_AUDIO_DIR") {
            self.dirs.audio_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CAPSTAN_GRAPH_DIR") {
            self.dirs.graph_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("CAPSTAN_TACKLE_DIRS") {
            self.dirs.tackle_dirs = v.split(':').map(PathBuf::from).collect();
        }
        if let Ok(v) = env::var("CAPSTAN_HEARTBEAT_SECS")
            && let Ok(parsed) = v.parse()
        {
            self.runtime.heartbeat_secs = parsed;
        }
        if let Ok(v) = env::var("CAPSTAN_COST_FETCH_DELAY_SECS")
            && let Ok(parsed) = v.parse()
        {
            self.runtime.cost_fetch_delay_secs = parsed;
        }
        if let Ok(v) = env::var("CAPSTAN_KEEP_RECENT_TURNS")
            && let Ok(parsed) = v.parse()
        {
            self.runtime.keep_recent_turns = parsed;
        }
        if let Ok(v) = env::var("CAPSTAN_KEEP_RECENT_IMAGES")
            && let Ok(parsed) = v.parse()
        {
            self.runtime.keep_recent_images = parsed;
        }
    }
}

/// Model provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API base URL (OpenAI-compatible chat completions)
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// Model used when a phase declares none
    #[serde(rename = "default-model")]
    pub default_model: String,

    /// Model used by the rewrite mutator; defaults to the default model
    #[serde(rename = "rewrite-model")]
    pub rewrite_model: Option<String>,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl ProviderConfig {
    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        env::var(&self.api_key_env).ok()
    }

    pub fn rewrite_model(&self) -> &str {
        self.rewrite_model.as_deref().unwrap_or(&self.default_model)
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            default_model: "anthropic/claude-sonnet-4".to_string(),
            rewrite_model: None,
            max_tokens: 16384,
            timeout_ms: 300_000,
        }
    }
}

/// Artifact and store directories
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirsConfig {
    /// Unified log database directory
    #[serde(rename = "data-dir")]
    pub data_dir: PathBuf,

    /// Session store directory
    #[serde(rename = "session-dir")]
    pub session_dir: PathBuf,

    /// Root for images: {image_dir}/{session}/{phase}/image_{n}.{ext}
    #[serde(rename = "image-dir")]
    pub image_dir: PathBuf,

    /// Root for audio artifacts, same layout as images
    #[serde(rename = "audio-dir")]
    pub audio_dir: PathBuf,

    /// Root for trace diagrams: {graph_dir}/{session}.mmd
    #[serde(rename = "graph-dir")]
    pub graph_dir: PathBuf,

    /// Directories scanned for cascade tool definitions
    #[serde(rename = "tackle-dirs")]
    pub tackle_dirs: Vec<PathBuf>,
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            session_dir: PathBuf::from("sessions"),
            image_dir: PathBuf::from("images"),
            audio_dir: PathBuf::from("audio"),
            graph_dir: PathBuf::from("graphs"),
            tackle_dirs: vec![PathBuf::from("tackle")],
        }
    }
}

/// Runtime tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Seconds between heartbeat writes while a session runs
    #[serde(rename = "heartbeat-secs")]
    pub heartbeat_secs: u64,

    /// Seconds a row ages before the first cost lookup
    #[serde(rename = "cost-fetch-delay-secs")]
    pub cost_fetch_delay_secs: u64,

    /// Conversation turns kept when culling history
    #[serde(rename = "keep-recent-turns")]
    pub keep_recent_turns: usize,

    /// Base64 images kept when culling history
    #[serde(rename = "keep-recent-images")]
    pub keep_recent_images: usize,

    /// Default sounding worker cap when a phase declares none
    #[serde(rename = "max-parallel")]
    pub max_parallel: usize,
}

impl RuntimeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: 30,
            cost_fetch_delay_secs: 3,
            keep_recent_turns: 10,
            keep_recent_images: 3,
            max_parallel: 3,
        }
    }
}
