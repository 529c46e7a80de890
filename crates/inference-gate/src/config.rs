//! Configuration types and loading logic.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Environment variable that always wins for the upstream API key. The key is
/// deliberately absent from `Serialize` output so `config show`/`config init`
/// can never persist it.
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Top-level gate configuration.
///
/// Priority (highest to lowest):
/// 1. CLI flags (applied by the caller after loading)
/// 2. Environment variables (`INFERENCE_GATE_` prefix; `OPENAI_API_KEY`)
/// 3. YAML config file
/// 4. Defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL of the OpenAI-compatible upstream.
    #[serde(default = "default_upstream")]
    pub upstream: String,

    /// Never serialized: the config file must not persist credentials.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default)]
    pub verbose: bool,

    /// Model used by `test-gate` / `test-upstream`.
    #[serde(default = "default_test_model")]
    pub test_model: String,

    /// Prompt used by `test-gate` / `test-upstream`.
    #[serde(default = "default_test_prompt")]
    pub test_prompt: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8100
}

fn default_upstream() -> String {
    "https://api.openai.com".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./gate-cache")
}

fn default_test_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_test_prompt() -> String {
    "Reply with the single word: pong.".to_string()
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upstream: default_upstream(),
            api_key: None,
            cache_dir: default_cache_dir(),
            verbose: false,
            test_model: default_test_model(),
            test_prompt: default_test_prompt(),
        }
    }
}

impl GateConfig {
    /// Load configuration from the YAML file (missing files are fine) and
    /// environment variables.
    pub fn load(config_path: &Path) -> anyhow::Result<Self> {
        let mut config: GateConfig = Figment::new()
            .merge(Yaml::file(config_path))
            .merge(Env::prefixed("INFERENCE_GATE_"))
            .extract()?;

        // OPENAI_API_KEY wins over anything a config file smuggled in.
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                config.api_key = Some(key);
            }
        }

        Ok(config)
    }
}

/// Template written by `config init`. The api_key is intentionally not a
/// field here.
pub const CONFIG_TEMPLATE: &str = "\
# inference-gate configuration
#
# The upstream API key is never read from this file; export OPENAI_API_KEY
# instead. Any value can also be overridden with INFERENCE_GATE_<OPTION>
# environment variables or CLI flags.

host: \"127.0.0.1\"
port: 8100
upstream: \"https://api.openai.com\"
cache_dir: \"./gate-cache\"
verbose: false

# Used by `test-gate` and `test-upstream`.
test_model: \"gpt-4o-mini\"
test_prompt: \"Reply with the single word: pong.\"
";
