use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

fn default_api_key_env() -> String {
    "GEMINI_KEY".to_string()
}

fn default_models() -> Vec<String> {
    vec![
        "gemini-2.0-flash".to_string(),
        "gemini-2.0-pro-exp-02-05".to_string(),
        "gemini-1.5-pro".to_string(),
        "gemini-1.5-flash".to_string(),
    ]
}

fn default_max_retries() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_verbosity() -> String {
    "standard".to_string()
}

fn default_mode() -> String {
    "balanced".to_string()
}

fn default_results_dir() -> String {
    "results".to_string()
}

fn default_gap_threshold() -> usize {
    2
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub research: ResearchConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GeminiConfig {
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_verbosity")]
    pub verbosity: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ResearchConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: String,
    #[serde(default = "default_gap_threshold")]
    pub gap_threshold: usize,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        GeminiConfig {
            api_key_env: default_api_key_env(),
            models: default_models(),
            max_retries: default_max_retries(),
            cooldown_secs: default_cooldown_secs(),
            verbosity: default_verbosity(),
        }
    }
}

impl Default for ResearchConfig {
    fn default() -> Self {
        ResearchConfig {
            mode: default_mode(),
            results_dir: default_results_dir(),
            gap_threshold: default_gap_threshold(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gemini: GeminiConfig::default(),
            research: ResearchConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => return config,
                    Err(e) => eprintln!("Error parsing config.toml: {}. Using defaults.", e),
                },
                Err(e) => eprintln!("Error reading config.toml: {}. Using defaults.", e),
            }
        } else {
            // Create config directory if it doesn't exist
            if let Some(parent) = config_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
        }

        Config::default()
    }

    pub fn get_config_path() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/deepscout/config.toml")
        } else {
            PathBuf::from("config.toml")
        }
    }

    #[allow(dead_code)]
    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/deepscout")
        } else {
            PathBuf::from(".")
        }
    }
}
