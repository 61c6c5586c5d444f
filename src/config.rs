//! Bootstrap configuration loaded from `educonnect.toml`.
//!
//! Every field has a built-in default, so a missing file (or a missing
//! section) is not an error. Secrets never live in the file: the
//! summarizer API key is read from the environment variable named by
//! `summarizer.api_key_env`.

use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "educonnect.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub summarizer: SummarizerConfig,
    pub export: ExportConfig,
    pub pagination: PaginationConfig,
}

/// Generative-AI endpoint used by `feedback.summarize`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com/v1beta/models".to_string(),
            model: "gemini-1.5-flash".to_string(),
            api_key_env: "EDUCONNECT_AI_API_KEY".to_string(),
            max_tokens: 512,
            temperature: 0.4,
            timeout_secs: 30,
        }
    }
}

impl SummarizerConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Per-student sheets beyond this count are left out of the workbook.
    pub max_student_sheets: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_student_sheets: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub default_page_size: i64,
    pub max_page_size: i64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 200,
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("invalid educonnect.toml")
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
        Self::from_toml_str(&text)
    }

    /// Resolution order: explicit `--config` path, then the workspace's own
    /// `educonnect.toml`, then built-in defaults.
    pub fn resolve(explicit: Option<&Path>, workspace: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(p) = explicit {
            return Self::load_or_default(p);
        }
        match workspace {
            Some(ws) => Self::load_or_default(&workspace_config_path(ws)),
            None => Ok(Self::default()),
        }
    }
}

pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(CONFIG_FILE_NAME)
}
