use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub estimator: EstimatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub base_url: String,
    /// Bearer token; `SUMFLOW_TOKEN` takes precedence when set.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_upload_path")]
    pub upload_path: String,
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default = "default_batch_status_path")]
    pub batch_status_path: String,
    #[serde(default = "default_commit_path")]
    pub commit_path: String,
}

fn default_timeout_secs() -> u64 {
    600
}
fn default_upload_path() -> String {
    "/upload".to_string()
}
fn default_status_path() -> String {
    "/task/status".to_string()
}
fn default_batch_status_path() -> String {
    "/task/status/batch".to_string()
}
fn default_commit_path() -> String {
    "/commit".to_string()
}

impl ServerConfig {
    /// Token from the environment, falling back to the config file.
    pub fn resolved_token(&self) -> Option<String> {
        std::env::var("SUMFLOW_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.token.clone().filter(|t| !t.trim().is_empty()))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub params: ProcessingParams,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_size_mb: default_max_size_mb(),
            allowed_extensions: default_allowed_extensions(),
            exclude_globs: Vec::new(),
            params: ProcessingParams::default(),
        }
    }
}

fn default_max_concurrency() -> usize {
    10
}
fn default_max_size_mb() -> u64 {
    1000
}
fn default_allowed_extensions() -> Vec<String> {
    [
        ".pdf", ".hwp", ".hwpx", ".doc", ".docx", ".ppt", ".pptx", ".xls", ".xlsx", ".zip",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl UploadConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    /// Case-insensitive check of a `.ext` suffix against the allow-list.
    pub fn is_allowed_extension(&self, ext: &str) -> bool {
        let ext = ext.to_lowercase();
        self.allowed_extensions
            .iter()
            .any(|a| a.to_lowercase() == ext)
    }
}

/// Fixed OCR/summarization parameters sent with every upload.
#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingParams {
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_prep")]
    pub prep: String,
    #[serde(default = "default_langs")]
    pub langs: String,
    #[serde(default = "default_psm")]
    pub psm: u32,
    #[serde(default = "default_true")]
    pub do_llm_summary: bool,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
}

impl Default for ProcessingParams {
    fn default() -> Self {
        Self {
            dpi: default_dpi(),
            prep: default_prep(),
            langs: default_langs(),
            psm: default_psm(),
            do_llm_summary: true,
            llm_model: default_llm_model(),
        }
    }
}

fn default_dpi() -> u32 {
    300
}
fn default_prep() -> String {
    "adaptive".to_string()
}
fn default_langs() -> String {
    "kor+eng".to_string()
}
fn default_psm() -> u32 {
    6
}
fn default_true() -> bool {
    true
}
fn default_llm_model() -> String {
    "gemma3-summarizer".to_string()
}

impl ProcessingParams {
    /// Form fields in the order the ingestion endpoint expects them.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("dpi", self.dpi.to_string()),
            ("prep", self.prep.clone()),
            ("langs", self.langs.clone()),
            ("psm", self.psm.to_string()),
            ("do_llm_summary", self.do_llm_summary.to_string()),
            ("llm_model", self.llm_model.clone()),
        ]
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

fn default_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EstimatorConfig {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    #[serde(default = "default_min_elapsed_secs")]
    pub min_elapsed_secs: f64,
    #[serde(default = "default_min_eta_secs")]
    pub min_eta_secs: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            window_secs: default_window_secs(),
            min_samples: default_min_samples(),
            min_elapsed_secs: default_min_elapsed_secs(),
            min_eta_secs: default_min_eta_secs(),
        }
    }
}

fn default_alpha() -> f64 {
    0.25
}
fn default_window_secs() -> f64 {
    5.0
}
fn default_min_samples() -> usize {
    2
}
fn default_min_elapsed_secs() -> f64 {
    1.5
}
fn default_min_eta_secs() -> f64 {
    3.0
}

impl Config {
    /// Defaults for commands that run without a config file (`scan`).
    pub fn minimal() -> Self {
        Self {
            server: ServerConfig {
                base_url: "http://127.0.0.1:4000".to_string(),
                token: None,
                timeout_secs: default_timeout_secs(),
                upload_path: default_upload_path(),
                status_path: default_status_path(),
                batch_status_path: default_batch_status_path(),
                commit_path: default_commit_path(),
            },
            upload: UploadConfig::default(),
            poll: PollConfig::default(),
            estimator: EstimatorConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let url = url::Url::parse(&config.server.base_url)
        .with_context(|| format!("server.base_url is not a URL: {}", config.server.base_url))?;
    match url.scheme() {
        "http" | "https" => {}
        other => anyhow::bail!("server.base_url must be http or https, got '{}'", other),
    }

    if config.upload.max_concurrency == 0 {
        anyhow::bail!("upload.max_concurrency must be >= 1");
    }
    if config.upload.max_size_mb == 0 {
        anyhow::bail!("upload.max_size_mb must be >= 1");
    }
    if config.poll.interval_ms < 100 {
        anyhow::bail!("poll.interval_ms must be >= 100");
    }
    if !(config.estimator.alpha > 0.0 && config.estimator.alpha <= 1.0) {
        anyhow::bail!("estimator.alpha must be in (0.0, 1.0]");
    }
    if config.estimator.min_samples < 2 {
        anyhow::bail!("estimator.min_samples must be >= 2");
    }

    Ok(())
}

/// Commented example written by `sumflow init`.
pub const EXAMPLE_CONFIG: &str = r#"[server]
base_url = "http://127.0.0.1:4000"
# token = "..."            # or set SUMFLOW_TOKEN
timeout_secs = 600
upload_path = "/upload"
status_path = "/task/status"
batch_status_path = "/task/status/batch"
commit_path = "/commit"

[upload]
max_concurrency = 10
max_size_mb = 1000
allowed_extensions = [".pdf", ".hwp", ".hwpx", ".doc", ".docx", ".ppt", ".pptx", ".xls", ".xlsx", ".zip"]
exclude_globs = []

[upload.params]
dpi = 300
prep = "adaptive"
langs = "kor+eng"
psm = 6
do_llm_summary = true
llm_model = "gemma3-summarizer"

[poll]
interval_ms = 1000

[estimator]
alpha = 0.25
window_secs = 5.0
min_samples = 2
min_elapsed_secs = 1.5
min_eta_secs = 3.0
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn example_config_parses_and_validates() {
        let config: Config = toml::from_str(EXAMPLE_CONFIG).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.upload.max_concurrency, 10);
        assert_eq!(config.poll.interval_ms, 1000);
        assert!((config.estimator.alpha - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn server_section_alone_uses_defaults() {
        let config: Config = toml::from_str("[server]\nbase_url = \"http://localhost:4000\"\n").unwrap();
        validate(&config).unwrap();
        assert_eq!(config.server.commit_path, "/commit");
        assert_eq!(config.upload.max_size_mb, 1000);
        assert!(config.upload.is_allowed_extension(".PDF"));
        assert!(!config.upload.is_allowed_extension(".exe"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        let mut config = Config::minimal();
        config.upload.max_concurrency = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_non_http_base_url() {
        let mut config = Config::minimal();
        config.server.base_url = "ftp://example.com".to_string();
        assert!(validate(&config).is_err());
    }
}
