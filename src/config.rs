//! TOML configuration.
//!
//! See the `[pipeline]`, `[state]`, `[source]`, `[converter]` and `[output]`
//! sections below. Every section except `[source]` has workable defaults;
//! [`load_config`] validates cross-field constraints so misconfiguration is
//! caught at startup rather than mid-cycle.
//!
//! Every path may start with `~` and may reference environment variables as
//! `$VAR` or `${VAR}`. Unknown variables are left as written.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DRIVE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub state: StateConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub record_failures: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
            record_failures: true,
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./data/ledger.json")
}

fn default_true() -> bool {
    true
}

// ============ Source ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceProvider {
    GoogleDrive,
    Local,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub provider: SourceProvider,
    pub google_drive: Option<DriveSourceConfig>,
    pub local: Option<LocalSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DriveSourceConfig {
    pub folder_id: String,
    pub client_secrets: PathBuf,
    /// Defaults to `<client_secrets stem>_token.json` beside the secrets file.
    #[serde(default)]
    pub token_cache: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    #[serde(default = "default_drive_api_base")]
    pub api_base: String,
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl DriveSourceConfig {
    pub fn token_cache_path(&self) -> PathBuf {
        if let Some(path) = &self.token_cache {
            return path.clone();
        }
        let stem = self
            .client_secrets
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "client_secrets".to_string());
        self.client_secrets
            .with_file_name(format!("{}_token.json", stem))
    }
}

fn default_page_size() -> u32 {
    100
}
fn default_scopes() -> Vec<String> {
    vec![DRIVE_READONLY_SCOPE.to_string()]
}
fn default_mime_type() -> String {
    "application/pdf".to_string()
}
fn default_drive_api_base() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}
fn default_http_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalSourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_local_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub recursive: bool,
}

fn default_local_globs() -> Vec<String> {
    vec!["*.pdf".to_string()]
}

// ============ Converter ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConverterProvider {
    #[default]
    Simple,
    Gemini,
}

/// What each document becomes.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversionMode {
    #[default]
    Markdown,
    Mindmap,
    /// Title hashtags first, then the backend's classification.
    Auto,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConverterConfig {
    #[serde(default)]
    pub provider: ConverterProvider,
    #[serde(default)]
    pub mode: ConversionMode,
    #[serde(default)]
    pub model: Option<String>,
    /// Falls back to `GEMINI_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_gemini_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub prompt_path: Option<PathBuf>,
    #[serde(default)]
    pub mindmap_prompt_path: Option<PathBuf>,
    #[serde(default)]
    pub classifier_prompt_path: Option<PathBuf>,
    /// `auto` mode: a title containing `#<tag>` is always a mind map.
    #[serde(default = "default_mindmap_hashtags")]
    pub mindmap_hashtags: Vec<String>,
    /// `auto` mode: ask the backend when no hashtag matches.
    #[serde(default = "default_true")]
    pub classify: bool,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_converter_timeout")]
    pub timeout_secs: u64,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            provider: ConverterProvider::Simple,
            mode: ConversionMode::Markdown,
            model: None,
            api_key: None,
            endpoint: default_gemini_endpoint(),
            prompt_path: None,
            mindmap_prompt_path: None,
            classifier_prompt_path: None,
            mindmap_hashtags: default_mindmap_hashtags(),
            classify: true,
            temperature: 0.0,
            timeout_secs: default_converter_timeout(),
        }
    }
}

fn default_gemini_endpoint() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_mindmap_hashtags() -> Vec<String> {
    vec!["mm".to_string(), "mindmap".to_string()]
}
fn default_converter_timeout() -> u64 {
    120
}

// ============ Output ============

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputProvider {
    #[default]
    Filesystem,
    Git,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssetMode {
    #[default]
    Pdf,
    Png,
    Jpg,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default)]
    pub provider: OutputProvider,
    /// Markdown directory. For the git sink it is relative to the repository.
    #[serde(default = "default_output_dir")]
    pub directory: PathBuf,
    /// No assets are written when unset.
    #[serde(default)]
    pub asset_directory: Option<PathBuf>,
    #[serde(default)]
    pub asset_mode: AssetMode,
    #[serde(default)]
    pub asset_invert: bool,
    #[serde(default = "default_page_width")]
    pub page_width: u32,
    #[serde(default = "default_true")]
    pub optimize_images: bool,
    pub git: Option<GitOutputConfig>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            provider: OutputProvider::Filesystem,
            directory: default_output_dir(),
            asset_directory: None,
            asset_mode: AssetMode::Pdf,
            asset_invert: false,
            page_width: default_page_width(),
            optimize_images: true,
            git: None,
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./notes")
}
fn default_page_width() -> u32 {
    800
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitOutputConfig {
    pub repository_path: PathBuf,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_remote")]
    pub remote: String,
    #[serde(default = "default_commit_template")]
    pub commit_message_template: String,
    #[serde(default)]
    pub push: bool,
    #[serde(default = "default_true")]
    pub embed_asset_links: bool,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_remote() -> String {
    "origin".to_string()
}
fn default_commit_template() -> String {
    "Add {document_name}".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.expand_paths(&|name| std::env::var(name).ok());
    validate(&config)?;
    Ok(config)
}

impl Config {
    fn expand_paths(&mut self, lookup: &dyn Fn(&str) -> Option<String>) {
        let expand = |path: &mut PathBuf| *path = expand_path_with(path, lookup);

        expand(&mut self.state.path);
        if let Some(drive) = self.source.google_drive.as_mut() {
            expand(&mut drive.client_secrets);
            if let Some(cache) = drive.token_cache.as_mut() {
                expand(cache);
            }
        }
        if let Some(local) = self.source.local.as_mut() {
            expand(&mut local.path);
        }
        for prompt in [
            &mut self.converter.prompt_path,
            &mut self.converter.mindmap_prompt_path,
            &mut self.converter.classifier_prompt_path,
        ] {
            if let Some(prompt) = prompt.as_mut() {
                expand(prompt);
            }
        }
        expand(&mut self.output.directory);
        if let Some(assets) = self.output.asset_directory.as_mut() {
            expand(assets);
        }
        if let Some(git) = self.output.git.as_mut() {
            expand(&mut git.repository_path);
            if let Some(key) = git.private_key_path.as_mut() {
                expand(key);
            }
            if let Some(known_hosts) = git.known_hosts_path.as_mut() {
                expand(known_hosts);
            }
        }
    }
}

/// Expand `$VAR` / `${VAR}` references, then a leading `~`.
fn expand_path_with(path: &Path, lookup: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    // Non-UTF-8 paths cannot contain anything we would expand.
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    let expanded = expand_vars(raw, lookup);

    let home_relative = match expanded.as_str() {
        "~" => Some(""),
        s => s.strip_prefix("~/"),
    };
    match (home_relative, lookup("HOME")) {
        (Some(rest), Some(home)) if !home.is_empty() => Path::new(&home).join(rest),
        _ => PathBuf::from(expanded),
    }
}

fn expand_vars(raw: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let is_name = |c: char| c.is_ascii_alphanumeric() || c == '_';
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after.find(|c: char| !is_name(c)).unwrap_or(after.len());
            (&after[..end], end)
        };

        match (name.is_empty(), lookup(name)) {
            (false, Some(value)) => out.push_str(&value),
            _ => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

fn validate(config: &Config) -> Result<()> {
    if config.pipeline.poll_interval_secs == 0 {
        anyhow::bail!("pipeline.poll_interval_secs must be > 0");
    }

    match config.source.provider {
        SourceProvider::GoogleDrive => {
            let drive = config.source.google_drive.as_ref().ok_or_else(|| {
                anyhow::anyhow!("[source.google_drive] is required when provider is 'google_drive'")
            })?;
            if drive.folder_id.trim().is_empty() {
                anyhow::bail!("source.google_drive.folder_id must not be empty");
            }
            if !(1..=1000).contains(&drive.page_size) {
                anyhow::bail!("source.google_drive.page_size must be in [1, 1000]");
            }
            if drive.scopes.is_empty() {
                anyhow::bail!("source.google_drive.scopes must not be empty");
            }
        }
        SourceProvider::Local => {
            let local = config.source.local.as_ref().ok_or_else(|| {
                anyhow::anyhow!("[source.local] is required when provider is 'local'")
            })?;
            if local.include_globs.is_empty() {
                anyhow::bail!("source.local.include_globs must not be empty");
            }
        }
    }

    if config.converter.provider == ConverterProvider::Gemini {
        if config.converter.model.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("converter.model must be specified when provider is 'gemini'");
        }
        if !(0.0..=2.0).contains(&config.converter.temperature) {
            anyhow::bail!("converter.temperature must be in [0.0, 2.0]");
        }
    }

    if config.converter.mode == ConversionMode::Auto {
        let tags = &config.converter.mindmap_hashtags;
        if tags.iter().any(|t| t.trim_start_matches('#').trim().is_empty()) {
            anyhow::bail!("converter.mindmap_hashtags must not contain empty tags");
        }
        if tags.is_empty() && !config.converter.classify {
            anyhow::bail!(
                "converter.mode 'auto' needs mindmap_hashtags or classify = true to ever produce a mind map"
            );
        }
    }

    if config.output.page_width == 0 {
        anyhow::bail!("output.page_width must be > 0");
    }
    if config.output.asset_invert && config.output.asset_mode == AssetMode::Pdf {
        anyhow::bail!("output.asset_invert requires asset_mode 'png' or 'jpg'");
    }
    if config.output.provider == OutputProvider::Git && config.output.git.is_none() {
        anyhow::bail!("[output.git] is required when provider is 'git'");
    }

    Ok(())
}
