//! Configuration for mulch.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (MULCH_HOME, MULCH_DROP, MULCH_VAULT, MULCH_ARCHIVE,
//!    MULCH_RUNTIME_URL, WHISPER_PATH)
//! 2. Config file (.mulch/config.yaml)
//! 3. Defaults (~/.mulch)
//!
//! Config file discovery:
//! - Searches current directory and parents for .mulch/config.yaml
//! - `paths.home` is relative to the .mulch/ directory, every other path is
//!   relative to the project root (the directory containing .mulch/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::adapters::ModelKind;
use crate::core::{RetryPolicy, SafetyLimits};
use crate::garden::Taxonomy;
use crate::ingest::WatchSettings;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<Settings, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub watch: WatchSettings,
    #[serde(default)]
    pub models: ModelsSettings,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub limits: SafetyLimits,
    #[serde(default)]
    pub categories: Taxonomy,
    /// Append a report entry to the daily note after each commit
    #[serde(default = "default_true")]
    pub daily_log: bool,
    #[serde(default)]
    pub index: IndexSettings,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: None,
            paths: PathsConfig::default(),
            watch: WatchSettings::default(),
            models: ModelsSettings::default(),
            tools: ToolPaths::default(),
            retry: RetryPolicy::default(),
            limits: SafetyLimits::default(),
            categories: Taxonomy::default(),
            daily_log: true,
            index: IndexSettings::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (journal, checkpoints, lock file)
    pub home: Option<String>,
    /// Drop folder watched for new inputs
    pub drop: Option<String>,
    /// Where processed sources are moved
    pub archive: Option<String>,
    /// Knowledge vault root
    pub vault: Option<String>,
    /// Asset subdirectory inside the vault (default: Assets)
    pub assets: Option<String>,
    /// Daily notes subdirectory inside the vault (default: Daily)
    pub daily: Option<String>,
}

/// How heavy a model is for slot accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelWeight {
    /// Takes the single heavy slot
    #[default]
    Heavy,
    /// Bypasses the slot
    Light,
}

/// One configured model and its reduced-cost variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Identifier passed to the runtime
    pub id: String,

    /// Smaller variant used after an out-of-memory failure
    #[serde(default)]
    pub fallback: Option<String>,

    /// Estimated resident cost in bytes
    #[serde(default)]
    pub estimated_bytes: u64,

    #[serde(default)]
    pub fallback_estimated_bytes: Option<u64>,

    #[serde(default)]
    pub weight: ModelWeight,
}

impl ModelSpec {
    pub fn heavy(id: impl Into<String>, estimated_bytes: u64) -> Self {
        Self {
            id: id.into(),
            fallback: None,
            estimated_bytes,
            fallback_estimated_bytes: None,
            weight: ModelWeight::Heavy,
        }
    }

    pub fn light(id: impl Into<String>, estimated_bytes: u64) -> Self {
        Self {
            weight: ModelWeight::Light,
            ..Self::heavy(id, estimated_bytes)
        }
    }

    pub fn with_fallback(mut self, id: impl Into<String>, estimated_bytes: u64) -> Self {
        self.fallback = Some(id.into());
        self.fallback_estimated_bytes = Some(estimated_bytes);
        self
    }

    pub fn is_heavy(&self) -> bool {
        self.weight == ModelWeight::Heavy
    }
}

/// Model selection and device budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsSettings {
    /// Base URL of the HTTP model runtime
    #[serde(default = "default_runtime_url")]
    pub runtime_url: String,

    /// Device memory budget; models estimated above it start on their fallback
    #[serde(default)]
    pub resource_budget_bytes: Option<u64>,

    /// Language hint for transcription and OCR (None = autodetect)
    #[serde(default)]
    pub language: Option<String>,

    #[serde(default = "default_transcription")]
    pub transcription: ModelSpec,

    #[serde(default = "default_ocr")]
    pub ocr: ModelSpec,

    #[serde(default = "default_generation")]
    pub generation: ModelSpec,

    #[serde(default = "default_embedding")]
    pub embedding: ModelSpec,

    /// Categorization model (defaults to the generation model)
    #[serde(default)]
    pub classification: Option<ModelSpec>,
}

fn default_runtime_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_transcription() -> ModelSpec {
    ModelSpec::heavy("large-v3", 3_100_000_000).with_fallback("medium", 1_500_000_000)
}
fn default_ocr() -> ModelSpec {
    ModelSpec::heavy("eng", 200_000_000)
}
fn default_generation() -> ModelSpec {
    ModelSpec::heavy("qwen2.5:14b", 9_000_000_000).with_fallback("qwen2.5:7b", 4_700_000_000)
}
fn default_embedding() -> ModelSpec {
    ModelSpec::heavy("mxbai-embed-large", 670_000_000)
}

impl Default for ModelsSettings {
    fn default() -> Self {
        Self {
            runtime_url: default_runtime_url(),
            resource_budget_bytes: None,
            language: None,
            transcription: default_transcription(),
            ocr: default_ocr(),
            generation: default_generation(),
            embedding: default_embedding(),
            classification: None,
        }
    }
}

impl ModelsSettings {
    /// Model spec for a kind
    pub fn spec(&self, kind: ModelKind) -> &ModelSpec {
        match kind {
            ModelKind::Transcription => &self.transcription,
            ModelKind::Ocr => &self.ocr,
            ModelKind::Generation => &self.generation,
            ModelKind::Embedding => &self.embedding,
            ModelKind::Classification => {
                self.classification.as_ref().unwrap_or(&self.generation)
            }
        }
    }
}

/// External tool binaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPaths {
    #[serde(default = "default_whisper")]
    pub whisper: String,
    #[serde(default = "default_tesseract")]
    pub tesseract: String,
    #[serde(default = "default_pdftotext")]
    pub pdftotext: String,
    #[serde(default = "default_pdfimages")]
    pub pdfimages: String,
    #[serde(default = "default_pdftoppm")]
    pub pdftoppm: String,
    #[serde(default = "default_yt_dlp")]
    pub yt_dlp: String,
}

fn default_whisper() -> String {
    std::env::var("WHISPER_PATH").unwrap_or_else(|_| "whisper".to_string())
}
fn default_tesseract() -> String {
    "tesseract".to_string()
}
fn default_pdftotext() -> String {
    "pdftotext".to_string()
}
fn default_pdfimages() -> String {
    "pdfimages".to_string()
}
fn default_pdftoppm() -> String {
    "pdftoppm".to_string()
}
fn default_yt_dlp() -> String {
    "yt-dlp".to_string()
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            whisper: default_whisper(),
            tesseract: default_tesseract(),
            pdftotext: default_pdftotext(),
            pdfimages: default_pdfimages(),
            pdftoppm: default_pdftoppm(),
            yt_dlp: default_yt_dlp(),
        }
    }
}

/// Optional vector index upkeep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Number of related notes linked from each new note
    #[serde(default = "default_related")]
    pub related: usize,
}

fn default_related() -> usize {
    3
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            related: default_related(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Engine state (journal, checkpoints, slot lock)
    pub home: PathBuf,
    pub drop: PathBuf,
    pub archive: PathBuf,
    pub vault: PathBuf,
    /// Asset subdirectory name inside the vault
    pub assets_dir: String,
    /// Daily notes subdirectory name inside the vault
    pub daily_dir: String,
    pub watch: WatchSettings,
    pub models: ModelsSettings,
    pub tools: ToolPaths,
    pub retry: RetryPolicy,
    pub limits: SafetyLimits,
    pub categories: Taxonomy,
    pub daily_log: bool,
    pub index: IndexSettings,
}

impl Settings {
    /// Self-contained layout under `root` with default settings (tests, demos)
    pub fn for_root(root: &Path) -> Self {
        Self::from_parts(
            ConfigFile::default(),
            None,
            root.join("home"),
            root.join("drop"),
            root.join("archive"),
            root.join("vault"),
        )
    }

    fn from_parts(
        file: ConfigFile,
        config_file: Option<PathBuf>,
        home: PathBuf,
        drop: PathBuf,
        archive: PathBuf,
        vault: PathBuf,
    ) -> Self {
        Self {
            config_file,
            home,
            drop,
            archive,
            vault,
            assets_dir: file.paths.assets.unwrap_or_else(|| "Assets".to_string()),
            daily_dir: file.paths.daily.unwrap_or_else(|| "Daily".to_string()),
            watch: file.watch,
            models: file.models,
            tools: file.tools,
            retry: file.retry,
            limits: file.limits,
            categories: file.categories,
            daily_log: file.daily_log,
            index: file.index,
        }
    }

    /// Work journal ($MULCH_HOME/journal.jsonl)
    pub fn journal_path(&self) -> PathBuf {
        self.home.join("journal.jsonl")
    }

    /// Staged artifacts ($MULCH_HOME/staged)
    pub fn staged_dir(&self) -> PathBuf {
        self.home.join("staged")
    }

    /// Draft and decision checkpoints ($MULCH_HOME/drafts)
    pub fn drafts_dir(&self) -> PathBuf {
        self.home.join("drafts")
    }

    /// Cross-process heavy slot lock
    pub fn slot_lock_path(&self) -> PathBuf {
        self.home.join("heavy-slot.lock")
    }

    pub fn index_path(&self) -> PathBuf {
        self.home.join("index.jsonl")
    }

    pub fn assets_path(&self) -> PathBuf {
        self.vault.join(&self.assets_dir)
    }

    pub fn daily_path(&self) -> PathBuf {
        self.vault.join(&self.daily_dir)
    }

    /// Create every directory the pipeline writes to
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.home,
            &self.drop,
            &self.archive,
            &self.vault,
            &self.staged_dir(),
            &self.drafts_dir(),
        ] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".mulch").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var).ok().filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Load configuration from all sources
fn load_config() -> Result<Settings> {
    // Default home directory
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".mulch");

    let config_path = find_config_file();
    let mut file = match config_path {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    // Base directory is the parent of .mulch/ (i.e., grandparent of config.yaml)
    let mulch_dir = config_path
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    let base_dir = mulch_dir.as_deref().and_then(Path::parent).map(Path::to_path_buf);

    let home = env_path("MULCH_HOME")
        .or_else(|| {
            let dir = mulch_dir.as_deref()?;
            file.paths.home.as_deref().map(|h| resolve_path(dir, h))
        })
        .unwrap_or(default_home);

    let relative = |value: &Option<String>| -> Option<PathBuf> {
        let value = value.as_deref()?;
        match base_dir.as_deref() {
            Some(base) => Some(resolve_path(base, value)),
            None => Some(PathBuf::from(value)),
        }
    };

    let drop = env_path("MULCH_DROP")
        .or_else(|| relative(&file.paths.drop))
        .unwrap_or_else(|| home.join("drop"));
    let archive = env_path("MULCH_ARCHIVE")
        .or_else(|| relative(&file.paths.archive))
        .unwrap_or_else(|| home.join("archive"));
    let vault = env_path("MULCH_VAULT")
        .or_else(|| relative(&file.paths.vault))
        .unwrap_or_else(|| home.join("vault"));

    if let Ok(url) = std::env::var("MULCH_RUNTIME_URL") {
        file.models.runtime_url = url;
    }

    Ok(Settings::from_parts(file, config_path, home, drop, archive, vault))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static Settings> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<Settings> {
    load_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let mulch_dir = temp.path().join(".mulch");
        std::fs::create_dir_all(&mulch_dir).unwrap();

        let config_path = mulch_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  home: ./state
  drop: ../inbox
  vault: ./vault
watch:
  poll_interval_secs: 5
models:
  resource_budget_bytes: 8000000000
  generation:
    id: llama3.1:8b
    fallback: llama3.2:3b
    estimated_bytes: 5000000000
  embedding:
    id: nomic-embed-text
    weight: light
retry:
  max_attempts: 5
categories:
  default_folder: Review
  rules:
    - folder: Finance
      keywords: [invoice, bill]
"#
        )
        .unwrap();

        let config = load_config_file(&config_path).unwrap();
        assert_eq!(config.version.as_deref(), Some("1"));
        assert_eq!(config.paths.drop.as_deref(), Some("../inbox"));
        assert_eq!(config.watch.poll_interval_secs, 5);
        assert_eq!(config.watch.stable_polls, 2);
        assert_eq!(config.models.generation.id, "llama3.1:8b");
        assert_eq!(config.models.generation.fallback.as_deref(), Some("llama3.2:3b"));
        assert!(!config.models.embedding.is_heavy());
        assert!(config.models.transcription.is_heavy());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.categories.default_folder, "Review");
        assert_eq!(config.categories.rules.len(), 1);
        assert!(config.daily_log);
    }

    #[test]
    fn test_classification_defaults_to_generation() {
        let models = ModelsSettings::default();
        assert_eq!(models.spec(ModelKind::Classification).id, models.generation.id);
    }

    #[test]
    fn test_for_root_layout() {
        let settings = Settings::for_root(Path::new("/tmp/m"));
        assert_eq!(settings.journal_path(), PathBuf::from("/tmp/m/home/journal.jsonl"));
        assert_eq!(settings.assets_path(), PathBuf::from("/tmp/m/vault/Assets"));
        assert_eq!(settings.daily_path(), PathBuf::from("/tmp/m/vault/Daily"));
        assert_eq!(settings.slot_lock_path(), PathBuf::from("/tmp/m/home/heavy-slot.lock"));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
