//! Light extractors that need no model lease.
//!
//! - `pdftotext` text layers, `pdfimages` embedded images, `pdftoppm` page renders
//! - `yt-dlp` audio download for video links
//! - HTTP article fetch reduced to readable text

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ToolPaths;

/// Hosts whose links are treated as recordings
const VIDEO_HOSTS: &[&str] = &[
    "youtube.com",
    "youtu.be",
    "vimeo.com",
    "dailymotion.com",
    "twitch.tv",
];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("{tool} failed with exit code {code}: {stderr}")]
    Failed {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("HTTP status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected tool output: {0}")]
    Output(String),
}

impl ExtractError {
    /// Whether the same call could succeed later
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::Spawn { .. } | Self::Output(_) => false,
            _ => true,
        }
    }
}

/// Run an external tool with a hard timeout; the child is killed on expiry
pub(crate) async fn run_tool(
    tool: &str,
    cmd: &mut Command,
    timeout: Duration,
) -> Result<Output, ExtractError> {
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| ExtractError::Timeout {
            tool: tool.to_string(),
            secs: timeout.as_secs(),
        })?
        .map_err(|source| ExtractError::Spawn {
            tool: tool.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExtractError::Failed {
            tool: tool.to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: stderr.trim().chars().take(1000).collect(),
        });
    }

    Ok(output)
}

/// Whether `tool` resolves to an executable (absolute path or on PATH)
pub fn tool_available(tool: &str) -> bool {
    let path = Path::new(tool);
    if path.components().count() > 1 {
        return path.is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(tool).is_file()))
        .unwrap_or(false)
}

/// Light extraction tools bundled with their configuration
#[derive(Debug, Clone)]
pub struct Extractors {
    tools: ToolPaths,
    timeout: Duration,
    http: reqwest::Client,
}

impl Extractors {
    pub fn new(tools: ToolPaths, timeout: Duration) -> Result<Self, ExtractError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("mulch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ExtractError::Http(e.to_string()))?;
        Ok(Self {
            tools,
            timeout,
            http,
        })
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    /// Text layer of a PDF
    pub async fn pdf_text(&self, pdf: &Path) -> Result<String, ExtractError> {
        let mut cmd = Command::new(&self.tools.pdftotext);
        cmd.arg("-layout")
            .arg("-enc")
            .arg("UTF-8")
            .arg(pdf)
            .arg("-")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = run_tool("pdftotext", &mut cmd, self.timeout).await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Pull embedded images of a PDF into `dest` as PNG files
    pub async fn pdf_images(&self, pdf: &Path, dest: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        tokio::fs::create_dir_all(dest).await?;
        let mut cmd = Command::new(&self.tools.pdfimages);
        cmd.arg("-png")
            .arg(pdf)
            .arg(dest.join("img"))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        run_tool("pdfimages", &mut cmd, self.timeout).await?;
        list_files_with_prefix(dest, "img").await
    }

    /// Render each PDF page to a PNG in `dest` for OCR
    pub async fn render_pages(&self, pdf: &Path, dest: &Path) -> Result<Vec<PathBuf>, ExtractError> {
        tokio::fs::create_dir_all(dest).await?;
        let mut cmd = Command::new(&self.tools.pdftoppm);
        cmd.arg("-r")
            .arg("300")
            .arg("-png")
            .arg(pdf)
            .arg(dest.join("page"))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        run_tool("pdftoppm", &mut cmd, self.timeout).await?;
        list_files_with_prefix(dest, "page").await
    }

    /// Download the audio track of a video link; returns the audio file
    pub async fn download_audio(&self, url: &str, dest: &Path) -> Result<PathBuf, ExtractError> {
        tokio::fs::create_dir_all(dest).await?;
        let template = dest.join("%(title).120B.%(ext)s");
        let mut cmd = Command::new(&self.tools.yt_dlp);
        cmd.arg("--no-playlist")
            .arg("-x")
            .arg("--audio-format")
            .arg("mp3")
            .arg("-o")
            .arg(template)
            .arg("--print")
            .arg("after_move:filepath")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let output = run_tool("yt-dlp", &mut cmd, self.timeout).await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(PathBuf::from)
            .filter(|p| p.exists())
            .ok_or_else(|| ExtractError::Output("yt-dlp printed no output file".to_string()))
    }

    /// Fetch a web page and reduce it to (title, readable text)
    pub async fn fetch_article(&self, url: &str) -> Result<(Option<String>, String), ExtractError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ExtractError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ExtractError::Http(e.to_string()))?;

        Ok((html_title(&body), html_to_text(&body)))
    }
}

async fn list_files_with_prefix(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>, ExtractError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Whether a URL points at a video host
pub fn is_video_url(url: &str) -> bool {
    let host = url
        .split("://")
        .nth(1)
        .unwrap_or(url)
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .to_lowercase();
    VIDEO_HOSTS
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{}", h)))
}

fn regexes() -> Option<&'static [Regex; 5]> {
    static RE: OnceLock<Option<[Regex; 5]>> = OnceLock::new();
    RE.get_or_init(|| {
        Some([
            // script/style/head blocks
            Regex::new(r"(?is)<(script|style|noscript|svg|head)\b.*?</(script|style|noscript|svg|head)\s*>").ok()?,
            // block-level boundaries
            Regex::new(r"(?i)<(br|/p|/div|/li|/h[1-6]|/tr|/article|/section|/blockquote)\b[^>]*>").ok()?,
            // remaining tags and comments
            Regex::new(r"(?s)<!--.*?-->|<[^>]+>").ok()?,
            Regex::new(r"[ \t\u{a0}]+").ok()?,
            Regex::new(r"(?is)<title[^>]*>(.*?)</title>").ok()?,
        ])
    })
    .as_ref()
}

/// `<title>` of an HTML document
pub fn html_title(html: &str) -> Option<String> {
    regexes()?[4]
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| decode_entities(m.as_str()).trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Strip markup and collapse whitespace, keeping paragraph breaks
pub fn html_to_text(html: &str) -> String {
    let Some(re) = regexes() else {
        return html.trim().to_string();
    };
    let without_blocks = re[0].replace_all(html, " ");
    let with_breaks = re[1].replace_all(&without_blocks, "\n");
    let without_tags = re[2].replace_all(&with_breaks, " ");
    let decoded = decode_entities(&without_tags);

    let mut out = String::with_capacity(decoded.len());
    let mut blank_run = 0;
    for line in decoded.lines() {
        let line = re[3].replace_all(line, " ");
        let line = line.trim();
        if line.is_empty() {
            blank_run += 1;
            if blank_run == 1 && !out.is_empty() {
                out.push('\n');
            }
            continue;
        }
        blank_run = 0;
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
