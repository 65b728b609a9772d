//! Drop-folder entry classification.
//!
//! Extension first; files with a missing or unknown extension are sniffed by
//! magic bytes.

use std::io::Read;
use std::path::Path;

use glob::{MatchOptions, Pattern};

use crate::domain::WorkKind;

const AUDIO_EXTENSIONS: &[&str] = &[
    "m4a", "mp3", "wav", "ogg", "oga", "opus", "flac", "aac", "wma", "mp4", "m4v", "mov", "mkv",
    "webm", "avi",
];
const IMAGE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "tif", "tiff", "bmp", "webp", "gif", "heic",
];
const NOTE_EXTENSIONS: &[&str] = &["txt", "md", "markdown", "text"];

const QUEUE_MATCH: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Bytes read when sniffing content
const SNIFF_BYTES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryClass {
    Work(WorkKind),
    /// A link-queue file handled by the queue ledger
    LinkQueue,
    Unsupported,
}

/// Sub-format of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Pdf,
    Image,
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Whether the file name matches one of the queue-file patterns
pub fn is_queue_file(path: &Path, queue_files: &[Pattern]) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| queue_files.iter().any(|p| p.matches_with(name, QUEUE_MATCH)))
        .unwrap_or(false)
}

/// Classify a stable drop-folder file
pub fn classify(path: &Path, queue_files: &[Pattern]) -> EntryClass {
    if is_queue_file(path, queue_files) {
        return EntryClass::LinkQueue;
    }

    if let Some(ext) = extension(path) {
        if let Some(kind) = kind_from_extension(&ext) {
            return EntryClass::Work(kind);
        }
    }

    sniff(path)
}

fn kind_from_extension(ext: &str) -> Option<WorkKind> {
    if AUDIO_EXTENSIONS.contains(&ext) {
        Some(WorkKind::Audio)
    } else if ext == "pdf" || IMAGE_EXTENSIONS.contains(&ext) {
        Some(WorkKind::Document)
    } else if NOTE_EXTENSIONS.contains(&ext) {
        Some(WorkKind::Note)
    } else {
        None
    }
}

fn read_head(path: &Path) -> Option<Vec<u8>> {
    let file = std::fs::File::open(path).ok()?;
    let mut head = Vec::with_capacity(SNIFF_BYTES);
    file.take(SNIFF_BYTES as u64).read_to_end(&mut head).ok()?;
    Some(head)
}

fn sniff(path: &Path) -> EntryClass {
    let Some(head) = read_head(path) else {
        return EntryClass::Unsupported;
    };

    if let Some(kind) = infer::get(&head) {
        return match kind.matcher_type() {
            infer::MatcherType::Audio | infer::MatcherType::Video => {
                EntryClass::Work(WorkKind::Audio)
            }
            infer::MatcherType::Image => EntryClass::Work(WorkKind::Document),
            _ if kind.mime_type() == "application/pdf" => EntryClass::Work(WorkKind::Document),
            _ => EntryClass::Unsupported,
        };
    }

    // No magic bytes: plain text is a note
    if !head.is_empty() && !head.contains(&0) && std::str::from_utf8(&head).is_ok() {
        return EntryClass::Work(WorkKind::Note);
    }

    EntryClass::Unsupported
}

/// PDF or image, for a file already classified as a document
pub fn document_format(path: &Path) -> Option<DocumentFormat> {
    match extension(path).as_deref() {
        Some("pdf") => return Some(DocumentFormat::Pdf),
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => return Some(DocumentFormat::Image),
        _ => {}
    }

    let head = read_head(path)?;
    let kind = infer::get(&head)?;
    if kind.mime_type() == "application/pdf" {
        Some(DocumentFormat::Pdf)
    } else if kind.matcher_type() == infer::MatcherType::Image {
        Some(DocumentFormat::Image)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn patterns() -> Vec<Pattern> {
        ["queue.md", "*.queue.md"]
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect()
    }

    #[test]
    fn test_classify_by_extension() {
        let q = patterns();
        assert_eq!(
            classify(Path::new("/d/memo.M4A"), &q),
            EntryClass::Work(WorkKind::Audio)
        );
        assert_eq!(
            classify(Path::new("/d/scan.pdf"), &q),
            EntryClass::Work(WorkKind::Document)
        );
        assert_eq!(
            classify(Path::new("/d/photo.jpeg"), &q),
            EntryClass::Work(WorkKind::Document)
        );
        assert_eq!(
            classify(Path::new("/d/idea.md"), &q),
            EntryClass::Work(WorkKind::Note)
        );
        assert_eq!(classify(Path::new("/d/Queue.md"), &q), EntryClass::LinkQueue);
        assert_eq!(
            classify(Path::new("/d/reading.queue.md"), &q),
            EntryClass::LinkQueue
        );
    }

    #[test]
    fn test_sniff_without_extension() {
        let temp = TempDir::new().unwrap();
        let q = patterns();

        let pdf = temp.path().join("scan");
        std::fs::write(&pdf, b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n1 0 obj\n").unwrap();
        assert_eq!(classify(&pdf, &q), EntryClass::Work(WorkKind::Document));
        assert_eq!(document_format(&pdf), Some(DocumentFormat::Pdf));

        let text = temp.path().join("thoughts");
        std::fs::write(&text, "remember to call the plumber").unwrap();
        assert_eq!(classify(&text, &q), EntryClass::Work(WorkKind::Note));

        let junk = temp.path().join("blob.bin");
        std::fs::write(&junk, [0u8, 159, 146, 150, 0, 1, 2]).unwrap();
        assert_eq!(classify(&junk, &q), EntryClass::Unsupported);
    }
}
