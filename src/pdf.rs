use std::path::Path;
use std::process::Command;

use crate::error::{RagError, Result};

/// Metadata fields a PDF can carry. `page_count` of -1 signals that
/// the document could not be loaded at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdfMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub subject: Option<String>,
    pub keywords: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub page_count: i32,
}

/// Extracted document content: metadata plus one text per page, in
/// page order.
#[derive(Debug, Clone, Default)]
pub struct DocumentData {
    pub metadata: PdfMetadata,
    pub page_texts: Vec<String>,
}

impl DocumentData {
    pub fn load_failed(&self) -> bool {
        self.metadata.page_count < 0
    }

    fn failed() -> Self {
        Self {
            metadata: PdfMetadata {
                page_count: -1,
                ..PdfMetadata::default()
            },
            page_texts: Vec::new(),
        }
    }
}

/// Extracts per-page text and metadata from a PDF file.
///
/// A document the reader cannot load yields `page_count == -1` rather
/// than an error; errors are reserved for the extraction machinery
/// itself being unavailable. Extracted text is arbitrary UTF-8 and the
/// rest of the pipeline tolerates it as such.
pub trait PdfReader: Send + Sync {
    fn extract(&self, path: &Path) -> Result<DocumentData>;
}

/// Reader backed by the poppler command-line tools: `pdftotext` for
/// page text (pages are separated by form feeds) and `pdfinfo` for the
/// metadata block.
#[derive(Debug, Default)]
pub struct PopplerToolsReader;

impl PopplerToolsReader {
    fn run_pdfinfo(path: &Path) -> Result<Option<PdfMetadata>> {
        let output = Command::new("pdfinfo").arg(path).output().map_err(|e| {
            RagError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to run pdfinfo (is poppler installed?): {e}"),
            ))
        })?;

        if !output.status.success() {
            tracing::warn!(
                path = %path.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "pdfinfo could not read the document"
            );
            return Ok(None);
        }

        let mut metadata = PdfMetadata::default();
        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "Title" => metadata.title = Some(value.to_string()),
                "Author" => metadata.author = Some(value.to_string()),
                "Subject" => metadata.subject = Some(value.to_string()),
                "Keywords" => metadata.keywords = Some(value.to_string()),
                "Creator" => metadata.creator = Some(value.to_string()),
                "Producer" => metadata.producer = Some(value.to_string()),
                "Pages" => metadata.page_count = value.parse().unwrap_or(0),
                _ => {}
            }
        }
        Ok(Some(metadata))
    }

    fn run_pdftotext(path: &Path) -> Result<Option<String>> {
        let output = Command::new("pdftotext")
            .arg("-layout")
            .arg("-enc")
            .arg("UTF-8")
            .arg(path)
            .arg("-")
            .output()
            .map_err(|e| {
                RagError::Io(std::io::Error::new(
                    e.kind(),
                    format!("failed to run pdftotext (is poppler installed?): {e}"),
                ))
            })?;

        if !output.status.success() {
            tracing::warn!(
                path = %path.display(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "pdftotext could not read the document"
            );
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    /// Splits `pdftotext` output on form feeds into per-page texts,
    /// sized to the page count when known.
    fn split_pages(text: &str, page_count: i32) -> Vec<String> {
        let mut pages: Vec<String> = text.split('\u{0c}').map(str::to_string).collect();
        // pdftotext terminates every page with a form feed, leaving a
        // trailing empty element.
        if pages.last().is_some_and(|p| p.is_empty()) {
            pages.pop();
        }
        if page_count > 0 {
            pages.resize(page_count as usize, String::new());
        }
        pages
    }
}

impl PdfReader for PopplerToolsReader {
    fn extract(&self, path: &Path) -> Result<DocumentData> {
        let Some(metadata) = Self::run_pdfinfo(path)? else {
            return Ok(DocumentData::failed());
        };
        let Some(text) = Self::run_pdftotext(path)? else {
            return Ok(DocumentData::failed());
        };

        let page_texts = Self::split_pages(&text, metadata.page_count);
        tracing::debug!(
            path = %path.display(),
            pages = page_texts.len(),
            chars = text.len(),
            "extracted PDF text"
        );
        Ok(DocumentData {
            metadata,
            page_texts,
        })
    }
}
