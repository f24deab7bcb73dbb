//! Text extraction for uploaded documents (PDF, DOCX, plain text).
//!
//! Extraction is extension-driven: the upload directory holds raw files
//! keyed by filename, and this module returns plain UTF-8 text for the
//! formats the pipeline supports. Unsupported files are skipped by the
//! ingestion scan rather than treated as errors.

use std::io::Read;
use std::path::Path;

use thiserror::Error;

/// Maximum decompressed bytes to read from a single ZIP entry
/// (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported file extension: {0}")]
    Unsupported(String),
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Whether the ingestion pipeline knows how to extract text from this file.
pub fn is_supported(path: &Path) -> bool {
    matches!(extension_of(path).as_str(), "pdf" | "docx" | "txt" | "md")
}

/// One extracted stretch of text with its page attribution, when the
/// format has pages. Chunk windows never span segments.
#[derive(Debug, Clone)]
pub struct ExtractedSegment {
    pub page: Option<i64>,
    pub text: String,
}

/// Extract plain text from a supported document file. PDFs yield one
/// segment per page (1-based); flat formats yield a single pageless
/// segment.
pub fn extract_text(path: &Path) -> Result<Vec<ExtractedSegment>, ExtractError> {
    match extension_of(path).as_str() {
        "pdf" => extract_pdf(path),
        "docx" => Ok(vec![ExtractedSegment {
            page: None,
            text: extract_docx(path)?,
        }]),
        "txt" | "md" => Ok(vec![ExtractedSegment {
            page: None,
            text: std::fs::read_to_string(path)?,
        }]),
        other => Err(ExtractError::Unsupported(other.to_string())),
    }
}

fn extract_pdf(path: &Path) -> Result<Vec<ExtractedSegment>, ExtractError> {
    let bytes = std::fs::read(path)?;
    let text = pdf_extract::extract_text_from_mem(&bytes)
        .map_err(|e| ExtractError::Pdf(e.to_string()))?;
    Ok(split_pdf_pages(&text))
}

/// `pdf_extract` emits a form feed at each page break. Split on it and
/// number pages from 1, keeping the numbering aligned with the physical
/// page even when blank pages are dropped.
fn split_pdf_pages(text: &str) -> Vec<ExtractedSegment> {
    text.split('\u{0C}')
        .enumerate()
        .filter(|(_, page)| !page.trim().is_empty())
        .map(|(i, page)| ExtractedSegment {
            page: Some(i as i64 + 1),
            text: page.to_string(),
        })
        .collect()
}

fn extract_docx(path: &Path) -> Result<String, ExtractError> {
    let bytes = std::fs::read(path)?;
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.as_slice()))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|e| ExtractError::Docx(e.to_string()))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| ExtractError::Docx(e.to_string()))?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(ExtractError::Docx(
                "word/document.xml exceeds size limit".to_string(),
            ));
        }
    }

    extract_w_t_elements(&doc_xml)
}

/// Collect `w:t` run text, inserting a newline at each paragraph end so the
/// chunker sees paragraph structure rather than one unbroken line.
fn extract_w_t_elements(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
