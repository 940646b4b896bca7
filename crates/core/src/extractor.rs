use crate::error::IngestError;
use lopdf::Document;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

pub trait PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;

    fn extract_pages_from_bytes(&self, bytes: &[u8]) -> Result<Vec<PageText>, IngestError>;
}

/// Reads text page by page with lopdf. Pages that fail to decode are kept as
/// empty strings so one bad page never loses the rest of the document.
#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor {
    pub max_pages: Option<usize>,
}

impl LopdfExtractor {
    pub fn with_max_pages(max_pages: Option<usize>) -> Self {
        Self { max_pages }
    }

    fn read_pages(&self, document: &Document, origin: &str) -> Vec<PageText> {
        let pages = document.get_pages();
        let total = pages.len();
        let limit = self.max_pages.unwrap_or(total).min(total);
        if limit < total {
            debug!(origin, limit, total, "reading only the first pages");
        }

        pages
            .keys()
            .take(limit)
            .map(|&page_no| {
                let text = match document.extract_text(&[page_no]) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(origin, page = page_no, %error, "page has no extractable text");
                        String::new()
                    }
                };
                PageText {
                    number: page_no,
                    text,
                }
            })
            .collect()
    }
}

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;
        Ok(self.read_pages(&document, &path.display().to_string()))
    }

    fn extract_pages_from_bytes(&self, bytes: &[u8]) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load_mem(bytes).map_err(|error| IngestError::PdfParse(error.to_string()))?;
        Ok(self.read_pages(&document, "<memory>"))
    }
}

pub fn join_pages(pages: &[PageText]) -> String {
    pages.iter().map(|page| page.text.as_str()).collect()
}

pub fn try_extract_text(path: &Path, max_pages: Option<usize>) -> Result<String, IngestError> {
    let pages = LopdfExtractor::with_max_pages(max_pages).extract_pages(path)?;
    Ok(join_pages(&pages))
}

/// Concatenated text of every page, or an empty string when the PDF cannot be
/// read at all. Failures are logged, never returned.
pub fn extract_text(path: &Path, max_pages: Option<usize>) -> String {
    match try_extract_text(path, max_pages) {
        Ok(text) => text,
        Err(error) => {
            warn!(path = %path.display(), %error, "failed to extract text from pdf");
            String::new()
        }
    }
}

pub fn extract_text_from_bytes(bytes: &[u8]) -> String {
    match LopdfExtractor::default().extract_pages_from_bytes(bytes) {
        Ok(pages) => join_pages(&pages),
        Err(error) => {
            warn!(%error, "failed to extract text from pdf bytes");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn pages_are_joined_in_order_without_separator() {
        let pages = vec![
            PageText {
                number: 1,
                text: "First page. ".to_string(),
            },
            PageText {
                number: 2,
                text: String::new(),
            },
            PageText {
                number: 3,
                text: "Third page.".to_string(),
            },
        ];

        assert_eq!(join_pages(&pages), "First page. Third page.");
    }

    #[test]
    fn unreadable_pdf_yields_empty_text() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.pdf");
        fs::write(&path, b"%PDF-1.4\n%broken")?;

        assert!(matches!(
            try_extract_text(&path, None),
            Err(IngestError::PdfParse(_))
        ));
        assert_eq!(extract_text(&path, None), "");
        Ok(())
    }

    #[test]
    fn missing_file_yields_empty_text() {
        assert_eq!(extract_text(Path::new("/definitely/not/here.pdf"), None), "");
    }

    #[test]
    fn garbage_bytes_yield_empty_text() {
        assert_eq!(extract_text_from_bytes(b"not a pdf at all"), "");
    }
}
