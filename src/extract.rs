//! Text extraction for corpus files.
//!
//! PDFs go through `pdf-extract`; text and markdown must be valid UTF-8
//! (a leading byte-order mark is dropped). A file that cannot be parsed
//! produces [`VerifyError::EmptyDocument`] naming the cause.

use crate::error::{Result, VerifyError};
use crate::models::DocumentKind;

const UTF8_BOM: &str = "\u{feff}";

/// Extract plain UTF-8 text from raw file bytes.
///
/// `label` names the file in error messages.
pub fn extract_text(bytes: &[u8], kind: DocumentKind, label: &str) -> Result<String> {
    let text = match kind {
        DocumentKind::Pdf => extract_pdf(bytes, label)?,
        DocumentKind::Text | DocumentKind::Markdown => std::str::from_utf8(bytes)
            .map_err(|e| VerifyError::EmptyDocument(format!("{}: not valid UTF-8 ({})", label, e)))?
            .trim_start_matches(UTF8_BOM)
            .to_string(),
    };

    let text = normalize_newlines(&text);
    if text.trim().is_empty() {
        return Err(VerifyError::EmptyDocument(label.to_string()));
    }
    Ok(text)
}

fn extract_pdf(bytes: &[u8], label: &str) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| VerifyError::EmptyDocument(format!("{}: PDF extraction failed ({})", label, e)))
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_passes_through() {
        let text = extract_text(b"# CPF\n\nThe FRS rises.", DocumentKind::Markdown, "a.md").unwrap();
        assert_eq!(text, "# CPF\n\nThe FRS rises.");
    }

    #[test]
    fn bom_and_crlf_are_normalized() {
        let text = extract_text(
            "\u{feff}line one\r\nline two".as_bytes(),
            DocumentKind::Text,
            "a.txt",
        )
        .unwrap();
        assert_eq!(text, "line one\nline two");
    }

    #[test]
    fn whitespace_only_is_empty_document() {
        let err = extract_text(b"  \n\n\t ", DocumentKind::Text, "blank.txt").unwrap_err();
        assert!(matches!(err, VerifyError::EmptyDocument(ref name) if name == "blank.txt"));
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let err = extract_text(&[0xff, 0xfe, 0xfd], DocumentKind::Text, "bin.txt").unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", DocumentKind::Pdf, "bad.pdf").unwrap_err();
        assert!(matches!(err, VerifyError::EmptyDocument(_)));
        assert!(err.to_string().contains("bad.pdf"));
    }
}
