//! Plain-text export of answer records.
//!
//! The export is meant to be read by people and parsed back by
//! [`parse`]. Each section starts with a marker line:
//!
//! ```text
//! === Claim ===
//! The minimum retirement sum increases annually.
//! === Answer ===
//! Supported. The FRS is raised each year (retirement.md).
//! === Sources ===
//! - retirement.md (chunk 0)
//! ```
//!
//! `Evidence` and `Evidence Summary` sections appear only when present.
//! Content lines that begin with `===` or `\` are written with a leading
//! `\`, so any text survives [`render`] → [`parse`] unchanged.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, VerifyError};
use crate::models::AnswerRecord;

pub const DEFAULT_EXPORT_FILENAME: &str = "cpf_bot_response.txt";

const CLAIM: &str = "=== Claim ===";
const EVIDENCE: &str = "=== Evidence ===";
const ANSWER: &str = "=== Answer ===";
const SUMMARY: &str = "=== Evidence Summary ===";
const SOURCES: &str = "=== Sources ===";

/// A cited chunk as it appears in an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedSource {
    pub source_id: String,
    pub chunk_index: i64,
}

/// The parsed form of an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedRecord {
    pub claim: String,
    pub evidence: Option<String>,
    pub answer: String,
    pub summary: Option<String>,
    pub sources: Vec<ExportedSource>,
}

impl From<&AnswerRecord> for ExportedRecord {
    fn from(record: &AnswerRecord) -> Self {
        ExportedRecord {
            claim: record.claim.clone(),
            evidence: record.evidence.clone(),
            answer: record.answer.clone(),
            summary: record.summary.clone(),
            sources: record
                .citations
                .iter()
                .map(|c| ExportedSource {
                    source_id: c.source_id.clone(),
                    chunk_index: c.chunk_index,
                })
                .collect(),
        }
    }
}

/// Render a record as export text.
pub fn render(record: &AnswerRecord) -> String {
    render_exported(&ExportedRecord::from(record))
}

pub fn render_exported(record: &ExportedRecord) -> String {
    let mut out = String::new();
    push_section(&mut out, CLAIM, &record.claim);
    if let Some(evidence) = &record.evidence {
        push_section(&mut out, EVIDENCE, evidence);
    }
    push_section(&mut out, ANSWER, &record.answer);
    if let Some(summary) = &record.summary {
        push_section(&mut out, SUMMARY, summary);
    }

    out.push_str(SOURCES);
    out.push('\n');
    for source in &record.sources {
        out.push_str(&format!("- {} (chunk {})\n", source.source_id, source.chunk_index));
    }
    out
}

fn push_section(out: &mut String, marker: &str, content: &str) {
    out.push_str(marker);
    out.push('\n');
    for line in content.split('\n') {
        if line.starts_with("===") || line.starts_with('\\') {
            out.push('\\');
        }
        out.push_str(line);
        out.push('\n');
    }
}

/// Parse export text produced by [`render`].
pub fn parse(text: &str) -> Result<ExportedRecord> {
    let body = text.strip_suffix('\n').unwrap_or(text);

    let mut sections: Vec<(&str, Vec<&str>)> = Vec::new();
    for line in body.split('\n') {
        match line {
            CLAIM | EVIDENCE | ANSWER | SUMMARY | SOURCES => {
                if sections.iter().any(|(m, _)| *m == line) {
                    return Err(VerifyError::Export(format!("duplicate section '{}'", line)));
                }
                sections.push((line, Vec::new()));
            }
            _ => match sections.last_mut() {
                Some((_, lines)) => lines.push(line.strip_prefix('\\').unwrap_or(line)),
                None => {
                    return Err(VerifyError::Export(format!(
                        "expected '{}' on the first line",
                        CLAIM
                    )))
                }
            },
        }
    }

    let order: Vec<&str> = sections.iter().map(|(m, _)| *m).collect();
    let expected: Vec<&str> = [CLAIM, EVIDENCE, ANSWER, SUMMARY, SOURCES]
        .into_iter()
        .filter(|m| order.contains(m))
        .collect();
    if order != expected {
        return Err(VerifyError::Export("sections are out of order".to_string()));
    }

    let section = |marker: &str| {
        sections
            .iter()
            .find(|(m, _)| *m == marker)
            .map(|(_, lines)| lines.join("\n"))
    };
    let required = |marker: &str| {
        section(marker).ok_or_else(|| VerifyError::Export(format!("missing section '{}'", marker)))
    };

    let sources_lines = sections
        .iter()
        .find(|(m, _)| *m == SOURCES)
        .map(|(_, lines)| lines.clone())
        .ok_or_else(|| VerifyError::Export(format!("missing section '{}'", SOURCES)))?;
    let sources = sources_lines
        .into_iter()
        .map(parse_source_line)
        .collect::<Result<Vec<_>>>()?;

    Ok(ExportedRecord {
        claim: required(CLAIM)?,
        evidence: section(EVIDENCE),
        answer: required(ANSWER)?,
        summary: section(SUMMARY),
        sources,
    })
}

fn parse_source_line(line: &str) -> Result<ExportedSource> {
    let bad = || VerifyError::Export(format!("malformed source line '{}'", line));
    let rest = line.strip_prefix("- ").ok_or_else(bad)?;
    let (source_id, index) = rest
        .strip_suffix(')')
        .and_then(|r| r.rsplit_once(" (chunk "))
        .ok_or_else(bad)?;
    Ok(ExportedSource {
        source_id: source_id.to_string(),
        chunk_index: index.parse().map_err(|_| bad())?,
    })
}

/// Reduce a user-supplied export name to a safe file name.
///
/// Directory components are dropped, characters outside
/// `[A-Za-z0-9._ -]` become `_`, and a `.txt` extension is added when
/// missing. Blank names fall back to [`DEFAULT_EXPORT_FILENAME`].
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim().to_string();

    if cleaned.is_empty() {
        return DEFAULT_EXPORT_FILENAME.to_string();
    }
    if cleaned.to_ascii_lowercase().ends_with(".txt") {
        cleaned
    } else {
        format!("{}.txt", cleaned)
    }
}

/// Write the export for `record` to `path`. The file name part of `path`
/// is sanitised; its directory is used as given.
pub fn write_to(path: &Path, record: &AnswerRecord) -> Result<PathBuf> {
    let file_name = sanitize_filename(
        &path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
    );
    let target = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir.join(file_name),
        None => PathBuf::from(file_name),
    };

    std::fs::write(&target, render(record))?;
    tracing::info!(path = %target.display(), "exported answer");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Citation;

    fn record() -> AnswerRecord {
        AnswerRecord {
            claim: "The minimum retirement sum increases annually.".to_string(),
            answer: "Supported (retirement.md).\n\n=== Sources ===\n\\ trailing".to_string(),
            citations: vec![
                Citation {
                    source_id: "retirement.md".to_string(),
                    chunk_index: 0,
                    score: 0.91,
                    text: "The FRS rises.".to_string(),
                },
                Citation {
                    source_id: "faq (2).pdf".to_string(),
                    chunk_index: 12,
                    score: 0.5,
                    text: "FAQ".to_string(),
                },
            ],
            evidence: Some("Heard it on the radio\n".to_string()),
            summary: None,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn render_layout() {
        let mut r = record();
        r.evidence = None;
        r.answer = "Supported.".to_string();
        r.citations.truncate(1);
        assert_eq!(
            render(&r),
            "=== Claim ===\nThe minimum retirement sum increases annually.\n\
             === Answer ===\nSupported.\n\
             === Sources ===\n- retirement.md (chunk 0)\n"
        );
    }

    #[test]
    fn round_trip_is_verbatim() {
        let r = record();
        let parsed = parse(&render(&r)).unwrap();
        assert_eq!(parsed, ExportedRecord::from(&r));
        assert_eq!(parsed.answer, r.answer);
        assert_eq!(parsed.evidence.as_deref(), Some("Heard it on the radio\n"));
    }

    #[test]
    fn empty_sections_round_trip() {
        let exported = ExportedRecord {
            claim: String::new(),
            evidence: Some(String::new()),
            answer: "\n".to_string(),
            summary: Some("- point".to_string()),
            sources: Vec::new(),
        };
        assert_eq!(parse(&render_exported(&exported)).unwrap(), exported);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse("hello").is_err());
        assert!(parse("=== Claim ===\nx\n=== Sources ===\n").is_err());
        assert!(parse("=== Claim ===\nx\n=== Answer ===\ny\n=== Sources ===\nnot a source\n").is_err());
        assert!(parse("=== Answer ===\ny\n=== Claim ===\nx\n=== Sources ===\n").is_err());
    }

    #[test]
    fn sanitize_filename_cases() {
        assert_eq!(sanitize_filename(""), DEFAULT_EXPORT_FILENAME);
        assert_eq!(sanitize_filename("   "), DEFAULT_EXPORT_FILENAME);
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd.txt");
        assert_eq!(sanitize_filename("my answer.TXT"), "my answer.TXT");
        assert_eq!(sanitize_filename("résumé?.txt"), "r_sum__.txt");
        assert_eq!(sanitize_filename(".hidden"), "hidden.txt");
    }

    #[test]
    fn write_to_creates_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_to(&tmp.path().join("out"), &record()).unwrap();
        assert_eq!(path, tmp.path().join("out.txt"));
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(parse(&text).unwrap(), ExportedRecord::from(&record()));
    }
}
