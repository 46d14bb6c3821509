//! Corpus loading from the `sample_docs` and `uploads` folders.
//!
//! Walks each corpus directory and keeps files that match the include globs
//! and have a supported extension. Globs match case-insensitively, so the
//! scan accepts exactly what [`DocumentKind::from_path`] and [`save_upload`]
//! accept. Documents come back in a deterministic order (folder order, then
//! relative path). Also owns the uploads folder: saving admin uploads and
//! listing the files behind the document table.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{Config, CorpusConfig};
use crate::error::{Result, VerifyError};
use crate::extract::extract_text;
use crate::models::{Document, DocumentEntry, DocumentKind};

/// A corpus file left out of the index because it has no extractable text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub folder: String,
    /// Path relative to the corpus folder.
    pub file: String,
    pub reason: String,
}

/// The outcome of a corpus scan.
#[derive(Debug, Default)]
pub struct Corpus {
    pub documents: Vec<Document>,
    pub skipped: Vec<SkippedFile>,
}

/// Load every corpus document. Missing corpus directories are skipped.
///
/// Documents are keyed by file name: a later file with the same name (an
/// upload re-sending a sample document, say) replaces the earlier one.
/// Files without extractable text (an image-only PDF, a blank note) are
/// reported in [`Corpus::skipped`] instead of failing the whole load.
pub fn load_corpus(config: &Config) -> Result<Corpus> {
    let filters = CorpusFilters::new(&config.corpus)?;
    let mut corpus = Corpus::default();

    for (folder, dir) in config.corpus.directories() {
        for path in scan_dir(dir, &filters)? {
            let doc = match load_file(&path, dir, folder) {
                Ok(doc) => doc,
                Err(err @ VerifyError::EmptyDocument(_)) => {
                    let file = relative_path(&path, dir);
                    tracing::warn!(file = %file, folder, error = %err, "skipping document");
                    corpus.skipped.push(SkippedFile {
                        folder: folder.to_string(),
                        file,
                        reason: err.to_string(),
                    });
                    continue;
                }
                Err(err) => return Err(err),
            };
            tracing::debug!(source = %doc.source_id, folder, chars = doc.text.len(), "loaded document");

            let docs = &mut corpus.documents;
            if let Some(pos) = docs.iter().position(|d| d.source_id == doc.source_id) {
                if docs[pos].content_hash == doc.content_hash {
                    tracing::debug!(source = %doc.source_id, folder, "identical copy of an earlier file");
                } else {
                    tracing::warn!(
                        source = %doc.source_id,
                        replaced = %docs[pos].relative_path,
                        folder,
                        "duplicate file name, keeping the later file"
                    );
                }
                docs.remove(pos);
            }
            docs.push(doc);
        }
    }

    Ok(corpus)
}

/// Read and extract one file.
///
/// Fails with [`VerifyError::UnsupportedFormat`] for unknown extensions and
/// [`VerifyError::EmptyDocument`] if nothing extractable remains.
pub fn load_file(path: &Path, root: &Path, folder: &str) -> Result<Document> {
    let kind = DocumentKind::from_path(path)?;
    let bytes = std::fs::read(path)?;

    let source_id = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let relative_path = relative_path(path, root);

    let text = extract_text(&bytes, kind, &relative_path)?;

    Ok(Document {
        source_id,
        folder: folder.to_string(),
        relative_path,
        kind,
        text,
        content_hash: hex::encode(Sha256::digest(&bytes)),
    })
}

fn relative_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// List corpus files for the document table, without extracting them.
pub fn list_documents(config: &Config) -> Result<Vec<DocumentEntry>> {
    let filters = CorpusFilters::new(&config.corpus)?;
    let mut entries = Vec::new();

    for (folder, dir) in config.corpus.directories() {
        for path in scan_dir(dir, &filters)? {
            let size = std::fs::metadata(&path)?.len();
            entries.push(DocumentEntry {
                file: path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default(),
                folder: folder.to_string(),
                size_kb: (size as f64 / 1024.0 * 100.0).round() / 100.0,
            });
        }
    }

    Ok(entries)
}

/// Store an uploaded file in the uploads folder and return its path.
///
/// The name is reduced to its final component; an existing file with the
/// same name is replaced.
pub fn save_upload(config: &Config, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
    let name = sanitize_upload_name(filename)?;
    let kind = DocumentKind::from_path(Path::new(&name))?;

    if bytes.is_empty() {
        return Err(VerifyError::EmptyDocument(name));
    }
    // Reject files that would fail at index time.
    extract_text(bytes, kind, &name)?;

    std::fs::create_dir_all(&config.corpus.uploads)?;
    let path = config.corpus.uploads.join(&name);
    std::fs::write(&path, bytes)?;

    tracing::info!(file = %name, bytes = bytes.len(), "saved upload");
    Ok(path)
}

fn sanitize_upload_name(filename: &str) -> Result<String> {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    if name.is_empty() || name.starts_with('.') {
        return Err(VerifyError::InvalidArgument(format!(
            "invalid upload file name: '{}'",
            filename
        )));
    }
    Ok(name)
}

struct CorpusFilters {
    include: GlobSet,
    exclude: GlobSet,
}

impl CorpusFilters {
    fn new(corpus: &CorpusConfig) -> Result<Self> {
        let mut excludes = vec!["**/.*".to_string(), "**/.*/**".to_string()];
        excludes.extend(corpus.exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(&corpus.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    fn accepts(&self, relative: &str) -> bool {
        !self.exclude.is_match(relative) && self.include.is_match(relative)
    }
}

fn scan_dir(dir: &Path, filters: &CorpusFilters) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| VerifyError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if DocumentKind::from_path(path).is_err() {
            continue;
        }
        if filters.accepts(&relative_path(path, dir)) {
            paths.push(path.to_path_buf());
        }
    }

    // Sort for deterministic ordering
    paths.sort();
    Ok(paths)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| VerifyError::InvalidArgument(format!("bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| VerifyError::InvalidArgument(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Config) {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path());
        config.ensure_directories().unwrap();
        (tmp, config)
    }

    #[test]
    fn loads_sample_docs_before_uploads() {
        let (_tmp, config) = setup();
        fs::write(config.corpus.uploads.join("a.md"), "uploaded").unwrap();
        fs::write(config.corpus.sample_docs.join("z.txt"), "sample").unwrap();
        fs::create_dir_all(config.corpus.sample_docs.join("nested")).unwrap();
        fs::write(config.corpus.sample_docs.join("nested/b.md"), "nested").unwrap();

        let docs = load_corpus(&config).unwrap().documents;
        let order: Vec<_> = docs
            .iter()
            .map(|d| (d.folder.as_str(), d.relative_path.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("sample_docs", "nested/b.md"),
                ("sample_docs", "z.txt"),
                ("uploads", "a.md"),
            ]
        );
        assert_eq!(docs[0].source_id, "b.md");
    }

    #[test]
    fn upload_replaces_sample_with_same_name() {
        let (_tmp, config) = setup();
        fs::write(config.corpus.sample_docs.join("faq.md"), "old").unwrap();
        fs::write(config.corpus.uploads.join("faq.md"), "new").unwrap();

        let docs = load_corpus(&config).unwrap().documents;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].folder, "uploads");
        assert_eq!(docs[0].text, "new");
    }

    #[test]
    fn unsupported_and_hidden_files_are_skipped() {
        let (_tmp, config) = setup();
        fs::write(config.corpus.sample_docs.join("faq.md"), "CPF FAQ").unwrap();
        fs::write(config.corpus.sample_docs.join("slides.pptx"), "binary").unwrap();
        fs::write(config.corpus.sample_docs.join(".draft.md"), "hidden").unwrap();

        let docs = load_corpus(&config).unwrap().documents;
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].source_id, "faq.md");
    }

    #[test]
    fn empty_document_is_skipped_not_fatal() {
        let (_tmp, config) = setup();
        fs::write(config.corpus.sample_docs.join("blank.md"), "   \n").unwrap();
        fs::write(config.corpus.sample_docs.join("faq.md"), "CPF FAQ").unwrap();
        fs::write(config.corpus.uploads.join("empty.txt"), "\n\n").unwrap();

        let corpus = load_corpus(&config).unwrap();
        let loaded: Vec<_> = corpus.documents.iter().map(|d| d.source_id.as_str()).collect();
        assert_eq!(loaded, vec!["faq.md"]);

        let skipped: Vec<_> = corpus
            .skipped
            .iter()
            .map(|s| (s.folder.as_str(), s.file.as_str()))
            .collect();
        assert_eq!(skipped, vec![("sample_docs", "blank.md"), ("uploads", "empty.txt")]);
        assert!(corpus.skipped[0].reason.contains("no extractable text"));

        // Direct loads still refuse the file
        let err = load_file(
            &config.corpus.sample_docs.join("blank.md"),
            &config.corpus.sample_docs,
            "sample_docs",
        )
        .unwrap_err();
        assert!(matches!(err, VerifyError::EmptyDocument(_)));
    }

    #[test]
    fn uploads_with_any_supported_extension_reach_the_corpus() {
        let (_tmp, config) = setup();
        save_upload(&config, "guide.markdown", b"# Guide\n\nTop-ups to the Retirement Account").unwrap();
        save_upload(&config, "FAQ.TXT", b"Frequently asked questions").unwrap();
        save_upload(&config, "Notes.Md", b"MediSave notes").unwrap();

        let corpus = load_corpus(&config).unwrap();
        let mut names: Vec<_> = corpus.documents.iter().map(|d| d.source_id.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["FAQ.TXT", "Notes.Md", "guide.markdown"]);
        assert!(corpus.skipped.is_empty());
        assert_eq!(list_documents(&config).unwrap().len(), 3);
    }

    #[test]
    fn custom_include_globs_still_require_a_supported_kind() {
        let (_tmp, mut config) = setup();
        config.corpus.include_globs = vec!["**/*".to_string()];
        fs::write(config.corpus.sample_docs.join("faq.md"), "CPF FAQ").unwrap();
        fs::write(config.corpus.sample_docs.join("deck.pptx"), "binary").unwrap();
        fs::write(config.corpus.sample_docs.join("README"), "no extension").unwrap();

        let corpus = load_corpus(&config).unwrap();
        assert_eq!(corpus.documents.len(), 1);
        assert_eq!(list_documents(&config).unwrap().len(), 1);
    }

    #[test]
    fn missing_directories_yield_empty_corpus() {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path());
        assert!(load_corpus(&config).unwrap().documents.is_empty());
        assert!(list_documents(&config).unwrap().is_empty());
    }

    #[test]
    fn save_upload_strips_directories() {
        let (_tmp, config) = setup();
        let path = save_upload(&config, "../../etc/cpf-notes.md", b"notes").unwrap();
        assert_eq!(path, config.corpus.uploads.join("cpf-notes.md"));
        assert_eq!(fs::read_to_string(path).unwrap(), "notes");
    }

    #[test]
    fn save_upload_rejects_bad_input() {
        let (_tmp, config) = setup();
        assert!(matches!(
            save_upload(&config, "deck.pptx", b"x").unwrap_err(),
            VerifyError::UnsupportedFormat(_)
        ));
        assert!(matches!(
            save_upload(&config, "", b"x").unwrap_err(),
            VerifyError::InvalidArgument(_)
        ));
        assert!(matches!(
            save_upload(&config, "empty.txt", b"").unwrap_err(),
            VerifyError::EmptyDocument(_)
        ));
    }

    #[test]
    fn list_documents_reports_size() {
        let (_tmp, config) = setup();
        fs::write(config.corpus.uploads.join("big.txt"), vec![b'a'; 2048]).unwrap();
        let entries = list_documents(&config).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].folder, "uploads");
        assert_eq!(entries[0].size_kb, 2.0);
    }
}
