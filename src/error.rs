//! Error types for the verifier.
//!
//! Every fallible library operation returns [`VerifyError`]. The CLI wraps
//! these in `anyhow` for context; the HTTP server maps each variant onto a
//! status code and a machine-readable error code (see [`VerifyError::code`]).

use thiserror::Error;

/// Errors that can occur while loading, indexing, retrieving, or answering.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The file extension is not PDF, text, or markdown.
    #[error("Unsupported file type: {0}")]
    UnsupportedFormat(String),

    /// No extractable text remained after parsing a document.
    #[error("Document has no extractable text: {0}")]
    EmptyDocument(String),

    /// The embedding provider failed or returned a malformed response.
    #[error("Embedding error ({provider}): {message}")]
    EmbeddingService {
        /// The embedding provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// The on-disk index could not be read or written.
    #[error("Index persistence error: {0}")]
    Persistence(String),

    /// The collection has no entries to search.
    #[error("Knowledge base is empty: run `cpfbot index` to build it")]
    EmptyIndex,

    /// The chat-completion provider failed or returned no text.
    #[error("Generation error ({provider}): {message}")]
    GenerationService {
        /// The generation provider that produced the error.
        provider: String,
        /// A description of the failure.
        message: String,
    },

    /// A user-supplied field (the claim or its evidence) exceeds the
    /// configured maximum length.
    #[error("The {field} is too long: {len} characters (maximum {max})")]
    InputTooLong {
        field: String,
        len: usize,
        max: usize,
    },

    /// The claim matched a denylisted phrase and the policy is `block`.
    #[error("Claim was blocked by input screening (matched \"{phrase}\")")]
    InjectionBlocked { phrase: String },

    /// The index was built with a different embedding model than the one
    /// now configured.
    #[error(
        "Embedding model mismatch: index was built with '{indexed}' ({indexed_dims} dims) \
         but the configured model is '{configured}' ({configured_dims} dims); rebuild the index"
    )]
    EmbeddingModelMismatch {
        indexed: String,
        indexed_dims: usize,
        configured: String,
        configured_dims: usize,
    },

    /// A caller-supplied argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The admin password or session token was wrong or missing.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Admin features were requested but no admin password is configured.
    #[error("Admin password is not configured. Set CPF_ADMIN_PASSWORD or [auth].admin_password")]
    AdminNotConfigured,

    /// An exported answer record could not be parsed.
    #[error("Malformed export: {0}")]
    Export(String),

    /// Filesystem error outside the index database.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl VerifyError {
    pub(crate) fn embedding(provider: &str, message: impl Into<String>) -> Self {
        VerifyError::EmbeddingService {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn generation(provider: &str, message: impl Into<String>) -> Self {
        VerifyError::GenerationService {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Machine-readable error code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            VerifyError::UnsupportedFormat(_) => "unsupported_format",
            VerifyError::EmptyDocument(_) => "empty_document",
            VerifyError::EmbeddingService { .. } => "embedding_service_error",
            VerifyError::Persistence(_) => "persistence_error",
            VerifyError::EmptyIndex => "empty_index",
            VerifyError::GenerationService { .. } => "generation_service_error",
            VerifyError::InputTooLong { .. } => "input_too_long",
            VerifyError::InjectionBlocked { .. } => "input_blocked",
            VerifyError::EmbeddingModelMismatch { .. } => "embedding_model_mismatch",
            VerifyError::InvalidArgument(_) => "bad_request",
            VerifyError::Unauthorized(_) => "unauthorized",
            VerifyError::AdminNotConfigured => "admin_not_configured",
            VerifyError::Export(_) => "bad_export",
            VerifyError::Io(_) => "internal",
        }
    }

    /// True for errors caused by user input rather than a provider or the
    /// environment. These block the action locally.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            VerifyError::UnsupportedFormat(_)
                | VerifyError::EmptyDocument(_)
                | VerifyError::InputTooLong { .. }
                | VerifyError::InjectionBlocked { .. }
                | VerifyError::InvalidArgument(_)
                | VerifyError::Export(_)
        )
    }
}

impl From<sqlx::Error> for VerifyError {
    fn from(err: sqlx::Error) -> Self {
        VerifyError::Persistence(err.to_string())
    }
}

/// A convenience result type for verifier operations.
pub type Result<T> = std::result::Result<T, VerifyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_are_classified() {
        assert!(VerifyError::InputTooLong {
            field: "claim".to_string(),
            len: 10,
            max: 5
        }.is_input_error());
        assert!(VerifyError::UnsupportedFormat(".docx".into()).is_input_error());
        assert!(!VerifyError::EmptyIndex.is_input_error());
        assert!(!VerifyError::embedding("OpenAI", "boom").is_input_error());
    }

    #[test]
    fn sqlx_errors_become_persistence() {
        let err: VerifyError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.code(), "persistence_error");
    }

    #[test]
    fn mismatch_message_names_both_models() {
        let err = VerifyError::EmbeddingModelMismatch {
            indexed: "text-embedding-3-small".into(),
            indexed_dims: 1536,
            configured: "hash-v1".into(),
            configured_dims: 256,
        };
        let msg = err.to_string();
        assert!(msg.contains("text-embedding-3-small"));
        assert!(msg.contains("hash-v1"));
    }
}
