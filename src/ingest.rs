//! Ingestion pipeline: validate → extract → chunk → embed and store.
//!
//! A source that yields no text is the non-fatal
//! [`IngestOutcome::NothingToIngest`]. On success the normalized text is
//! also written to `<artifacts.dir>/<user>/<name>.md` for auditing; that
//! write is best-effort and never changes the outcome.

use std::path::PathBuf;
use std::sync::Arc;

use kbchat_core::chunk::normalize_text;
use kbchat_core::{Error, Provider, Result, UserId};

use crate::extract::{self, PageExtractor, MIME_PDF};
use crate::knowledge::KnowledgeStores;

/// Something to add to a user's knowledge base.
#[derive(Debug, Clone)]
pub enum IngestSource {
    /// Text that is already markdown or plain text.
    Text { name: String, text: String },
    /// Raw PDF bytes, converted to one `## Page N` section per page.
    Pdf { name: String, bytes: Vec<u8> },
    /// A web page fetched through the page extractor.
    Url(String),
}

impl IngestSource {
    /// Build a source from an uploaded document and its content type.
    pub fn document(name: &str, content_type: &str, bytes: Vec<u8>) -> Result<Self> {
        if content_type == MIME_PDF {
            return Ok(IngestSource::Pdf {
                name: name.to_string(),
                bytes,
            });
        }
        let text = extract::extract_document(&bytes, content_type)?;
        Ok(IngestSource::Text {
            name: name.to_string(),
            text,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            IngestSource::Text { name, .. } | IngestSource::Pdf { name, .. } => name,
            IngestSource::Url(url) => url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested { source: String, chunks: usize },
    NothingToIngest { source: String },
}

impl IngestOutcome {
    pub fn is_ingested(&self) -> bool {
        matches!(self, IngestOutcome::Ingested { .. })
    }

    pub fn chunks(&self) -> usize {
        match self {
            IngestOutcome::Ingested { chunks, .. } => *chunks,
            IngestOutcome::NothingToIngest { .. } => 0,
        }
    }
}

pub struct Ingestor {
    stores: Arc<KnowledgeStores>,
    extractor: Arc<dyn PageExtractor>,
    artifacts_dir: Option<PathBuf>,
}

impl Ingestor {
    pub fn new(stores: Arc<KnowledgeStores>, extractor: Arc<dyn PageExtractor>) -> Self {
        Self {
            stores,
            extractor,
            artifacts_dir: None,
        }
    }

    pub fn with_artifacts_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.artifacts_dir = dir;
        self
    }

    pub async fn ingest(&self, user: &UserId, source: IngestSource) -> Result<IngestOutcome> {
        let name = source.name().trim().to_string();
        if name.is_empty() {
            return Err(Error::Validation("source name must not be empty".to_string()));
        }

        let text = match source {
            IngestSource::Text { text, .. } => Some(text),
            IngestSource::Pdf { bytes, .. } => Some(pdf_to_text(bytes).await?),
            IngestSource::Url(url) => {
                let url = extract::validate_url(&url)?;
                self.extractor.extract(&url).await?
            }
        };

        let normalized = text.as_deref().map(normalize_text).unwrap_or_default();
        if normalized.is_empty() {
            tracing::warn!(user = %user, source = %name, "nothing to ingest");
            return Ok(IngestOutcome::NothingToIngest { source: name });
        }

        let chunks = self.stores.chunker().split(&normalized, &name);
        if chunks.is_empty() {
            return Ok(IngestOutcome::NothingToIngest { source: name });
        }

        let index = self.stores.open_or_create(user).await?;
        let written = self.stores.upsert(&index, &chunks).await?;
        tracing::info!(user = %user, source = %name, chunks = written, "ingested");

        self.write_artifact(user, &name, &normalized).await;
        Ok(IngestOutcome::Ingested {
            source: name,
            chunks: written,
        })
    }

    async fn write_artifact(&self, user: &UserId, name: &str, text: &str) {
        let Some(dir) = &self.artifacts_dir else {
            return;
        };
        let dir = dir.join(user.as_str());
        let path = dir.join(format!("{}.md", artifact_stem(name)));
        let result = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, text).await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "failed to write ingest artifact");
        }
    }
}

async fn pdf_to_text(bytes: Vec<u8>) -> Result<String> {
    tokio::task::spawn_blocking(move || extract::extract_document(&bytes, MIME_PDF))
        .await
        .map_err(extraction_aborted)?
        .map_err(Error::from)
}

fn extraction_aborted(err: tokio::task::JoinError) -> Error {
    Error::provider(
        Provider::Extraction,
        format!("PDF extraction aborted: {}", err),
    )
}

/// A file-name-safe stem for an artifact, derived from the source name.
///
/// The source's own extension is kept, so `a.md` and `a.pdf` never share
/// an artifact.
pub fn artifact_stem(name: &str) -> String {
    let stem: String = name
        .trim_end_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = stem.trim_matches(|c| c == '_' || c == '.');
    if stem.is_empty() {
        "source".to_string()
    } else {
        stem.chars().take(120).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_stem() {
        assert_eq!(artifact_stem("report.pdf"), "report.pdf");
        assert_eq!(artifact_stem("guides/setup.md"), "guides_setup.md");
        assert_ne!(artifact_stem("notes.md"), artifact_stem("notes.pdf"));
        assert_eq!(
            artifact_stem("https://example.com/a?b=1"),
            "https___example.com_a_b_1"
        );
        assert_eq!(artifact_stem("../.."), "source");
    }

    #[tokio::test]
    async fn test_aborted_extraction_is_a_provider_failure() {
        let join_err = tokio::task::spawn_blocking(|| panic!("decoder crashed"))
            .await
            .unwrap_err();
        let err = extraction_aborted(join_err);
        assert!(matches!(
            err,
            Error::ProviderUnavailable {
                provider: Provider::Extraction,
                ..
            }
        ));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_document_source_dispatch() {
        let source = IngestSource::document("a.pdf", MIME_PDF, vec![1, 2]).unwrap();
        assert!(matches!(source, IngestSource::Pdf { .. }));
        let source = IngestSource::document("a.md", "text/markdown", b"# A".to_vec()).unwrap();
        assert!(matches!(source, IngestSource::Text { ref text, .. } if text == "# A"));
        assert!(IngestSource::document("a.bin", "application/zip", vec![]).is_err());
    }

    #[test]
    fn test_outcome_helpers() {
        let ok = IngestOutcome::Ingested {
            source: "a".into(),
            chunks: 3,
        };
        assert!(ok.is_ingested());
        assert_eq!(ok.chunks(), 3);
        let none = IngestOutcome::NothingToIngest { source: "a".into() };
        assert!(!none.is_ingested());
        assert_eq!(none.chunks(), 0);
    }
}
