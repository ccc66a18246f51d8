//! Policy context retrieval over a pre-built snippet store.
//!
//! The retriever wraps a directory of platform policy documents maintained by
//! an external indexing process. The index is loaded lazily on first use; if
//! loading fails the retriever tries again on the next query and otherwise
//! returns an empty string. Callers must treat empty context as "fall back to
//! the model's general policy knowledge", never as an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tokio::sync::RwLock;

const SUPPORTED_EXTENSIONS: [&str; 2] = ["md", "txt"];
const SNIPPET_SEPARATOR: &str = "\n\n";
const MIN_TERM_LEN: usize = 3;

#[derive(Debug, Error)]
enum RetrievalError {
    #[error("policy document directory {path} is unavailable: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("policy document directory {path} holds no usable documents")]
    EmptyIndex { path: PathBuf },
}

#[derive(Debug, Clone)]
struct PolicySnippet {
    source: String,
    body: String,
}

#[derive(Debug)]
struct SnippetIndex {
    snippets: Vec<PolicySnippet>,
}

impl SnippetIndex {
    async fn load(dir: &Path) -> Result<Self, RetrievalError> {
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|source| {
            RetrievalError::Load {
                path: dir.to_path_buf(),
                source,
            }
        })?;

        let mut snippets = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| {
            RetrievalError::Load {
                path: dir.to_path_buf(),
                source,
            }
        })? {
            let path = entry.path();
            let supported = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
            if !supported {
                continue;
            }

            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "skipping unreadable policy document");
                    continue;
                }
            };

            let source = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or("policy")
                .to_string();

            for paragraph in text.split("\n\n") {
                let body = paragraph.trim();
                if body.is_empty() {
                    continue;
                }
                snippets.push(PolicySnippet {
                    source: source.clone(),
                    body: body.to_string(),
                });
            }
        }

        if snippets.is_empty() {
            return Err(RetrievalError::EmptyIndex {
                path: dir.to_path_buf(),
            });
        }

        Ok(Self { snippets })
    }

    /// Rank snippets by query-term overlap and return at most `top_k`.
    fn search(&self, query: &str, top_k: usize) -> Vec<&PolicySnippet> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, &PolicySnippet)> = self
            .snippets
            .iter()
            .filter_map(|snippet| {
                let haystack = snippet.body.to_lowercase();
                let mut distinct = 0usize;
                let mut occurrences = 0usize;
                for term in &terms {
                    let count = haystack.matches(term.as_str()).count();
                    if count > 0 {
                        distinct += 1;
                        occurrences += count;
                    }
                }
                if distinct == 0 {
                    return None;
                }
                // Distinct term coverage dominates raw repetition.
                Some((distinct * 1000 + occurrences, snippet))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(top_k).map(|(_, s)| s).collect()
    }
}

pub struct PolicyRetriever {
    docs_dir: PathBuf,
    top_k: usize,
    max_context_bytes: usize,
    index: RwLock<Option<Arc<SnippetIndex>>>,
    queries: AtomicUsize,
}

impl PolicyRetriever {
    pub fn new(docs_dir: impl Into<PathBuf>, top_k: usize, max_context_bytes: usize) -> Self {
        Self {
            docs_dir: docs_dir.into(),
            top_k: top_k.max(1),
            max_context_bytes,
            index: RwLock::new(None),
            queries: AtomicUsize::new(0),
        }
    }

    /// Number of retrieval queries served by this instance.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    /// Return bounded policy context for one platform question. Never fails:
    /// an unavailable index (after one lazy re-initialization attempt) yields
    /// an empty string.
    pub async fn query(&self, platform: &str, question: &str) -> String {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let index = match self.ensure_index().await {
            Ok(index) => index,
            Err(error) => {
                tracing::warn!(%error, "policy index unavailable; returning empty context");
                return String::new();
            }
        };

        // The platform name steers retrieval toward the right rulebook.
        let enhanced = format!("Regarding {platform} policies: {question}");
        let hits = index.search(&enhanced, self.top_k);
        if hits.is_empty() {
            tracing::debug!(platform, "no policy snippets matched the query");
            return String::new();
        }

        bounded_context(&hits, self.max_context_bytes)
    }

    async fn ensure_index(&self) -> Result<Arc<SnippetIndex>, RetrievalError> {
        if let Some(index) = self.index.read().await.as_ref() {
            return Ok(Arc::clone(index));
        }

        // One re-initialization attempt per query; a loss between the read
        // and write locks just means the winner's index is reused.
        let mut slot = self.index.write().await;
        if let Some(index) = slot.as_ref() {
            return Ok(Arc::clone(index));
        }

        let loaded = Arc::new(SnippetIndex::load(&self.docs_dir).await?);
        tracing::info!(
            dir = %self.docs_dir.display(),
            snippets = loaded.snippets.len(),
            "policy snippet index loaded"
        );
        *slot = Some(Arc::clone(&loaded));
        Ok(loaded)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    for raw in text.split(|c: char| !c.is_alphanumeric()) {
        if raw.len() < MIN_TERM_LEN {
            continue;
        }
        let term = raw.to_lowercase();
        if !terms.contains(&term) {
            terms.push(term);
        }
    }
    terms
}

fn bounded_context(hits: &[&PolicySnippet], max_bytes: usize) -> String {
    let mut out = String::new();
    for snippet in hits {
        let piece = format!("[{}] {}", snippet.source, snippet.body);
        if out.is_empty() {
            if piece.len() > max_bytes {
                // A single oversized snippet is truncated on a char boundary.
                let mut end = max_bytes;
                while end > 0 && !piece.is_char_boundary(end) {
                    end -= 1;
                }
                out.push_str(&piece[..end]);
                break;
            }
            out.push_str(&piece);
        } else {
            if out.len() + SNIPPET_SEPARATOR.len() + piece.len() > max_bytes {
                break;
            }
            out.push_str(SNIPPET_SEPARATOR);
            out.push_str(&piece);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const QUESTION: &str = "What are the core community guidelines and safety policies?";

    fn write_doc(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[tokio::test]
    async fn missing_directory_yields_empty_context() {
        let retriever = PolicyRetriever::new("/nonexistent/policy_docs", 5, 16384);
        assert_eq!(retriever.query("TikTok", QUESTION).await, "");
        // A second query attempts re-initialization and still recovers.
        assert_eq!(retriever.query("TikTok", QUESTION).await, "");
    }

    #[tokio::test]
    async fn index_initializes_lazily_on_a_later_query() {
        let docs = TempDir::new().unwrap();
        let missing = docs.path().join("docs");
        let retriever = PolicyRetriever::new(&missing, 5, 16384);

        assert_eq!(retriever.query("TikTok", QUESTION).await, "");

        std::fs::create_dir_all(&missing).unwrap();
        write_doc(
            &missing,
            "tiktok.md",
            "TikTok community guidelines prohibit dangerous weapons content.",
        );

        let context = retriever.query("TikTok", QUESTION).await;
        assert!(
            context.contains("dangerous weapons"),
            "re-initialized index must serve snippets: {context:?}"
        );
    }

    #[tokio::test]
    async fn retrieval_ranks_matching_documents_first() {
        let docs = TempDir::new().unwrap();
        write_doc(
            docs.path(),
            "tiktok.md",
            "TikTok community guidelines cover safety policies for minors.\n\nUnrelated archival note.",
        );
        write_doc(docs.path(), "recipes.txt", "How to bake bread at home.");

        let retriever = PolicyRetriever::new(docs.path(), 1, 16384);
        let context = retriever.query("TikTok", QUESTION).await;

        assert!(context.contains("community guidelines"));
        assert!(!context.contains("bake bread"));
    }

    #[tokio::test]
    async fn context_respects_the_byte_budget() {
        let docs = TempDir::new().unwrap();
        let paragraph = "Community safety policies for the platform. ".repeat(20);
        write_doc(
            docs.path(),
            "policy.md",
            &format!("{paragraph}\n\n{paragraph}\n\n{paragraph}"),
        );

        let retriever = PolicyRetriever::new(docs.path(), 5, 256);
        let context = retriever.query("TikTok", QUESTION).await;

        assert!(!context.is_empty());
        assert!(context.len() <= 256, "context length {} exceeds budget", context.len());
    }

    #[test]
    fn tokenize_drops_short_terms_and_duplicates() {
        let terms = tokenize("Regarding TikTok policies: is it ok? TikTok!");
        assert_eq!(terms, vec!["regarding", "tiktok", "policies"]);
    }
}
