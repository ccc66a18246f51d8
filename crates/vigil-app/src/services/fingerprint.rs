//! Streaming content identity for uploaded media.
//!
//! Uploads are spooled to scratch storage in chunks while a BLAKE3 hasher
//! consumes the same bytes, so the digest never requires the payload in
//! memory. The digest is the deduplication key: identical bytes always yield
//! the identical fingerprint regardless of filename or upload time.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use vigil_server::ByteStream;

const DEFAULT_SUFFIX: &str = ".mp4";

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("upload contained no bytes")]
    EmptyUpload,
    #[error("failed to read upload stream: {0}")]
    Stream(String),
    #[error("scratch storage error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FingerprintError {
    fn from(e: std::io::Error) -> Self {
        FingerprintError::Io(e.to_string())
    }
}

/// One fingerprinted upload: content digest plus the scratch file holding the
/// bytes. The file is removed when this value drops, so cleanup holds on every
/// exit path, including cancellation.
pub struct UploadFingerprint {
    pub digest: String,
    pub size_bytes: u64,
    temp: NamedTempFile,
}

impl UploadFingerprint {
    pub fn path(&self) -> &Path {
        self.temp.path()
    }
}

#[derive(Debug, Clone)]
pub struct ContentFingerprinter {
    scratch_dir: PathBuf,
}

impl ContentFingerprinter {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Stream `payload` into a scratch file while computing its BLAKE3 digest.
    /// The file is fully written and flushed before returning.
    pub async fn fingerprint(
        &self,
        filename: Option<&str>,
        mut payload: ByteStream,
    ) -> Result<UploadFingerprint, FingerprintError> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;

        let suffix = suffix_for(filename);
        let temp = tempfile::Builder::new()
            .suffix(&suffix)
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| FingerprintError::Io(format!("create scratch file: {e}")))?;
        let mut file = tokio::fs::File::from_std(
            temp.reopen()
                .map_err(|e| FingerprintError::Io(format!("reopen scratch file: {e}")))?,
        );

        let mut hasher = blake3::Hasher::new();
        let mut total_bytes: u64 = 0;

        while let Some(chunk) = payload.next().await {
            let chunk = chunk.map_err(|e| FingerprintError::Stream(e.to_string()))?;
            total_bytes = total_bytes
                .checked_add(chunk.len() as u64)
                .ok_or_else(|| FingerprintError::Io("size overflow".to_string()))?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| FingerprintError::Io(format!("write chunk: {e}")))?;
        }

        if total_bytes == 0 {
            return Err(FingerprintError::EmptyUpload);
        }

        file.flush()
            .await
            .map_err(|e| FingerprintError::Io(format!("flush scratch file: {e}")))?;
        drop(file);

        Ok(UploadFingerprint {
            digest: hasher.finalize().to_hex().to_string(),
            size_bytes: total_bytes,
            temp,
        })
    }
}

/// BLAKE3 digest of an in-memory payload (the transcript analysis path).
pub fn digest_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn suffix_for(filename: Option<&str>) -> String {
    filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_else(|| DEFAULT_SUFFIX.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn chunks_to_stream(chunks: Vec<Vec<u8>>) -> ByteStream {
        let s = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))));
        Box::pin(s)
    }

    #[tokio::test]
    async fn digest_is_stable_across_runs() {
        let scratch = TempDir::new().unwrap();
        let fp = ContentFingerprinter::new(scratch.path());

        let first = fp
            .fingerprint(Some("a.mp4"), chunks_to_stream(vec![b"hello world".to_vec()]))
            .await
            .unwrap();
        let second = fp
            .fingerprint(Some("b.mp4"), chunks_to_stream(vec![b"hello world".to_vec()]))
            .await
            .unwrap();

        assert_eq!(first.digest, second.digest, "filename must not affect identity");
        assert_eq!(first.size_bytes, 11);
    }

    #[tokio::test]
    async fn single_byte_change_alters_digest() {
        let scratch = TempDir::new().unwrap();
        let fp = ContentFingerprinter::new(scratch.path());

        let base = fp
            .fingerprint(None, chunks_to_stream(vec![b"hello world".to_vec()]))
            .await
            .unwrap();
        let perturbed = fp
            .fingerprint(None, chunks_to_stream(vec![b"hello worle".to_vec()]))
            .await
            .unwrap();

        assert_ne!(base.digest, perturbed.digest);
    }

    #[tokio::test]
    async fn scratch_file_holds_payload_and_drops_clean() {
        let scratch = TempDir::new().unwrap();
        let fp = ContentFingerprinter::new(scratch.path());

        let chunks = vec![b"hello".to_vec(), b" ".to_vec(), b"world".to_vec()];
        let print = fp.fingerprint(Some("clip.mp4"), chunks_to_stream(chunks)).await.unwrap();

        let written = std::fs::read(print.path()).unwrap();
        assert_eq!(written, b"hello world");
        assert_eq!(print.digest, digest_bytes(b"hello world"));

        let path = print.path().to_path_buf();
        drop(print);
        assert!(!path.exists(), "scratch file must be removed on drop");
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let scratch = TempDir::new().unwrap();
        let fp = ContentFingerprinter::new(scratch.path());

        let result = fp.fingerprint(None, chunks_to_stream(vec![])).await;
        assert!(matches!(result, Err(FingerprintError::EmptyUpload)));

        let leftovers: Vec<_> = std::fs::read_dir(scratch.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "rejected uploads must not leak files");
    }

    #[test]
    fn suffix_follows_filename_extension() {
        assert_eq!(suffix_for(Some("clip.webm")), ".webm");
        assert_eq!(suffix_for(Some("noext")), ".mp4");
        assert_eq!(suffix_for(None), ".mp4");
    }

    proptest! {
        #[test]
        fn chunking_never_changes_the_digest(data in proptest::collection::vec(any::<u8>(), 1..1024)) {
            // Split deterministically into uneven chunks to simulate arbitrary
            // transport chunking.
            let mut chunks: Vec<Vec<u8>> = Vec::new();
            let mut i = 0usize;
            while i < data.len() {
                let rem = data.len() - i;
                let take = std::cmp::max(1, std::cmp::min(64, rem) / 2);
                let end = i + take;
                chunks.push(data[i..end].to_vec());
                i = end;
            }

            let rt = tokio::runtime::Runtime::new().unwrap();
            let digest = rt.block_on(async {
                let scratch = TempDir::new().unwrap();
                let fp = ContentFingerprinter::new(scratch.path());
                fp.fingerprint(None, chunks_to_stream(chunks)).await.unwrap().digest
            });

            prop_assert_eq!(digest, blake3::hash(&data).to_hex().to_string());
        }
    }
}
