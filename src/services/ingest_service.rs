//! src/services/ingest_service.rs
//!
//! IngestService — chunk staging, completion detection and ordered merging
//! backed by local disk. This file intentionally does **not** include any
//! database or external stores; the filesystem layout is the only persisted
//! state: a staging area partitioned per upload identity beneath
//! `staging_dir/{identity}/`, a flat output area for merged artifacts and a
//! flat thumbnail area.

use crate::{
    config::AppConfig,
    models::artifact::{IngestionResult, MergedArtifact},
    services::{media::MediaToolkit, naming},
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    collections::HashSet,
    io::{self, ErrorKind},
    path::PathBuf,
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("upload identity `{name}` invalid: {reason}")]
    InvalidIdentity { name: String, reason: String },
    #[error("no staged chunks for upload `{0}`")]
    NothingStaged(String),
    #[error("staged chunk `{0}` has no numeric sequence suffix")]
    UnparsableSequence(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type IngestResult<T> = Result<T, IngestError>;

/// Outcome of submitting one chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// More chunks are still expected, or another request already owns the
    /// merge for this upload.
    Pending,
    /// This chunk completed the upload and the pipeline ran.
    Completed(IngestionResult),
}

/// IngestService drives the chunk-assembly pipeline:
/// - Receive a chunk (write bytes to the upload's staging partition)
/// - Detect completion (staged count equals the client-supplied total)
/// - Merge (ordered concatenation into a uniquely named durable artifact)
/// - Probe and thumbnail the artifact, best-effort
///
/// This struct intentionally keeps a minimal surface area so it is easy to
/// test and reason about. The thin HTTP layer calls `submit_chunk` and
/// serves the resulting files statically.
#[derive(Clone)]
pub struct IngestService {
    /// Staging area root; each upload identity gets its own subdirectory.
    pub staging_dir: PathBuf,

    /// Durable output area for merged artifacts.
    pub output_dir: PathBuf,

    /// Output area for extracted thumbnails.
    pub thumbnail_dir: PathBuf,

    public_base_url: String,
    toolkit: MediaToolkit,

    /// Upload identities with a merge currently running. Guards the merge so
    /// it runs at most once per completed upload even when the final chunks
    /// finish on concurrent connections.
    merges_in_flight: Arc<Mutex<HashSet<String>>>,
}

const MAX_IDENTITY_LEN: usize = 255;

impl IngestService {
    /// Create a new IngestService from the application configuration.
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            staging_dir: PathBuf::from(&cfg.staging_dir),
            output_dir: PathBuf::from(&cfg.output_dir),
            thumbnail_dir: PathBuf::from(&cfg.thumbnail_dir),
            public_base_url: cfg.public_base_url.trim_end_matches('/').to_string(),
            toolkit: MediaToolkit::new(cfg.ffmpeg_bin.clone(), cfg.ffprobe_bin.clone()),
            merges_in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Validate an upload identity before it is used as a path component.
    ///
    /// Identities are client-supplied original filenames; they must be bare
    /// file names carrying an extension, free of traversal vectors.
    fn ensure_identity_safe(&self, identity: &str) -> IngestResult<()> {
        let invalid = |reason: &str| IngestError::InvalidIdentity {
            name: identity.to_string(),
            reason: reason.to_string(),
        };

        if identity.is_empty() {
            return Err(invalid("cannot be empty"));
        }
        if identity.len() > MAX_IDENTITY_LEN {
            return Err(invalid("longer than 255 bytes"));
        }
        if identity.contains('/') || identity.contains('\\') {
            return Err(invalid("must be a bare file name"));
        }
        if identity.contains("..") {
            return Err(invalid("cannot contain `..`"));
        }
        if identity.starts_with('.') {
            return Err(invalid("cannot start with a dot"));
        }
        if identity.bytes().any(|b| b.is_ascii_control()) {
            return Err(invalid("cannot contain control characters"));
        }
        match identity.rsplit_once('.') {
            Some((stem, extension)) if !stem.is_empty() && !extension.is_empty() => Ok(()),
            _ => Err(invalid("must carry a file extension")),
        }
    }

    /// Staging partition for one upload identity.
    fn staging_root(&self, identity: &str) -> PathBuf {
        self.staging_dir.join(identity)
    }

    /// Staged location of one chunk. The name encodes the owning filename
    /// and the 1-based sequence number.
    fn chunk_path(&self, identity: &str, sequence: u64) -> PathBuf {
        self.staging_root(identity)
            .join(format!("{}.part{}", identity, sequence))
    }

    /// Stream one chunk's bytes into the upload's staging partition.
    ///
    /// - Writes incrementally to a temporary file, then renames into place,
    ///   so a failed write never leaves a half-staged chunk behind.
    /// - Re-submitting the same (identity, sequence) pair overwrites the
    ///   previous bytes: idempotent by key, last write wins.
    /// - A write failure aborts only this chunk; sibling chunks and other
    ///   uploads are untouched.
    pub async fn receive_chunk<S>(&self, identity: &str, sequence: u64, stream: S) -> IngestResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_identity_safe(identity)?;

        let staging_root = self.staging_root(identity);
        fs::create_dir_all(&staging_root).await?;

        let tmp_path = staging_root.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        pin_mut!(stream);
        while let Some(part) = stream.next().await {
            let part = match part {
                Ok(part) => part,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(IngestError::Io(err));
                }
            };
            if let Err(err) = file.write_all(&part).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(IngestError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(IngestError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(IngestError::Io(err));
        }

        let chunk_path = self.chunk_path(identity, sequence);
        if let Err(err) = fs::rename(&tmp_path, &chunk_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(IngestError::Io(err));
        }

        debug!("staged chunk {} of `{}`", sequence, identity);
        Ok(())
    }

    /// Count chunks currently staged for one upload identity.
    ///
    /// Point-in-time and side-effect free, so it is safe to call repeatedly.
    /// Temporary dot-files from in-flight writes are not counted.
    pub async fn staged_chunk_count(&self, identity: &str) -> IngestResult<usize> {
        self.ensure_identity_safe(identity)?;

        let mut entries = match fs::read_dir(self.staging_root(identity)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_name().to_string_lossy().starts_with('.') {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Whether every expected chunk for this upload has been staged.
    pub async fn is_complete(&self, identity: &str, expected_chunks: u64) -> IngestResult<bool> {
        Ok(self.staged_chunk_count(identity).await? as u64 == expected_chunks)
    }

    /// Merge all staged chunks of one upload into a durable artifact.
    ///
    /// Chunks are sorted by the numeric suffix of their staged names; a name
    /// without a parsable suffix fails the merge before any chunk is
    /// consumed, rather than risking silent byte misordering. Duplicate
    /// suffixes are appended in deterministic name order, never dropped.
    ///
    /// Each chunk is deleted from staging immediately after it is appended,
    /// so a crash mid-merge leaves the not-yet-appended chunks plus the
    /// partially assembled working file behind for recovery. The working
    /// file lives in the output directory, so the final rename to the
    /// generated unique name stays on one filesystem and is atomic.
    pub async fn merge_staged(&self, identity: &str) -> IngestResult<MergedArtifact> {
        self.ensure_identity_safe(identity)?;

        let staging_root = self.staging_root(identity);
        let mut entries = match fs::read_dir(&staging_root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(IngestError::NothingStaged(identity.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let mut staged = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let sequence = parse_sequence_suffix(&name)
                .ok_or_else(|| IngestError::UnparsableSequence(name.clone()))?;
            staged.push((sequence, name));
        }
        if staged.is_empty() {
            return Err(IngestError::NothingStaged(identity.to_string()));
        }
        staged.sort();

        let output_name = naming::unique_file_name(identity);
        let working_path = self.output_dir.join(format!(".merge-{}", Uuid::new_v4()));
        let mut output = File::create(&working_path).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        for (_, name) in &staged {
            let chunk_path = staging_root.join(name);
            let bytes = fs::read(&chunk_path).await?;
            digest.consume(&bytes);
            size_bytes += bytes.len() as u64;
            output.write_all(&bytes).await?;
            fs::remove_file(&chunk_path).await?;
        }
        output.flush().await?;
        output.sync_all().await?;
        drop(output);

        let final_path = self.output_dir.join(&output_name);
        fs::rename(&working_path, &final_path).await?;

        // The partition is empty unless chunks were re-submitted mid-merge.
        if let Err(err) = fs::remove_dir(&staging_root).await {
            debug!(
                "staging partition {} not removed: {}",
                staging_root.display(),
                err
            );
        }

        info!(
            "merged {} chunks of `{}` into {} ({} bytes)",
            staged.len(),
            identity,
            output_name,
            size_bytes
        );

        Ok(MergedArtifact {
            url: format!("{}/files/{}", self.public_base_url, output_name),
            name: output_name,
            path: final_path,
            size_bytes,
            checksum: format!("{:x}", digest.compute()),
            merged_at: Utc::now(),
        })
    }

    /// Ingest one chunk: stage it, check completion and, when this chunk is
    /// the last to arrive, run the merge → probe → thumbnail pipeline.
    ///
    /// The merge is guarded per identity so it runs at most once even when
    /// the final chunks of an upload finish on concurrent connections; the
    /// losing request sees `Pending`. A merge failure releases the guard and
    /// leaves the staged chunks in place for diagnosis or retry.
    pub async fn submit_chunk<S>(
        &self,
        identity: &str,
        sequence: u64,
        expected_chunks: u64,
        stream: S,
    ) -> IngestResult<ChunkOutcome>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.receive_chunk(identity, sequence, stream).await?;

        if !self.is_complete(identity, expected_chunks).await? {
            return Ok(ChunkOutcome::Pending);
        }

        {
            let mut in_flight = self.merges_in_flight.lock().await;
            if !in_flight.insert(identity.to_string()) {
                debug!("merge of `{}` already in flight", identity);
                return Ok(ChunkOutcome::Pending);
            }
        }

        let merged = match self.merge_staged(identity).await {
            Ok(artifact) => artifact,
            Err(err) => {
                self.merges_in_flight.lock().await.remove(identity);
                return Err(err);
            }
        };

        let result = self.derive_media(merged).await;
        self.merges_in_flight.lock().await.remove(identity);
        Ok(ChunkOutcome::Completed(result))
    }

    /// Probe the artifact and extract its thumbnail, both best-effort.
    ///
    /// A probe failure leaves the metadata zeroed and skips the thumbnail;
    /// a thumbnail failure leaves the result without one. Neither invalidates
    /// the merged artifact.
    async fn derive_media(&self, artifact: MergedArtifact) -> IngestionResult {
        let metadata = match self.toolkit.probe(&artifact.path).await {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                warn!("probe of {} failed: {}", artifact.name, err);
                None
            }
        };

        let mut thumbnail = None;
        if let Some(metadata) = metadata {
            let thumbnail_name = naming::thumbnail_name(&artifact.name);
            let thumbnail_path = self.thumbnail_dir.join(&thumbnail_name);
            match self
                .toolkit
                .extract_thumbnail(
                    &artifact.path,
                    &thumbnail_path,
                    metadata.width,
                    metadata.height,
                )
                .await
            {
                Ok(()) => thumbnail = Some(thumbnail_name),
                Err(err) => warn!("thumbnail of {} failed: {}", artifact.name, err),
            }
        }

        IngestionResult::new(artifact, metadata, thumbnail)
    }
}

/// Extract the trailing decimal sequence number from a staged chunk name,
/// e.g. `clip.mp4.part12` → 12.
fn parse_sequence_suffix(name: &str) -> Option<u64> {
    let prefix_len = name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let digits = &name[prefix_len..];
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::path::Path;
    use tempfile::tempdir;

    fn test_config(root: &Path) -> AppConfig {
        AppConfig {
            host: "127.0.0.1".into(),
            port: 0,
            staging_dir: root.join("uploads").to_string_lossy().into_owned(),
            output_dir: root.join("merged_files").to_string_lossy().into_owned(),
            thumbnail_dir: root.join("thumbnails").to_string_lossy().into_owned(),
            public_base_url: "http://localhost:3001".into(),
            // Unresolvable on purpose: probe and thumbnail must fail
            // deterministically so tests hold without ffmpeg installed.
            ffmpeg_bin: "/nonexistent/ffmpeg".into(),
            ffprobe_bin: "/nonexistent/ffprobe".into(),
        }
    }

    fn service(root: &Path) -> IngestService {
        let cfg = test_config(root);
        for dir in [&cfg.staging_dir, &cfg.output_dir, &cfg.thumbnail_dir] {
            std::fs::create_dir_all(dir).unwrap();
        }
        IngestService::new(&cfg)
    }

    fn chunk(bytes: &[u8]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(vec![Ok(Bytes::copy_from_slice(bytes))])
    }

    fn output_files(service: &IngestService) -> Vec<String> {
        std::fs::read_dir(&service.output_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn out_of_order_arrival_merges_in_sequence_order() {
        let root = tempdir().unwrap();
        let service = service(root.path());

        let first = service
            .submit_chunk("clip.mp4", 2, 2, chunk(b"-second"))
            .await
            .unwrap();
        assert!(matches!(first, ChunkOutcome::Pending));

        let second = service
            .submit_chunk("clip.mp4", 1, 2, chunk(b"first"))
            .await
            .unwrap();
        let ChunkOutcome::Completed(result) = second else {
            panic!("upload should have completed");
        };

        assert!(result.artifact_name.ends_with(".mp4"));
        assert!(result.artifact_url.contains("/files/"));
        let merged = std::fs::read(&result.artifact_path).unwrap();
        assert_eq!(merged, b"first-second");
    }

    #[tokio::test]
    async fn three_chunk_upload_yields_exact_concatenation() {
        let root = tempdir().unwrap();
        let service = service(root.path());

        let chunks = [vec![b'a'; 1000], vec![b'b'; 1000], vec![b'c'; 500]];
        let mut completed = None;
        for (index, bytes) in chunks.iter().enumerate() {
            let outcome = service
                .submit_chunk("clip.mp4", index as u64 + 1, 3, chunk(bytes))
                .await
                .unwrap();
            if let ChunkOutcome::Completed(result) = outcome {
                completed = Some(result);
            }
        }

        let result = completed.expect("third chunk should complete the upload");
        assert_eq!(result.size_bytes, 2500);
        assert!(result.artifact_name.ends_with(".mp4"));
        assert_eq!(
            std::fs::metadata(&result.artifact_path).unwrap().len(),
            2500
        );

        // Probe failed (toolkit unavailable): artifact survives, metadata
        // degrades to zero, no thumbnail.
        assert_eq!(result.width, 0);
        assert_eq!(result.height, 0);
        assert_eq!(result.duration_secs, 0);
        assert!(!result.thumbnail_available);
        assert!(result.thumbnail.is_none());
    }

    #[tokio::test]
    async fn resubmitted_chunk_is_idempotent_by_key() {
        let root = tempdir().unwrap();
        let service = service(root.path());

        service
            .submit_chunk("clip.mp4", 1, 2, chunk(b"stale"))
            .await
            .unwrap();
        let retry = service
            .submit_chunk("clip.mp4", 1, 2, chunk(b"fresh"))
            .await
            .unwrap();
        assert!(matches!(retry, ChunkOutcome::Pending));

        let last = service
            .submit_chunk("clip.mp4", 2, 2, chunk(b"+tail"))
            .await
            .unwrap();
        let ChunkOutcome::Completed(result) = last else {
            panic!("upload should have completed");
        };
        assert_eq!(std::fs::read(&result.artifact_path).unwrap(), b"fresh+tail");
    }

    #[tokio::test]
    async fn concurrent_final_chunks_merge_exactly_once() {
        let root = tempdir().unwrap();
        let service = service(root.path());

        service
            .submit_chunk("clip.mp4", 1, 3, chunk(b"A"))
            .await
            .unwrap();

        let (left, right) = tokio::join!(
            service.submit_chunk("clip.mp4", 2, 3, chunk(b"B")),
            service.submit_chunk("clip.mp4", 3, 3, chunk(b"C")),
        );

        let outcomes = [left.unwrap(), right.unwrap()];
        let completed: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                ChunkOutcome::Completed(result) => Some(result),
                ChunkOutcome::Pending => None,
            })
            .collect();

        assert_eq!(completed.len(), 1, "exactly one request must merge");
        assert_eq!(output_files(&service).len(), 1);
        let merged = std::fs::read(&completed[0].artifact_path).unwrap();
        assert_eq!(merged, b"ABC");
    }

    #[tokio::test]
    async fn unparsable_suffix_fails_merge_and_preserves_chunks() {
        let root = tempdir().unwrap();
        let service = service(root.path());

        service
            .receive_chunk("clip.mp4", 1, chunk(b"A"))
            .await
            .unwrap();
        service
            .receive_chunk("clip.mp4", 2, chunk(b"B"))
            .await
            .unwrap();
        let staging_root = service.staging_dir.join("clip.mp4");
        std::fs::write(staging_root.join("clip.mp4.partfinal"), b"C").unwrap();

        let err = service.merge_staged("clip.mp4").await.unwrap_err();
        assert!(matches!(err, IngestError::UnparsableSequence(_)));

        // No chunk was consumed and nothing reached the output area.
        assert_eq!(std::fs::read_dir(&staging_root).unwrap().count(), 3);
        assert!(output_files(&service).is_empty());
    }

    #[tokio::test]
    async fn concurrent_uploads_do_not_cross_contaminate() {
        let root = tempdir().unwrap();
        let service = service(root.path());

        service
            .submit_chunk("one.mp4", 1, 2, chunk(b"one-head"))
            .await
            .unwrap();
        service
            .submit_chunk("two.mp4", 1, 2, chunk(b"two-head"))
            .await
            .unwrap();

        let one = service
            .submit_chunk("one.mp4", 2, 2, chunk(b"+one-tail"))
            .await
            .unwrap();
        let ChunkOutcome::Completed(one) = one else {
            panic!("first upload should have completed");
        };
        assert_eq!(
            std::fs::read(&one.artifact_path).unwrap(),
            b"one-head+one-tail"
        );

        // The second upload is untouched by the first merge.
        assert_eq!(service.staged_chunk_count("two.mp4").await.unwrap(), 1);
        let two = service
            .submit_chunk("two.mp4", 2, 2, chunk(b"+two-tail"))
            .await
            .unwrap();
        let ChunkOutcome::Completed(two) = two else {
            panic!("second upload should have completed");
        };
        assert_eq!(
            std::fs::read(&two.artifact_path).unwrap(),
            b"two-head+two-tail"
        );
        assert_ne!(one.artifact_name, two.artifact_name);
    }

    #[tokio::test]
    async fn invalid_identities_are_rejected() {
        let root = tempdir().unwrap();
        let service = service(root.path());

        for identity in ["", "../evil.mp4", "a/b.mp4", "a\\b.mp4", "noext", ".mp4"] {
            let err = service
                .receive_chunk(identity, 1, chunk(b"x"))
                .await
                .unwrap_err();
            assert!(
                matches!(err, IngestError::InvalidIdentity { .. }),
                "`{}` should be rejected",
                identity
            );
        }
    }

    #[tokio::test]
    async fn merge_without_staged_chunks_fails() {
        let root = tempdir().unwrap();
        let service = service(root.path());

        let err = service.merge_staged("ghost.mp4").await.unwrap_err();
        assert!(matches!(err, IngestError::NothingStaged(_)));
    }

    #[test]
    fn sequence_suffix_parsing() {
        assert_eq!(parse_sequence_suffix("clip.mp4.part12"), Some(12));
        assert_eq!(parse_sequence_suffix("clip.mp4.part1"), Some(1));
        assert_eq!(parse_sequence_suffix("clip.mp4.part"), None);
        assert_eq!(parse_sequence_suffix("clip.mp4"), Some(4));
        assert_eq!(parse_sequence_suffix(""), None);
    }
}
