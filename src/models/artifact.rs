//! Represents a merged artifact and the facts derived from it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single durable file produced by concatenating all chunks of one upload
/// in ascending sequence order.
///
/// Once written the artifact is immutable; its generated name never collides
/// with any other artifact.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MergedArtifact {
    /// Generated collision-resistant filename.
    pub name: String,

    /// Location of the artifact in the output directory.
    pub path: PathBuf,

    /// Public URL under which the artifact can be fetched.
    pub url: String,

    /// Total size in bytes (sum of all chunk lengths).
    pub size_bytes: u64,

    /// MD5 checksum computed while the chunks were appended.
    pub checksum: String,

    /// When the merge completed.
    pub merged_at: DateTime<Utc>,
}

/// Intrinsic properties probed from a merged artifact.
///
/// Width and height are zero when the container has no video stream;
/// duration is rounded to whole seconds and zero when unreported.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct MediaMetadata {
    pub width: u32,
    pub height: u32,
    pub duration_secs: u64,
}

/// The full outcome of an upload whose chunks all arrived.
///
/// Probe and thumbnail stages are best-effort: a failed probe leaves the
/// metadata fields zeroed and a failed extraction leaves `thumbnail` empty,
/// while the artifact itself stays valid and servable.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct IngestionResult {
    /// Generated artifact filename.
    pub artifact_name: String,

    /// Location of the artifact on disk.
    pub artifact_path: PathBuf,

    /// Public URL of the artifact.
    pub artifact_url: String,

    /// Artifact size in bytes.
    pub size_bytes: u64,

    /// MD5 checksum of the artifact.
    pub checksum: String,

    /// When the merge completed.
    pub merged_at: DateTime<Utc>,

    /// Probed pixel width (0 when unavailable).
    pub width: u32,

    /// Probed pixel height (0 when unavailable).
    pub height: u32,

    /// Probed duration in whole seconds (0 when unavailable).
    pub duration_secs: u64,

    /// Whether a thumbnail was produced.
    pub thumbnail_available: bool,

    /// Thumbnail filename in the thumbnail directory, when available.
    pub thumbnail: Option<String>,
}

impl IngestionResult {
    /// Assemble the client-facing result from the pipeline stage outputs.
    pub fn new(
        artifact: MergedArtifact,
        metadata: Option<MediaMetadata>,
        thumbnail: Option<String>,
    ) -> Self {
        let metadata = metadata.unwrap_or(MediaMetadata {
            width: 0,
            height: 0,
            duration_secs: 0,
        });
        Self {
            artifact_name: artifact.name,
            artifact_path: artifact.path,
            artifact_url: artifact.url,
            size_bytes: artifact.size_bytes,
            checksum: artifact.checksum,
            merged_at: artifact.merged_at,
            width: metadata.width,
            height: metadata.height,
            duration_secs: metadata.duration_secs,
            thumbnail_available: thumbnail.is_some(),
            thumbnail,
        }
    }
}
