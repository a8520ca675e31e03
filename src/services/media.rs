//! src/services/media.rs
//!
//! MediaToolkit — probing and thumbnail extraction for merged artifacts,
//! delegated to external `ffprobe`/`ffmpeg` binaries. Both operations are
//! best-effort from the pipeline's point of view: a merged artifact that
//! fails to probe is still a valid, servable file.

use crate::models::artifact::MediaMetadata;
use serde::Deserialize;
use std::{io, path::Path, process::ExitStatus};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("failed to run `{tool}`: {source}")]
    Spawn { tool: String, source: io::Error },
    #[error("`{tool}` failed ({status}): {stderr}")]
    Toolkit {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("unreadable probe report: {0}")]
    Report(#[from] serde_json::Error),
}

pub type MediaResult<T> = Result<T, MediaError>;

/// Wraps the external media toolkit binaries.
///
/// Paths are configurable so deployments can pin specific builds; the
/// defaults resolve `ffmpeg`/`ffprobe` from `PATH`.
#[derive(Clone, Debug)]
pub struct MediaToolkit {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl MediaToolkit {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    /// Probe intrinsic properties of the media file at `path`.
    ///
    /// Runs `ffprobe` with a JSON report and reduces it to width, height and
    /// rounded duration. Any toolkit error (unrecognized container, missing
    /// binary, unreadable file) surfaces as a `MediaError`.
    pub async fn probe(&self, path: &Path) -> MediaResult<MediaMetadata> {
        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(path)
            .output()
            .await
            .map_err(|source| MediaError::Spawn {
                tool: self.ffprobe_bin.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(MediaError::Toolkit {
                tool: self.ffprobe_bin.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let report: ProbeReport = serde_json::from_slice(&output.stdout)?;
        let metadata = report.into_metadata();
        debug!(
            "probed {}: {}x{}, {}s",
            path.display(),
            metadata.width,
            metadata.height,
            metadata.duration_secs
        );
        Ok(metadata)
    }

    /// Extract a single representative still frame from `input` into
    /// `output` as MJPEG.
    ///
    /// The frame is scaled to `width`x`height`; when both are zero (probe
    /// reported no dimensions) the toolkit's source size is kept.
    pub async fn extract_thumbnail(
        &self,
        input: &Path,
        output: &Path,
        width: u32,
        height: u32,
    ) -> MediaResult<()> {
        let mut command = Command::new(&self.ffmpeg_bin);
        command
            .arg("-y")
            .arg("-v")
            .arg("error")
            .arg("-i")
            .arg(input)
            .arg("-frames:v")
            .arg("1")
            .arg("-c:v")
            .arg("mjpeg");
        if width > 0 && height > 0 {
            command.arg("-s").arg(format!("{}x{}", width, height));
        }
        command.arg(output);

        let result = command.output().await.map_err(|source| MediaError::Spawn {
            tool: self.ffmpeg_bin.clone(),
            source,
        })?;

        if !result.status.success() {
            return Err(MediaError::Toolkit {
                tool: self.ffmpeg_bin.clone(),
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        debug!("extracted thumbnail {}", output.display());
        Ok(())
    }
}

/// Subset of the ffprobe JSON report the service cares about.
#[derive(Debug, Deserialize)]
struct ProbeReport {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

impl ProbeReport {
    /// Reduce the report to the fields the pipeline reports.
    ///
    /// Dimensions come from the first video stream and default to 0 when the
    /// input has none (audio-only containers). The duration string is parsed
    /// and rounded to whole seconds, defaulting to 0 when absent.
    fn into_metadata(self) -> MediaMetadata {
        let video = self
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"));
        let duration_secs = self
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
            .map(|d| d.round() as u64)
            .unwrap_or(0);

        MediaMetadata {
            width: video.and_then(|s| s.width).unwrap_or(0),
            height: video.and_then(|s| s.height).unwrap_or(0),
            duration_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn metadata_from_json(raw: &str) -> MediaMetadata {
        let report: ProbeReport = serde_json::from_str(raw).unwrap();
        report.into_metadata()
    }

    #[test]
    fn report_with_video_stream_yields_dimensions_and_rounded_duration() {
        let metadata = metadata_from_json(
            r#"{
                "streams": [
                    {"codec_type": "audio"},
                    {"codec_type": "video", "width": 1920, "height": 1080}
                ],
                "format": {"duration": "12.61"}
            }"#,
        );
        assert_eq!(
            metadata,
            MediaMetadata {
                width: 1920,
                height: 1080,
                duration_secs: 13
            }
        );
    }

    #[test]
    fn audio_only_report_defaults_dimensions_to_zero() {
        let metadata = metadata_from_json(
            r#"{
                "streams": [{"codec_type": "audio"}],
                "format": {"duration": "3.2"}
            }"#,
        );
        assert_eq!(metadata.width, 0);
        assert_eq!(metadata.height, 0);
        assert_eq!(metadata.duration_secs, 3);
    }

    #[test]
    fn missing_duration_defaults_to_zero() {
        let metadata = metadata_from_json(r#"{"streams": [], "format": {}}"#);
        assert_eq!(metadata.duration_secs, 0);
    }

    #[test]
    fn unparsable_duration_defaults_to_zero() {
        let metadata = metadata_from_json(r#"{"streams": [], "format": {"duration": "N/A"}}"#);
        assert_eq!(metadata.duration_secs, 0);
    }

    #[tokio::test]
    async fn probe_with_missing_toolkit_binary_fails() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("clip.mp4");
        std::fs::write(&input, b"not a real container").unwrap();

        let toolkit = MediaToolkit::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        assert!(toolkit.probe(&input).await.is_err());
    }

    #[tokio::test]
    async fn thumbnail_with_missing_toolkit_binary_fails() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("clip.mp4");
        let output = dir.path().join("clip.jpg");
        std::fs::write(&input, b"not a real container").unwrap();

        let toolkit = MediaToolkit::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        assert!(
            toolkit
                .extract_thumbnail(&input, &output, 100, 100)
                .await
                .is_err()
        );
    }
}
