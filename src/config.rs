use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub staging_dir: String,
    pub output_dir: String,
    pub thumbnail_dir: String,
    pub public_base_url: String,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Chunked media upload ingestion service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where incoming chunks are staged (overrides MEDIA_INGEST_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Directory where merged artifacts are stored (overrides MEDIA_INGEST_OUTPUT_DIR)
    #[arg(long)]
    pub output_dir: Option<String>,

    /// Directory where thumbnails are stored (overrides MEDIA_INGEST_THUMBNAIL_DIR)
    #[arg(long)]
    pub thumbnail_dir: Option<String>,

    /// Base URL under which merged artifacts are publicly reachable
    /// (overrides MEDIA_INGEST_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Path to the ffmpeg binary (overrides MEDIA_INGEST_FFMPEG)
    #[arg(long)]
    pub ffmpeg: Option<String>,

    /// Path to the ffprobe binary (overrides MEDIA_INGEST_FFPROBE)
    #[arg(long)]
    pub ffprobe: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("MEDIA_INGEST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("MEDIA_INGEST_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing MEDIA_INGEST_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3001,
            Err(err) => return Err(err).context("reading MEDIA_INGEST_PORT"),
        };
        let env_staging =
            env::var("MEDIA_INGEST_STAGING_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_output =
            env::var("MEDIA_INGEST_OUTPUT_DIR").unwrap_or_else(|_| "./data/merged_files".into());
        let env_thumbnails =
            env::var("MEDIA_INGEST_THUMBNAIL_DIR").unwrap_or_else(|_| "./data/thumbnails".into());
        let env_ffmpeg = env::var("MEDIA_INGEST_FFMPEG").unwrap_or_else(|_| "ffmpeg".into());
        let env_ffprobe = env::var("MEDIA_INGEST_FFPROBE").unwrap_or_else(|_| "ffprobe".into());

        // --- Merge ---
        let port = args.port.unwrap_or(env_port);
        let env_base_url = env::var("MEDIA_INGEST_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}", port));

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            staging_dir: args.staging_dir.unwrap_or(env_staging),
            output_dir: args.output_dir.unwrap_or(env_output),
            thumbnail_dir: args.thumbnail_dir.unwrap_or(env_thumbnails),
            public_base_url: args.public_base_url.unwrap_or(env_base_url),
            ffmpeg_bin: args.ffmpeg.unwrap_or(env_ffmpeg),
            ffprobe_bin: args.ffprobe.unwrap_or(env_ffprobe),
        };

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
