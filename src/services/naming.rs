//! Collision-resistant output filename generation.

use chrono::Utc;
use rand::Rng;

/// Random bytes appended to every generated name. Large enough that names
/// stay unique across concurrent invocations regardless of timestamp
/// granularity.
const RANDOM_BYTES: usize = 16;

/// Build a unique name for the artifact merged from `original`:
/// `<millis-timestamp>-<random-hex>.<extension>`.
///
/// The extension is everything after the last `.` in `original`; upload
/// identities are validated to contain one before any chunk is staged.
pub fn unique_file_name(original: &str) -> String {
    let extension = original.rsplit('.').next().unwrap_or("bin");
    let timestamp = Utc::now().timestamp_millis();
    let mut random = [0u8; RANDOM_BYTES];
    rand::thread_rng().fill(&mut random[..]);
    format!("{}-{}.{}", timestamp, hex::encode(random), extension)
}

/// Name of the thumbnail derived from an artifact: the artifact name with
/// its extension replaced by `jpg`.
pub fn thumbnail_name(artifact_name: &str) -> String {
    match artifact_name.rsplit_once('.') {
        Some((stem, _)) => format!("{}.jpg", stem),
        None => format!("{}.jpg", artifact_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_name_keeps_the_original_extension() {
        let name = unique_file_name("clip.mp4");
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn generated_name_has_timestamp_and_hex_parts() {
        let name = unique_file_name("video.webm");
        let stem = name.strip_suffix(".webm").unwrap();
        let (timestamp, random) = stem.split_once('-').unwrap();
        assert!(timestamp.parse::<i64>().is_ok());
        assert_eq!(random.len(), RANDOM_BYTES * 2);
        assert!(random.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn generated_names_do_not_collide() {
        let names: HashSet<String> = (0..1000).map(|_| unique_file_name("clip.mp4")).collect();
        assert_eq!(names.len(), 1000);
    }

    #[test]
    fn thumbnail_name_substitutes_the_extension() {
        assert_eq!(thumbnail_name("123-abcd.mp4"), "123-abcd.jpg");
        assert_eq!(thumbnail_name("bare"), "bare.jpg");
    }
}
