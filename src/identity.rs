//! Resolution of a canonical capture timestamp and a stable image identifier
//! from noisy metadata.

use {
    crate::normalize,
    chrono::NaiveDateTime,
    lazy_static::lazy_static,
    regex::Regex,
    serde_json::Value,
    sha2::{Digest, Sha256},
    std::collections::HashMap,
};

/// Number of leading hex characters of the hash retained as the identifier.
///
/// Collisions at this length are accepted as "same logical image".
pub const IMAGE_ID_LENGTH: usize = 10;

lazy_static! {
    /// Ordered capture-date field patterns, richest (sub-second) first. The
    /// first pattern with any non-empty match wins; within one pattern the
    /// fuzzy lookup's shortest-key rule applies.
    static ref DATE_CANDIDATE_PATTERNS: Vec<Regex> = [
        "SubSecCreateDate$",
        "SubSecDateTimeOriginal$",
        "CreateDate$",
        "DateTimeOriginal$",
    ]
    .iter()
    .map(|pattern| normalize::tag_pattern(pattern))
    .collect();

    static ref EXIF_DATE_PATTERN: Regex = Regex::new(r"^(\d{4}):(\d{2}):(\d{2})").unwrap();
}

/// The best raw capture-date string present in `metadata`, or `None` if no
/// candidate field is present.
pub fn capture_date_raw(metadata: &HashMap<String, Value>) -> Option<String> {
    DATE_CANDIDATE_PATTERNS
        .iter()
        .find_map(|pattern| normalize::fuzzy_tag(metadata, pattern))
}

/// Normalize an EXIF `YYYY:MM:DD HH:MM:SS[.sss]` string to ISO 8601 and parse
/// it as a local, unzoned timestamp.
pub fn parse_capture_date(raw: &str) -> Option<NaiveDateTime> {
    EXIF_DATE_PATTERN
        .replace(raw.trim(), "${1}-${2}-${3}")
        .replacen(' ', "T", 1)
        .parse()
        .ok()
}

/// Stable identifier for an image: the leading hex of a SHA-256 over the raw
/// capture-date string and the filename.
pub fn image_id(capture_date_raw: &str, filename: &str) -> String {
    let mut hasher = Sha256::default();

    hasher.update(capture_date_raw.as_bytes());
    hasher.update(filename.as_bytes());

    let mut id = hex::encode(hasher.finalize());
    id.truncate(IMAGE_ID_LENGTH);
    id
}

#[cfg(test)]
mod test {
    use {super::*, chrono::Datelike, maplit::hashmap, serde_json::json};

    #[test]
    fn prefers_subsecond_candidates() {
        let metadata = hashmap! {
            "EXIF:DateTimeOriginal".to_owned() => json!("2021:04:01 12:00:00"),
            "Composite:SubSecCreateDate".to_owned() => json!("2021:04:01 12:00:00.123"),
        };

        assert_eq!(
            capture_date_raw(&metadata).as_deref(),
            Some("2021:04:01 12:00:00.123")
        );
    }

    #[test]
    fn falls_back_through_candidates() {
        let metadata = hashmap! {
            "XMP:CreateDate".to_owned() => json!("2020:12:25 08:30:00"),
            "File:FileModifyDate".to_owned() => json!("2022:01:01 00:00:00"),
        };

        assert_eq!(
            capture_date_raw(&metadata).as_deref(),
            Some("2020:12:25 08:30:00")
        );

        assert_eq!(capture_date_raw(&hashmap! {}), None);
    }

    #[test]
    fn normalizes_exif_separators() {
        let datetime = parse_capture_date("2021:04:01 12:34:56").unwrap();

        assert_eq!(datetime.year(), 2021);
        assert_eq!(datetime.to_string(), "2021-04-01 12:34:56");

        assert!(parse_capture_date("2021:04:01 12:34:56.789").is_some());
        assert!(parse_capture_date("not a date").is_none());
    }

    #[test]
    fn identifier_is_stable_and_short() {
        let a = image_id("2021:04:01 12:00:00", "DSC00123.ARW");
        let b = image_id("2021:04:01 12:00:00", "DSC00123.ARW");

        assert_eq!(a, b);
        assert_eq!(a.len(), IMAGE_ID_LENGTH);

        assert_ne!(a, image_id("2021:04:01 12:00:00", "DSC00124.ARW"));
        assert_ne!(a, image_id("2021:04:01 12:00:01", "DSC00123.ARW"));
    }
}
