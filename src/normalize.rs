//! Normalization of raw, inconsistently-named metadata: fuzzy key lookup,
//! forgiving numeric and GPS parsing, and sanitization of the residual
//! key/value map before it is persisted.

use {
    lazy_static::lazy_static,
    regex::Regex,
    serde_json::Value,
    std::collections::{BTreeMap, HashMap},
};

/// Marker exiftool substitutes for binary payloads in its JSON output.
const BINARY_VALUE_MARKER: &str = "(Binary data";

lazy_static! {
    static ref NUMBER_PATTERN: Regex = Regex::new(r"(\d+(?:\.\d+)?)").unwrap();
    static ref NON_NUMERIC_PATTERN: Regex = Regex::new(r"[^\d.]").unwrap();
    static ref UNSAFE_KEY_PATTERN: Regex = Regex::new(r"[^a-zA-Z0-9_]").unwrap();

    /// Key patterns for binary, maker-note, ICC-profile and embedded-image
    /// fields, all dropped wholesale during sanitization.
    static ref EXCLUDED_KEY_PATTERNS: Vec<Regex> =
        ["MakerNote", "Image", "Profile", "Curve", "Matrix", "Data", "Table"]
            .iter()
            .map(|pattern| tag_pattern(pattern))
            .collect();
}

/// Compile a case-insensitive metadata key pattern.
pub fn tag_pattern(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){}", pattern)).unwrap()
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => {
            let text = text.trim();

            if text.is_empty() {
                None
            } else {
                Some(text.to_owned())
            }
        }
        other => Some(other.to_string()),
    }
}

/// Scan all metadata keys against `pattern`, collecting matches with non-empty
/// values, and select one deterministically: the shortest matching key name,
/// with ties broken lexicographically.
pub fn fuzzy_tag(metadata: &HashMap<String, Value>, pattern: &Regex) -> Option<String> {
    let mut best: Option<(&str, String)> = None;

    for (key, value) in metadata {
        if !pattern.is_match(key) {
            continue;
        }

        if let Some(text) = value_text(value) {
            let better = match &best {
                Some((best_key, _)) => {
                    (key.len(), key.as_str()) < (best_key.len(), best_key)
                }
                None => true,
            };

            if better {
                best = Some((key, text));
            }
        }
    }

    best.map(|(_, text)| text)
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);

    (value * factor).round() / factor
}

/// Parse a numeric EXIF value, accepting `"a/b"` fractional strings (divided
/// and rounded to 10 decimal places) or plain numbers with stray non-digit
/// characters stripped. Returns `None` on anything unparseable.
pub fn parse_exif_numeric(value: &str) -> Option<f64> {
    let value = value.trim().to_lowercase();

    if let Some((numerator, denominator)) = value.split_once('/') {
        if let (Ok(numerator), Ok(denominator)) =
            (numerator.trim().parse::<f64>(), denominator.trim().parse::<f64>())
        {
            if denominator != 0.0 {
                return Some(round_to(numerator / denominator, 10));
            }

            return None;
        }
    }

    let cleaned = NON_NUMERIC_PATTERN.replace_all(&value, "");

    cleaned.parse().ok().map(|number| round_to(number, 10))
}

/// Decode a GPS coordinate from either a plain decimal value or a free-text
/// degrees/minutes/seconds field, negating for southern/western hemispheres
/// and rounding to 6 decimal places.
pub fn parse_gps(value: &str, reference: Option<&str>) -> Option<f64> {
    let parts = NUMBER_PATTERN
        .find_iter(value)
        .filter_map(|m| m.as_str().parse::<f64>().ok())
        .collect::<Vec<_>>();

    let mut decimal = match parts.as_slice() {
        [] => return None,
        [degrees] | [degrees, _] => *degrees,
        [degrees, minutes, seconds, ..] => degrees + minutes / 60.0 + seconds / 3600.0,
    };

    if let Some(reference) = reference {
        if matches!(
            reference.trim().to_uppercase().chars().next(),
            Some('S') | Some('W')
        ) {
            decimal = -decimal;
        }
    }

    Some(round_to(decimal, 6))
}

/// Rewrite every metadata key to a safe identifier and drop binary,
/// maker-note, ICC-profile and embedded-image fields entirely.
pub fn sanitize_metadata(metadata: &HashMap<String, Value>) -> BTreeMap<String, Value> {
    let mut sanitized = BTreeMap::new();

    for (key, value) in metadata {
        if EXCLUDED_KEY_PATTERNS.iter().any(|pattern| pattern.is_match(key)) {
            continue;
        }

        if let Value::String(text) = value {
            if text.contains(BINARY_VALUE_MARKER) {
                continue;
            }
        }

        let safe = UNSAFE_KEY_PATTERN.replace_all(key, "_");
        let safe = safe.trim_matches('_');

        if !safe.is_empty() {
            sanitized.insert(safe.to_owned(), value.clone());
        }
    }

    sanitized
}
