//! Data types persisted by the ingestion pipeline, plus the pure derivation of
//! an image's discovery-tag set.

use {
    chrono::{DateTime, NaiveDateTime, Utc},
    serde_derive::{Deserialize, Serialize},
    serde_json::Value,
    std::collections::{BTreeMap, BTreeSet},
};

/// Placeholder value for hardware fields the metadata did not provide.
///
/// Fields holding this value are excluded from the discovery-tag set.
pub const UNKNOWN: &str = "Unknown";

/// Position and extent of a detected face, normalized to the preview
/// dimensions.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgeRange {
    pub low: u32,
    pub high: u32,
}

/// Summary of one detected face.
///
/// Attributes whose confidence fell below the labeling gate are `None` rather
/// than defaulted.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct FaceSummary {
    pub bounding_box: Option<BoundingBox>,
    pub confidence: f32,
    pub age_range: Option<AgeRange>,
    pub gender: Option<String>,
    pub smile: Option<bool>,
    pub eyes_open: Option<bool>,
    pub mouth_open: Option<bool>,
    pub emotions: Vec<String>,
}

/// Canonical record for one (owner, image) pair.
///
/// Exactly one current record exists per (owner, image identifier); the
/// identifier is a deterministic hash of the raw capture-date string and the
/// filename, so reprocessing the same unmodified source resolves to the same
/// record.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ImageRecord {
    pub image_id: String,
    pub owner: String,
    pub name: String,
    pub capture_time: NaiveDateTime,
    pub processed_at: DateTime<Utc>,
    pub preview_key: String,
    pub size: u64,
    pub make: String,
    pub model: String,
    pub lens: String,
    pub iso: Option<f64>,
    pub aperture: Option<f64>,
    pub shutter_speed: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub labels: Vec<String>,
    pub faces: Vec<FaceSummary>,
    pub metadata: BTreeMap<String, Value>,
}

/// One row of the per-tag gallery index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TagIndexEntry {
    pub owner: String,
    pub tag: String,
    pub image_id: String,
    pub name: String,
    pub capture_time: NaiveDateTime,
    pub preview_key: String,
}

impl ImageRecord {
    /// Index entries for this record under the given discovery-tag set.
    pub fn tag_entries(&self, tags: &BTreeSet<String>) -> Vec<TagIndexEntry> {
        tags.iter()
            .map(|tag| TagIndexEntry {
                owner: self.owner.clone(),
                tag: tag.clone(),
                image_id: self.image_id.clone(),
                name: self.name.clone(),
                capture_time: self.capture_time,
                preview_key: self.preview_key.clone(),
            })
            .collect()
    }
}

fn title_case(text: &str) -> String {
    let mut chars = text.chars();

    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn face_tags(face: &FaceSummary, tags: &mut BTreeSet<String>) {
    for emotion in &face.emotions {
        tags.insert(title_case(emotion));
    }

    if let Some(range) = &face.age_range {
        tags.insert(format!("Age {}-{}", range.low, range.high));
    }

    if face.smile == Some(true) {
        tags.insert("Smile".to_owned());
    }

    if face.eyes_open == Some(true) {
        tags.insert("Eyes Open".to_owned());
    }

    if face.mouth_open == Some(true) {
        tags.insert("Mouth Open".to_owned());
    }

    if let Some(gender) = &face.gender {
        tags.insert(title_case(gender));
    }
}

/// The set of tags an image is discoverable under: content labels, hardware
/// fields that aren't [UNKNOWN], and qualifying face attributes.
///
/// This is the single source of truth for both indexing and the compensating
/// decrements applied before a forced reprocess, so the two always agree.
pub fn discovery_tags(record: &ImageRecord) -> BTreeSet<String> {
    let mut tags = record.labels.iter().cloned().collect::<BTreeSet<_>>();

    for hardware in [&record.make, &record.model, &record.lens] {
        if !hardware.is_empty() && hardware != UNKNOWN {
            tags.insert(hardware.clone());
        }
    }

    for face in &record.faces {
        face_tags(face, &mut tags);
    }

    tags
}

#[cfg(test)]
mod test {
    use {super::*, maplit::btreeset};

    fn record(labels: &[&str], faces: Vec<FaceSummary>) -> ImageRecord {
        ImageRecord {
            image_id: "0123456789".to_owned(),
            owner: "tester".to_owned(),
            name: "test.arw".to_owned(),
            capture_time: "2021-04-01T12:00:00".parse().unwrap(),
            processed_at: Utc::now(),
            preview_key: "protected/tester/2021/04/01/test.arw.jpg".to_owned(),
            size: 1024,
            make: "Sony".to_owned(),
            model: UNKNOWN.to_owned(),
            lens: "FE 35mm F1.8".to_owned(),
            iso: Some(100.0),
            aperture: Some(1.8),
            shutter_speed: Some("1/250".to_owned()),
            latitude: None,
            longitude: None,
            labels: labels.iter().map(|&l| l.to_owned()).collect(),
            faces,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn tags_from_labels_and_hardware() {
        assert_eq!(
            discovery_tags(&record(&["Outdoors", "Tree"], Vec::new())),
            btreeset!["Outdoors".to_owned(), "Tree".to_owned(), "Sony".to_owned(), "FE 35mm F1.8".to_owned()]
        );
    }

    #[test]
    fn unknown_hardware_is_not_a_tag() {
        assert!(!discovery_tags(&record(&["Tree"], Vec::new())).contains(UNKNOWN));
    }

    #[test]
    fn tags_from_faces() {
        let face = FaceSummary {
            confidence: 99.0,
            age_range: Some(AgeRange { low: 25, high: 35 }),
            gender: Some("MALE".to_owned()),
            smile: Some(true),
            eyes_open: Some(false),
            emotions: vec!["HAPPY".to_owned()],
            ..FaceSummary::default()
        };

        let tags = discovery_tags(&record(&["Face"], vec![face]));

        for expected in ["Face", "Happy", "Age 25-35", "Smile", "Male"] {
            assert!(tags.contains(expected), "missing {:?} in {:?}", expected, tags);
        }

        // open-eyes attribute was false, so it must not become a tag
        assert!(!tags.contains("Eyes Open"));
    }

    #[test]
    fn dedupes_across_sources() {
        let tags = discovery_tags(&record(&["Sony", "Tree"], Vec::new()));

        assert_eq!(tags.iter().filter(|&t| t == "Sony").count(), 1);
    }
}
