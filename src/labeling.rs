//! Adapter for the external content/face labeling service: preview
//! preparation, label interpretation, and confidence gating of face
//! attributes.

use {
    crate::record::{AgeRange, BoundingBox, FaceSummary},
    async_trait::async_trait,
    image::{imageops::FilterType, GenericImageView, ImageOutputFormat},
    serde_derive::{Deserialize, Serialize},
    std::{cmp::Ordering, io::Cursor},
    thiserror::Error,
    tokio::task,
    tracing::warn,
};

/// Maximum bounding box for previews submitted to the labeling service,
/// aspect-preserving.
pub const ANALYSIS_BOUNDS: (u32, u32) = (1600, 1600);

/// Confidence gate shared by face-label triggering, emotions, and
/// boolean/categorical face attributes.
pub const FACE_CONFIDENCE_THRESHOLD: f32 = 75.0;

/// Sentinel label substituted when the service returns nothing, so a record
/// is never tag-less.
pub const UNCATEGORIZED_LABEL: &str = "Uncategorized";

const JPEG_QUALITY: u8 = 85;

const FACE_LABEL: &str = "Face";

const MAX_FACES: usize = 3;

#[derive(Error, Debug)]
pub enum LabelingError {
    #[error("labeling service error: {0}")]
    Service(String),

    #[error("face detection error: {0}")]
    FaceDetection(String),

    #[error("unable to prepare preview for analysis: {0}")]
    Preview(#[from] image::ImageError),
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Label {
    pub name: String,
    pub confidence: f32,
}

/// A face attribute as reported by the service, carrying its own confidence.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FaceAttribute<T> {
    pub value: T,
    pub confidence: f32,
}

/// One face as reported by the service, before confidence gating.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct FaceDetail {
    pub bounding_box: Option<BoundingBox>,
    pub confidence: f32,
    pub age_range: Option<AgeRange>,
    pub gender: Option<FaceAttribute<String>>,
    pub smile: Option<FaceAttribute<bool>>,
    pub eyes_open: Option<FaceAttribute<bool>>,
    pub mouth_open: Option<FaceAttribute<bool>>,
    pub emotions: Vec<FaceAttribute<String>>,
}

/// External labeling service.
#[async_trait]
pub trait Labeler: Send + Sync {
    /// Detect generic content labels, bounded by `max_labels` and
    /// `min_confidence`.
    async fn detect_labels(
        &self,
        image: &[u8],
        max_labels: u32,
        min_confidence: f32,
    ) -> Result<Vec<Label>, LabelingError>;

    /// Detect detailed face attributes.
    async fn detect_faces(&self, image: &[u8]) -> Result<Vec<FaceDetail>, LabelingError>;
}

/// Stand-in for deployments without a labeling service wired up; every image
/// falls back to the [UNCATEGORIZED_LABEL] sentinel.
pub struct Disabled;

#[async_trait]
impl Labeler for Disabled {
    async fn detect_labels(
        &self,
        _image: &[u8],
        _max_labels: u32,
        _min_confidence: f32,
    ) -> Result<Vec<Label>, LabelingError> {
        Ok(Vec::new())
    }

    async fn detect_faces(&self, _image: &[u8]) -> Result<Vec<FaceDetail>, LabelingError> {
        Ok(Vec::new())
    }
}

/// Interpreted result of content analysis for one preview.
pub struct Analysis {
    pub labels: Vec<String>,
    pub faces: Vec<FaceSummary>,
}

/// Decode `preview`, downscale it to fit [ANALYSIS_BOUNDS] if necessary, and
/// re-encode it as JPEG for submission.
pub fn analysis_payload(preview: &[u8]) -> Result<Vec<u8>, LabelingError> {
    let image = image::load_from_memory(preview)?;

    let (width, height) = image.dimensions();

    let image = if width > ANALYSIS_BOUNDS.0 || height > ANALYSIS_BOUNDS.1 {
        image.resize(ANALYSIS_BOUNDS.0, ANALYSIS_BOUNDS.1, FilterType::Lanczos3)
    } else {
        image
    };

    let mut buffer = Cursor::new(Vec::new());

    image.write_to(&mut buffer, ImageOutputFormat::Jpeg(JPEG_QUALITY))?;

    Ok(buffer.into_inner())
}

fn gate<T: Clone>(attribute: &Option<FaceAttribute<T>>) -> Option<T> {
    attribute
        .as_ref()
        .filter(|attribute| attribute.confidence >= FACE_CONFIDENCE_THRESHOLD)
        .map(|attribute| attribute.value.clone())
}

fn summarize(face: &FaceDetail) -> FaceSummary {
    FaceSummary {
        bounding_box: face.bounding_box,
        confidence: face.confidence,
        age_range: face.age_range,
        gender: gate(&face.gender),
        smile: gate(&face.smile),
        eyes_open: gate(&face.eyes_open),
        mouth_open: gate(&face.mouth_open),
        emotions: face
            .emotions
            .iter()
            .filter(|emotion| emotion.confidence >= FACE_CONFIDENCE_THRESHOLD)
            .map(|emotion| emotion.value.clone())
            .collect(),
    }
}

/// Analyze one preview: request content labels and, when a confident `Face`
/// label is present, detailed attributes for the top [MAX_FACES] faces.
///
/// A face-detection failure degrades to an empty face list; a label-detection
/// failure propagates and fails the image.
pub async fn analyze(
    labeler: &dyn Labeler,
    preview: &[u8],
    max_labels: u32,
    min_confidence: f32,
) -> Result<Analysis, LabelingError> {
    let payload = task::block_in_place(|| analysis_payload(preview))?;

    let detected = labeler
        .detect_labels(&payload, max_labels, min_confidence)
        .await?;

    let labels = if detected.is_empty() {
        vec![UNCATEGORIZED_LABEL.to_owned()]
    } else {
        detected.iter().map(|label| label.name.clone()).collect()
    };

    let mut faces = Vec::new();

    if detected
        .iter()
        .any(|label| label.name == FACE_LABEL && label.confidence >= FACE_CONFIDENCE_THRESHOLD)
    {
        match labeler.detect_faces(&payload).await {
            Ok(mut detected_faces) => {
                detected_faces.sort_by(|a, b| {
                    b.confidence
                        .partial_cmp(&a.confidence)
                        .unwrap_or(Ordering::Equal)
                });

                faces = detected_faces.iter().take(MAX_FACES).map(summarize).collect();
            }

            Err(e) => warn!("face detection failed; continuing without faces: {:?}", e),
        }
    }

    Ok(Analysis { labels, faces })
}

#[cfg(test)]
mod test {
    use {
        super::*,
        image::{ImageBuffer, Rgb},
    };

    struct FakeLabeler {
        labels: Vec<Label>,
        faces: Result<Vec<FaceDetail>, ()>,
    }

    #[async_trait]
    impl Labeler for FakeLabeler {
        async fn detect_labels(
            &self,
            _image: &[u8],
            _max_labels: u32,
            _min_confidence: f32,
        ) -> Result<Vec<Label>, LabelingError> {
            Ok(self.labels.clone())
        }

        async fn detect_faces(&self, _image: &[u8]) -> Result<Vec<FaceDetail>, LabelingError> {
            self.faces
                .clone()
                .map_err(|()| LabelingError::FaceDetection("synthetic failure".to_owned()))
        }
    }

    fn label(name: &str, confidence: f32) -> Label {
        Label {
            name: name.to_owned(),
            confidence,
        }
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());

        ImageBuffer::from_pixel(width, height, Rgb::<u8>([120, 80, 40]))
            .write_to(&mut buffer, ImageOutputFormat::Jpeg(90))
            .unwrap();

        buffer.into_inner()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn empty_labels_become_uncategorized() {
        let analysis = analyze(&Disabled, &jpeg(32, 32), 15, 75.0).await.unwrap();

        assert_eq!(analysis.labels, vec![UNCATEGORIZED_LABEL.to_owned()]);
        assert!(analysis.faces.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn face_attributes_are_confidence_gated() {
        let labeler = FakeLabeler {
            labels: vec![label("Face", 80.0), label("Person", 92.0)],
            faces: Ok(vec![FaceDetail {
                confidence: 95.0,
                smile: Some(FaceAttribute {
                    value: true,
                    confidence: 90.0,
                }),
                eyes_open: Some(FaceAttribute {
                    value: true,
                    confidence: 60.0,
                }),
                emotions: vec![
                    FaceAttribute {
                        value: "HAPPY".to_owned(),
                        confidence: 88.0,
                    },
                    FaceAttribute {
                        value: "CALM".to_owned(),
                        confidence: 40.0,
                    },
                ],
                ..FaceDetail::default()
            }]),
        };

        let analysis = analyze(&labeler, &jpeg(32, 32), 15, 75.0).await.unwrap();

        assert_eq!(analysis.labels, vec!["Face".to_owned(), "Person".to_owned()]);
        assert_eq!(analysis.faces.len(), 1);

        let face = &analysis.faces[0];

        assert_eq!(face.smile, Some(true));
        assert_eq!(face.eyes_open, None, "attribute below the gate must be omitted");
        assert_eq!(face.emotions, vec!["HAPPY".to_owned()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn low_confidence_face_label_skips_face_detection() {
        let labeler = FakeLabeler {
            labels: vec![label("Face", 50.0)],
            faces: Ok(vec![FaceDetail::default()]),
        };

        let analysis = analyze(&labeler, &jpeg(32, 32), 15, 75.0).await.unwrap();

        assert!(analysis.faces.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn face_detection_failure_degrades() {
        let labeler = FakeLabeler {
            labels: vec![label("Face", 99.0)],
            faces: Err(()),
        };

        let analysis = analyze(&labeler, &jpeg(32, 32), 15, 75.0).await.unwrap();

        assert_eq!(analysis.labels, vec!["Face".to_owned()]);
        assert!(analysis.faces.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn keeps_top_faces_by_confidence() {
        let face = |confidence| FaceDetail {
            confidence,
            ..FaceDetail::default()
        };

        let labeler = FakeLabeler {
            labels: vec![label("Face", 90.0)],
            faces: Ok(vec![face(70.0), face(95.0), face(80.0), face(85.0)]),
        };

        let analysis = analyze(&labeler, &jpeg(32, 32), 15, 75.0).await.unwrap();

        assert_eq!(
            analysis.faces.iter().map(|f| f.confidence).collect::<Vec<_>>(),
            vec![95.0, 85.0, 80.0]
        );
    }

    #[test]
    fn payload_is_bounded() {
        let payload = analysis_payload(&jpeg(3200, 1600)).unwrap();

        let image = image::load_from_memory(&payload).unwrap();

        assert_eq!(image.dimensions(), (1600, 800));
    }
}
