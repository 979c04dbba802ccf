//! Table-driven classifier answering from pre-recorded detections.

use std::collections::HashMap;

use tracing::debug;

use crate::{
    classifier::{Classifier, ClassifierError, ModelInput},
    detection::Detection,
};

/// Classifier that looks detections up by source frame timestamp.
///
/// Used to replay recorded sessions through the pipeline and to script
/// classifier behaviour in tests. Unknown timestamps yield no detections.
#[derive(Clone, Debug, Default)]
pub struct ReplayClassifier {
    name: String,
    table: HashMap<i64, Vec<Detection>>,
    failing: Vec<i64>,
}

impl ReplayClassifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Register the detections returned for frames stamped `timestamp_ms`.
    pub fn with_frame(mut self, timestamp_ms: i64, detections: Vec<Detection>) -> Self {
        self.table.insert(timestamp_ms, detections);
        self
    }

    /// Make inference fail for frames stamped `timestamp_ms`.
    pub fn failing_at(mut self, timestamp_ms: i64) -> Self {
        self.failing.push(timestamp_ms);
        self
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Classifier for ReplayClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, input: ModelInput<'_>) -> Result<Vec<Detection>, ClassifierError> {
        if self.failing.contains(&input.source_timestamp_ms) {
            return Err(ClassifierError::Inference(format!(
                "{}: scripted failure at {}",
                self.name, input.source_timestamp_ms
            )));
        }
        let detections = self
            .table
            .get(&input.source_timestamp_ms)
            .cloned()
            .unwrap_or_default();
        debug!(
            classifier = %self.name,
            timestamp = input.source_timestamp_ms,
            count = detections.len(),
            "replayed detections"
        );
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use image::RgbImage;

    use super::*;
    use crate::detection::BoundingBox;

    #[test]
    fn answers_by_timestamp_and_fails_on_demand() {
        let image = RgbImage::new(4, 4);
        let classifier = ReplayClassifier::new("phase1")
            .with_frame(
                10,
                vec![Detection::new("rdt", 0, 0.7, BoundingBox::new(0.0, 0.0, 2.0, 2.0))],
            )
            .failing_at(20);

        let hit = classifier
            .detect(ModelInput {
                image: &image,
                source_timestamp_ms: 10,
            })
            .unwrap();
        assert_eq!(hit.len(), 1);

        let miss = classifier
            .detect(ModelInput {
                image: &image,
                source_timestamp_ms: 11,
            })
            .unwrap();
        assert!(miss.is_empty());

        assert!(
            classifier
                .detect(ModelInput {
                    image: &image,
                    source_timestamp_ms: 20,
                })
                .is_err()
        );
    }
}
