use std::collections::HashMap;
use tracing::info;

use super::classifier::{ClassifierSettings, DirectionEvent, GestureClassifier};
use super::reading::Reading;
use super::StreamId;

/// Classifiers keyed by stream identity, created on the first reading of a
/// stream. Owned by a single ingestion adapter.
#[derive(Debug, Default)]
pub struct ClassifierBank {
    settings: ClassifierSettings,
    classifiers: HashMap<StreamId, GestureClassifier>,
}

impl ClassifierBank {
    pub fn new(settings: ClassifierSettings) -> Self {
        Self {
            settings,
            classifiers: HashMap::new(),
        }
    }

    pub fn classify(&mut self, stream: &StreamId, reading: &Reading) -> Option<DirectionEvent> {
        let settings = self.settings;
        let classifier = self
            .classifiers
            .entry(stream.clone())
            .or_insert_with(|| {
                info!("Creating classifier for stream {}", stream);
                GestureClassifier::new(settings)
            });

        classifier
            .classify(reading)
            .map(|direction| DirectionEvent::new(direction, stream.clone()))
    }

    pub fn get(&self, stream: &StreamId) -> Option<&GestureClassifier> {
        self.classifiers.get(stream)
    }

    pub fn streams(&self) -> Vec<StreamId> {
        self.classifiers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.classifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classifiers.is_empty()
    }
}
