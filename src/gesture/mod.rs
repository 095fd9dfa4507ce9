//! Gesture detection for motion-sensor streams
//!
//! Turns raw accelerometer text into discrete direction symbols:
//!
//! 1. [`reading`] - Decodes `"x y z"` records into a [`Reading`]
//! 2. [`classifier`] - Push-release detector with per-stream latch state
//! 3. [`bank`] - One classifier per stream identity, created on demand
//!
//! # Pipeline
//!
//! ```text
//! "0.1 9.8 -6.2" ──► Reading ──► GestureClassifier ──► Option<DirectionEvent>
//!                                (keyed by StreamId)
//! ```

pub mod bank;
pub mod classifier;
pub mod reading;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use bank::ClassifierBank;
pub use classifier::{ClassifierSettings, Direction, DirectionEvent, GestureClassifier, Latches};
pub use reading::{ParseError, Reading};

/// Opaque identity of one physical controller's data path
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Arc<str>);

impl StreamId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        StreamId(Arc::from(value))
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        StreamId(Arc::from(value))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}
