use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use super::reading::Reading;
use super::StreamId;

/// Discrete gesture symbol emitted once per completed back-and-forth motion
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Direction event with the stream that produced it and generation time
#[derive(Clone, Debug, PartialEq)]
pub struct DirectionEvent {
    pub direction: Direction,
    pub stream: StreamId,
    pub timestamp: DateTime<Local>,
}

impl DirectionEvent {
    pub fn new(direction: Direction, stream: StreamId) -> Self {
        Self {
            direction,
            stream,
            timestamp: Local::now(),
        }
    }
}

/// Tuning values for the push-release detector
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Readings whose x/z magnitude stays below this are treated as noise.
    /// Empirically somewhere between 3.5 and 5.0 depending on the handset.
    pub activation_threshold: f64,

    /// Cosine similarity an axis must exceed to arm or confirm a direction.
    pub alignment_threshold: f64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            activation_threshold: 5.0,
            alignment_threshold: 0.75,
        }
    }
}

impl ClassifierSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !self.activation_threshold.is_finite() || self.activation_threshold <= 0.0 {
            return Err(format!(
                "activation_threshold must be a positive number, got {}",
                self.activation_threshold
            ));
        }
        if !(self.alignment_threshold > 0.0 && self.alignment_threshold < 1.0) {
            return Err(format!(
                "alignment_threshold must lie strictly between 0 and 1, got {}",
                self.alignment_threshold
            ));
        }
        Ok(())
    }
}

/// Armed directions awaiting their confirming opposite swing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Latches {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
}

impl Latches {
    fn clear(&mut self) {
        *self = Latches::default();
    }
}

/// Per-stream gesture detector.
///
/// A tilt past the alignment threshold only arms a latch; the opposite tilt
/// (the swing back to centre) confirms it and emits the direction. Axis checks
/// run in a fixed order and the first matching branch wins, so a single reading
/// produces at most one event.
#[derive(Clone, Debug)]
pub struct GestureClassifier {
    settings: ClassifierSettings,
    latches: Latches,
}

impl GestureClassifier {
    pub fn new(settings: ClassifierSettings) -> Self {
        Self {
            settings,
            latches: Latches::default(),
        }
    }

    pub fn latches(&self) -> Latches {
        self.latches
    }

    pub fn classify(&mut self, reading: &Reading) -> Option<Direction> {
        let norm = reading.planar_norm();
        if norm < self.settings.activation_threshold {
            return None;
        }

        // Dot products with the +x and +z unit axes of the normalised vector
        let ax = reading.x / norm;
        let az = reading.z / norm;
        let t = self.settings.alignment_threshold;

        let emitted = if ax > t {
            self.confirm_or_arm(Latch::Backward, Latch::Forward, Direction::Up)
        } else if ax < -t {
            self.confirm_or_arm(Latch::Forward, Latch::Backward, Direction::Down)
        } else if az > t {
            self.confirm_or_arm(Latch::Right, Latch::Left, Direction::Right)
        } else if az < -t {
            self.confirm_or_arm(Latch::Left, Latch::Right, Direction::Left)
        } else {
            None
        };

        debug!(
            "norm={:.3} ax={:.3} az={:.3} latches={:?} emitted={:?}",
            norm, ax, az, self.latches, emitted
        );
        emitted
    }

    fn confirm_or_arm(&mut self, confirm: Latch, arm: Latch, direction: Direction) -> Option<Direction> {
        if *self.latch_mut(confirm) {
            self.latches.clear();
            Some(direction)
        } else {
            *self.latch_mut(arm) = true;
            None
        }
    }

    fn latch_mut(&mut self, latch: Latch) -> &mut bool {
        match latch {
            Latch::Forward => &mut self.latches.forward,
            Latch::Backward => &mut self.latches.backward,
            Latch::Left => &mut self.latches.left,
            Latch::Right => &mut self.latches.right,
        }
    }
}

#[derive(Clone, Copy)]
enum Latch {
    Forward,
    Backward,
    Left,
    Right,
}
