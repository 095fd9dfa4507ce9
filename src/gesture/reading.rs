use std::fmt;
use std::str::FromStr;

/// A single accelerometer sample as sent by a controller: `"x y z"`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Reading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

// Parser errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Malformed reading {input:?}: {reason}")]
    MalformedReading { input: String, reason: String },
}

impl ParseError {
    fn malformed(input: &str, reason: impl Into<String>) -> Self {
        ParseError::MalformedReading {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

impl Reading {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Planar magnitude over the x/z plane. The y axis does not take part in
    /// gesture detection.
    pub fn planar_norm(&self) -> f64 {
        self.x.hypot(self.z)
    }

    /// Decodes a whitespace separated triple of decimal numbers.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let tokens: Vec<&str> = input.split_whitespace().collect();
        if tokens.len() != 3 {
            return Err(ParseError::malformed(
                input,
                format!("expected 3 fields, found {}", tokens.len()),
            ));
        }

        let mut values = [0.0f64; 3];
        for (slot, token) in values.iter_mut().zip(&tokens) {
            let value: f64 = token
                .parse()
                .map_err(|_| ParseError::malformed(input, format!("{token:?} is not a number")))?;
            if !value.is_finite() {
                return Err(ParseError::malformed(
                    input,
                    format!("{token:?} is not a finite number"),
                ));
            }
            *slot = value;
        }

        Ok(Self::new(values[0], values[1], values[2]))
    }
}

impl FromStr for Reading {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reading::parse(s)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.3} {:.3} {:.3}", self.x, self.y, self.z)
    }
}
