//! Decay schedules for exploration parameters

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecayError {
    #[error("decay rate must be positive, got {0}")]
    NonPositiveRate(f32),
    #[error("start value {start} must not be below end value {end}")]
    StartBelowEnd { start: f32, end: f32 },
}

/// A value that decays as a function of the number of steps taken
pub trait Decay {
    fn evaluate(&self, step: u32) -> f32;
}

/// Exponential decay from `start` towards `end`
///
/// v(t) = end + (start − end)·e<sup>−rate·t</sup>
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Exponential {
    rate: f32,
    start: f32,
    end: f32,
}

impl Exponential {
    pub fn new(rate: f32, start: f32, end: f32) -> Result<Self, DecayError> {
        if rate <= 0.0 {
            return Err(DecayError::NonPositiveRate(rate));
        }
        if start < end {
            return Err(DecayError::StartBelowEnd { start, end });
        }
        Ok(Self { rate, start, end })
    }
}

impl Default for Exponential {
    /// Rate `1e-3`, from `1.0` down to `0.05`
    fn default() -> Self {
        Self {
            rate: 1e-3,
            start: 1.0,
            end: 0.05,
        }
    }
}

impl Decay for Exponential {
    fn evaluate(&self, step: u32) -> f32 {
        self.end + (self.start - self.end) * (-self.rate * step as f32).exp()
    }
}
