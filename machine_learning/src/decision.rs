use std::fmt::{self, Display};

/// Confidences at or above this value are reported as a detection.
pub const THRESHOLD: f32 = 0.5;

/// The binary label derived from a detector confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Detected,
    NotDetected,
}

impl Decision {
    /// Thresholds `confidence` at [`THRESHOLD`], inclusive.
    pub fn from_confidence(confidence: f32) -> Self {
        Self::with_threshold(confidence, THRESHOLD)
    }

    /// Thresholds `confidence` at `threshold`, inclusive. A `NaN` confidence is never a detection.
    pub fn with_threshold(confidence: f32, threshold: f32) -> Self {
        if confidence >= threshold {
            Decision::Detected
        } else {
            Decision::NotDetected
        }
    }

    pub fn is_detected(&self) -> bool {
        matches!(self, Decision::Detected)
    }
}

impl Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Detected => "DETECTED",
            Decision::NotDetected => "NOT_DETECTED",
        };

        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_inclusive() {
        assert_eq!(Decision::from_confidence(0.5), Decision::Detected);
    }

    #[test]
    fn above_and_below_threshold() {
        assert_eq!(Decision::from_confidence(0.93), Decision::Detected);
        assert_eq!(Decision::from_confidence(0.4999), Decision::NotDetected);
        assert_eq!(Decision::from_confidence(0.0), Decision::NotDetected);
    }

    #[test]
    fn nan_is_not_detected() {
        assert_eq!(Decision::from_confidence(f32::NAN), Decision::NotDetected);
    }

    #[test]
    fn labels() {
        assert_eq!(Decision::Detected.to_string(), "DETECTED");
        assert_eq!(Decision::NotDetected.to_string(), "NOT_DETECTED");
    }
}
