//! Sample validation.

use crate::acquisition::{RawSample, ANALOG_CHANNELS};
use crate::error::{StationError, StationResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quality verdict for a processed sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quality {
    /// Every check passed.
    #[default]
    Good,
    /// Usable but incomplete.
    Uncertain,
    /// Must not be aggregated.
    Bad,
}

/// Limits for one analog channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelLimits {
    /// Analog slot index.
    pub channel: usize,
    /// Lowest acceptable value.
    pub min: f64,
    /// Highest acceptable value.
    pub max: f64,
    /// Whether a missing value makes the sample Bad rather than Uncertain.
    #[serde(default)]
    pub required: bool,
}

impl ChannelLimits {
    /// Optional channel with `[min, max]` limits.
    pub fn new(channel: usize, min: f64, max: f64) -> Self {
        Self {
            channel,
            min,
            max,
            required: false,
        }
    }

    /// Marks the channel as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Checks the limits themselves are usable.
    pub fn validate(&self) -> StationResult<()> {
        if self.channel >= ANALOG_CHANNELS {
            return Err(StationError::Configuration(format!(
                "channel limit index {} out of range (0..{ANALOG_CHANNELS})",
                self.channel
            )));
        }
        if !(self.min.is_finite() && self.max.is_finite() && self.min < self.max) {
            return Err(StationError::Configuration(format!(
                "channel {}: invalid limits [{}, {}]",
                self.channel, self.min, self.max
            )));
        }
        Ok(())
    }
}

/// One finding on a sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValidationIssue {
    /// Value outside its channel limits.
    OutOfRange {
        /// Analog slot.
        channel: usize,
        /// Offending value.
        value: f64,
        /// Lower limit.
        min: f64,
        /// Upper limit.
        max: f64,
    },
    /// Required channel missing.
    MissingRequired {
        /// Analog slot.
        channel: usize,
    },
    /// Optional channel missing.
    MissingOptional {
        /// Analog slot.
        channel: usize,
    },
    /// Position scalar missing.
    MissingPosition,
    /// Force scalar missing.
    MissingForce,
    /// Controller reported a protection trip.
    ProtectionTripped {
        /// Raw status bits.
        bits: u32,
    },
}

impl ValidationIssue {
    /// Quality this issue forces.
    pub fn severity(&self) -> Quality {
        match self {
            ValidationIssue::OutOfRange { .. }
            | ValidationIssue::MissingRequired { .. }
            | ValidationIssue::ProtectionTripped { .. } => Quality::Bad,
            ValidationIssue::MissingOptional { .. }
            | ValidationIssue::MissingPosition
            | ValidationIssue::MissingForce => Quality::Uncertain,
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::OutOfRange {
                channel,
                value,
                min,
                max,
            } => write!(f, "channel {channel}: {value} outside [{min}, {max}]"),
            ValidationIssue::MissingRequired { channel } => {
                write!(f, "channel {channel}: required value missing")
            }
            ValidationIssue::MissingOptional { channel } => {
                write!(f, "channel {channel}: value missing")
            }
            ValidationIssue::MissingPosition => f.write_str("position missing"),
            ValidationIssue::MissingForce => f.write_str("force missing"),
            ValidationIssue::ProtectionTripped { bits } => {
                write!(f, "protection tripped (status {bits:#06x})")
            }
        }
    }
}

/// Checks samples against per-channel limits.
#[derive(Clone, Debug, Default)]
pub struct SampleValidator {
    limits: Vec<ChannelLimits>,
}

impl SampleValidator {
    /// Validator enforcing `limits`.
    pub fn new(limits: Vec<ChannelLimits>) -> StationResult<Self> {
        for limit in &limits {
            limit.validate()?;
        }
        Ok(Self { limits })
    }

    /// Configured limits.
    pub fn limits(&self) -> &[ChannelLimits] {
        &self.limits
    }

    /// Quality verdict and findings for `sample`.
    pub fn validate(&self, sample: &RawSample) -> (Quality, Vec<ValidationIssue>) {
        let mut issues = Vec::new();

        if sample.has_protection_error() {
            issues.push(ValidationIssue::ProtectionTripped {
                bits: sample.status.bits(),
            });
        }
        for limit in &self.limits {
            match sample.analog.get(limit.channel).copied().flatten() {
                Some(value) if !(limit.min..=limit.max).contains(&value) => {
                    issues.push(ValidationIssue::OutOfRange {
                        channel: limit.channel,
                        value,
                        min: limit.min,
                        max: limit.max,
                    });
                }
                Some(_) => {}
                None if limit.required => issues.push(ValidationIssue::MissingRequired {
                    channel: limit.channel,
                }),
                None => issues.push(ValidationIssue::MissingOptional {
                    channel: limit.channel,
                }),
            }
        }
        if sample.position.is_none() {
            issues.push(ValidationIssue::MissingPosition);
        }
        if sample.force.is_none() {
            issues.push(ValidationIssue::MissingForce);
        }

        let quality = issues
            .iter()
            .map(ValidationIssue::severity)
            .max()
            .unwrap_or(Quality::Good);
        (quality, issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::StatusFlags;

    fn complete_sample() -> RawSample {
        let mut sample = RawSample::new("dev", 1);
        sample.analog[0] = Some(5.0);
        sample.position = Some(1.0);
        sample.force = Some(2.0);
        sample
    }

    fn validator() -> SampleValidator {
        SampleValidator::new(vec![
            ChannelLimits::new(0, 0.0, 10.0).required(),
            ChannelLimits::new(1, -1.0, 1.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_good_sample() {
        let mut sample = complete_sample();
        sample.analog[1] = Some(0.5);
        let (quality, issues) = validator().validate(&sample);
        assert_eq!(quality, Quality::Good);
        assert!(issues.is_empty());
    }

    #[test]
    fn test_out_of_range_is_bad() {
        let mut sample = complete_sample();
        sample.analog[0] = Some(10.5);
        sample.analog[1] = Some(0.0);
        let (quality, issues) = validator().validate(&sample);
        assert_eq!(quality, Quality::Bad);
        assert!(matches!(issues[0], ValidationIssue::OutOfRange { channel: 0, .. }));
    }

    #[test]
    fn test_missing_optional_is_uncertain() {
        let (quality, issues) = validator().validate(&complete_sample());
        assert_eq!(quality, Quality::Uncertain);
        assert_eq!(issues, vec![ValidationIssue::MissingOptional { channel: 1 }]);
    }

    #[test]
    fn test_missing_required_is_bad() {
        let mut sample = complete_sample();
        sample.analog[0] = None;
        sample.analog[1] = Some(0.0);
        assert_eq!(validator().validate(&sample).0, Quality::Bad);
    }

    #[test]
    fn test_missing_scalars_are_uncertain() {
        let mut sample = complete_sample();
        sample.analog[1] = Some(0.0);
        sample.position = None;
        let (quality, issues) = validator().validate(&sample);
        assert_eq!(quality, Quality::Uncertain);
        assert_eq!(issues, vec![ValidationIssue::MissingPosition]);
    }

    #[test]
    fn test_protection_flag_is_bad() {
        let mut sample = complete_sample();
        sample.analog[1] = Some(0.0);
        sample.status = StatusFlags::OVER_TRAVEL;
        assert_eq!(validator().validate(&sample).0, Quality::Bad);
    }

    #[test]
    fn test_invalid_limits_rejected() {
        assert!(SampleValidator::new(vec![ChannelLimits::new(8, 0.0, 1.0)]).is_err());
        assert!(SampleValidator::new(vec![ChannelLimits::new(0, 1.0, 1.0)]).is_err());
    }
}
