//! Command acknowledgments.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::defaults::MAX_RESULT_LEN;
use crate::error::{Error, Result};
use crate::sample::{Fields, Sample};

/// Acknowledgment code, using the bus's integer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum AckCode {
    /// Command received and queued.
    Acknowledged = 300,
    InProgress = 301,
    Stalled = 302,
    Complete = 303,
    NoPerm = -300,
    /// No acknowledgment arrived in time.
    NoAck = -301,
    Failed = -302,
    Aborted = -303,
    Timeout = -304,
}

impl AckCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        Some(match code {
            300 => Self::Acknowledged,
            301 => Self::InProgress,
            302 => Self::Stalled,
            303 => Self::Complete,
            -300 => Self::NoPerm,
            -301 => Self::NoAck,
            -302 => Self::Failed,
            -303 => Self::Aborted,
            -304 => Self::Timeout,
            _ => return None,
        })
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// True if no further acknowledgments follow this one.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Acknowledged | Self::InProgress)
    }

    /// True for codes that do not indicate failure.
    pub fn is_good(self) -> bool {
        matches!(self, Self::Acknowledged | Self::InProgress | Self::Complete)
    }
}

impl fmt::Display for AckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Acknowledged => "ACK",
            Self::InProgress => "INPROGRESS",
            Self::Stalled => "STALLED",
            Self::Complete => "COMPLETE",
            Self::NoPerm => "NOPERM",
            Self::NoAck => "NOACK",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
            Self::Timeout => "TIMEOUT",
        };
        write!(f, "{name}")
    }
}

/// Acknowledgment of one command.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    /// Sequence number of the acknowledged command.
    pub seq_num: i64,
    pub ack: AckCode,
    /// Component-specific error code.
    pub error: i32,
    /// Human-readable result, at most [`MAX_RESULT_LEN`] characters.
    pub result: String,
    /// Identity of the commander the acknowledgment is addressed to.
    pub identity: String,
}

impl Ack {
    pub fn new(seq_num: i64, ack: AckCode) -> Self {
        Self {
            seq_num,
            ack,
            error: 0,
            result: String::new(),
            identity: String::new(),
        }
    }

    /// Set the result; longer than [`MAX_RESULT_LEN`] characters is truncated
    /// when `truncate` is true and rejected otherwise.
    pub fn with_result(mut self, result: impl Into<String>, truncate: bool) -> Result<Self> {
        let result = result.into();
        let len = result.chars().count();
        self.result = if len <= MAX_RESULT_LEN {
            result
        } else if truncate {
            result.chars().take(MAX_RESULT_LEN).collect()
        } else {
            return Err(Error::InvalidValue(format!(
                "result has {len} characters; the limit is {MAX_RESULT_LEN}"
            )));
        };
        Ok(self)
    }

    pub fn with_error(mut self, error: i32) -> Self {
        self.error = error;
        self
    }

    /// `Failed` acknowledgment with a truncated result.
    pub fn failed(seq_num: i64, error: i32, result: &str) -> Self {
        let mut ack = Self::new(seq_num, AckCode::Failed).with_error(error);
        ack.result = result.chars().take(MAX_RESULT_LEN).collect();
        ack
    }

    /// Field values written on the acknowledgment topic.
    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("ack".into(), json!(self.ack.as_i32()));
        fields.insert("error".into(), json!(self.error));
        fields.insert("result".into(), json!(self.result));
        fields
    }

    /// Parse a received acknowledgment.
    pub fn from_sample(sample: &Sample) -> Result<Self> {
        let code: i32 = sample.field("ack")?;
        let ack = AckCode::from_i32(code)
            .ok_or_else(|| Error::InvalidValue(format!("unknown ack code {code}")))?;
        Ok(Self {
            seq_num: sample.seq_num(),
            ack,
            error: sample.field("error").unwrap_or(0),
            result: sample.field("result").unwrap_or_default(),
            identity: sample.identity().to_string(),
        })
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ack(seq_num={}, ack={}, error={}, result={:?})",
            self.seq_num, self.ack, self.error, self.result
        )
    }
}

/// A command ended with a bad acknowledgment.
#[derive(Debug, Clone, Error)]
#[error("{message}: {ack}")]
pub struct AckError {
    pub message: String,
    pub ack: Ack,
}

impl AckError {
    pub fn new(message: impl Into<String>, ack: Ack) -> Self {
        Self {
            message: message.into(),
            ack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_classes() {
        let terminal: Vec<AckCode> = [
            AckCode::Acknowledged,
            AckCode::InProgress,
            AckCode::Stalled,
            AckCode::Complete,
            AckCode::NoPerm,
            AckCode::NoAck,
            AckCode::Failed,
            AckCode::Aborted,
            AckCode::Timeout,
        ]
        .into_iter()
        .filter(|c| c.is_terminal())
        .collect();
        assert_eq!(terminal.len(), 7);
        assert!(AckCode::Complete.is_good());
        assert!(!AckCode::Stalled.is_good());
        assert_eq!(AckCode::from_i32(-303), Some(AckCode::Aborted));
        assert_eq!(AckCode::from_i32(0), None);
    }

    #[test]
    fn test_result_limit() {
        let long = "x".repeat(MAX_RESULT_LEN + 1);
        assert!(Ack::new(1, AckCode::Complete)
            .with_result(long.clone(), false)
            .is_err());
        let ack = Ack::new(1, AckCode::Complete).with_result(long.clone(), true).unwrap();
        assert_eq!(ack.result.len(), MAX_RESULT_LEN);
        assert_eq!(Ack::failed(1, 1, &long).result.len(), MAX_RESULT_LEN);
    }
}
