//! Envelope: the addressed, typed unit of cross-agent traffic.

use super::cipher::BusCipher;
use crate::error::{VigilError, VigilResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    pub action: String,
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub data: Value,
}

/// What is actually sealed: the envelope plus its issue time.
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    iat: i64,
    #[serde(flatten)]
    envelope: Envelope,
}

impl Envelope {
    pub fn new(
        from: impl Into<String>,
        to: Vec<String>,
        action: impl Into<String>,
        action_type: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            from: from.into(),
            to,
            action: action.into(),
            action_type: action_type.into(),
            data,
        }
    }

    pub fn is_addressed_to(&self, agent: &str) -> bool {
        self.to.iter().any(|r| r == agent)
    }

    /// Seal into a transport token stamped with `now`.
    pub fn seal(&self, cipher: &BusCipher, now: DateTime<Utc>) -> VigilResult<String> {
        let frame = Frame {
            iat: now.timestamp(),
            envelope: self.clone(),
        };
        cipher.seal(&serde_json::to_vec(&frame)?)
    }

    /// Open a token. Frames older than `ttl_secs` (when set) are rejected.
    pub fn open(cipher: &BusCipher, token: &str, ttl_secs: Option<u64>, now: DateTime<Utc>) -> VigilResult<Self> {
        let plain = cipher.open(token)?;
        let frame: Frame = serde_json::from_slice(&plain)?;
        if let Some(ttl) = ttl_secs {
            let age = now.timestamp().saturating_sub(frame.iat);
            if age > i64::try_from(ttl).unwrap_or(i64::MAX) {
                return Err(VigilError::Crypto(format!("token expired ({}s old)", age)));
            }
        }
        Ok(frame.envelope)
    }
}
