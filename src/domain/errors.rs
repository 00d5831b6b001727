//! Error taxonomy for the BLE link.
//!
//! Terminal errors end the current session and surface as
//! [`SessionState::Failed`](crate::domain::models::SessionState::Failed);
//! recoverable ones are logged and the session carries on.

use crate::domain::models::AuthStrategyResult;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed frame: {len} byte(s), expected at least {min}")]
    MalformedFrame { len: usize, min: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Bluetooth permissions not granted")]
    PermissionDenied,

    #[error("Bluetooth radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("Failed to establish link: {0}")]
    LinkEstablishFailed(String),

    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("No authentication strategy produced a data stream ({} attempted)", .0.len())]
    AuthenticationExhausted(Vec<AuthStrategyResult>),

    #[error(transparent)]
    MalformedFrame(#[from] DecodeError),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Bonding request failed: {0}")]
    BondingFailed(String),
}

impl BleError {
    /// Recoverable errors are logged without ending the session
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MalformedFrame(_) | Self::BondingFailed(_) | Self::WriteFailed(_)
        )
    }

    /// Strategy attempts recorded before negotiation gave up
    pub fn attempts(&self) -> &[AuthStrategyResult] {
        match self {
            Self::AuthenticationExhausted(attempts) => attempts,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_split() {
        assert!(BleError::BondingFailed("x".into()).is_recoverable());
        assert!(BleError::from(DecodeError::MalformedFrame { len: 2, min: 6 }).is_recoverable());
        assert!(!BleError::PermissionDenied.is_recoverable());
        assert!(!BleError::AuthenticationExhausted(Vec::new()).is_recoverable());
    }

    #[test]
    fn test_exhausted_message_counts_attempts() {
        let err = BleError::AuthenticationExhausted(vec![
            AuthStrategyResult {
                strategy: "direct_notify".into(),
                succeeded: false,
                detail: "no notifiable characteristic".into(),
            };
            3
        ]);
        assert_eq!(err.attempts().len(), 3);
        assert!(err.to_string().contains("3 attempted"));
    }
}
