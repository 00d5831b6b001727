//! Authentication Negotiator
//!
//! The cluster's real handshake is unknown, so access is negotiated by trying
//! a chain of strategies in a fixed priority order. The first strategy that
//! yields a live data stream wins and nothing after it runs.
//!
//! Executing a strategy against a radio is the job of a [`StrategyExecutor`];
//! this module only decides the order and records outcomes, which keeps the
//! ordering testable without hardware.

use crate::domain::errors::BleError;
use crate::domain::models::AuthStrategyResult;
use crate::domain::settings::CustomAuthWrite;
use crate::infrastructure::event_log::EventLog;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthStrategy {
    /// Subscribe to the first notify/indicate characteristic
    DirectNotify,
    /// Write the default credential to the first writable characteristic
    GenericKeyWrite,
    /// Ask the platform for pairing / high connection priority
    Bonding,
    /// Replay a known handshake packet to a specific characteristic
    CustomWrite { characteristic: Uuid, payload: Vec<u8> },
}

impl AuthStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DirectNotify => "direct_notify",
            Self::GenericKeyWrite => "generic_key_write",
            Self::Bonding => "bonding",
            Self::CustomWrite { .. } => "custom_write",
        }
    }

    /// Built-in strategies in priority order
    pub fn default_chain() -> Vec<AuthStrategy> {
        vec![Self::DirectNotify, Self::GenericKeyWrite, Self::Bonding]
    }
}

impl fmt::Display for AuthStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CustomWrite { characteristic, .. } => {
                write!(f, "{} ({})", self.name(), characteristic)
            }
            _ => write!(f, "{}", self.name()),
        }
    }
}

/// The built-in chain followed by any configured handshake replays
pub fn build_chain(custom_writes: &[CustomAuthWrite]) -> Vec<AuthStrategy> {
    let mut chain = AuthStrategy::default_chain();
    chain.extend(custom_writes.iter().map(|write| AuthStrategy::CustomWrite {
        characteristic: write.characteristic,
        payload: write.payload.clone(),
    }));
    chain
}

/// What a single strategy achieved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyOutcome {
    /// A well-formed frame arrived; the stream is live
    Established(String),
    /// Attempted (or not applicable) without producing a stream
    NotEstablished(String),
}

impl StrategyOutcome {
    pub fn is_established(&self) -> bool {
        matches!(self, Self::Established(_))
    }

    fn into_result(self, strategy: &AuthStrategy) -> AuthStrategyResult {
        let (succeeded, detail) = match self {
            Self::Established(detail) => (true, detail),
            Self::NotEstablished(detail) => (false, detail),
        };
        AuthStrategyResult {
            strategy: strategy.to_string(),
            succeeded,
            detail,
        }
    }
}

/// Runs one strategy against a live link
#[async_trait]
pub trait StrategyExecutor: Send {
    async fn attempt(&mut self, strategy: &AuthStrategy) -> StrategyOutcome;
}

/// Ordered attempt log of one negotiation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiation {
    pub attempts: Vec<AuthStrategyResult>,
    pub established: Option<AuthStrategy>,
}

impl Negotiation {
    pub fn succeeded(&self) -> bool {
        self.established.is_some()
    }

    /// The winning strategy, or `AuthenticationExhausted` with every attempt
    pub fn into_result(self) -> Result<(AuthStrategy, Vec<AuthStrategyResult>), BleError> {
        match self.established {
            Some(strategy) => Ok((strategy, self.attempts)),
            None => Err(BleError::AuthenticationExhausted(self.attempts)),
        }
    }
}

/// Try `chain` in order, stopping at the first established stream
pub async fn negotiate<E>(chain: &[AuthStrategy], executor: &mut E, log: &EventLog) -> Negotiation
where
    E: StrategyExecutor + ?Sized,
{
    let mut negotiation = Negotiation::default();

    for strategy in chain {
        log.info(format!("Attempting auth method: {}...", strategy));
        let outcome = executor.attempt(strategy).await;
        let established = outcome.is_established();
        let result = outcome.into_result(strategy);

        if established {
            log.success(result.to_string());
        } else {
            log.warn(result.to_string());
        }
        negotiation.attempts.push(result);

        if established {
            negotiation.established = Some(strategy.clone());
            break;
        }
    }

    if !negotiation.succeeded() {
        log.error(format!(
            "All {} authentication strategies exhausted",
            negotiation.attempts.len()
        ));
    }

    negotiation
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Succeeds only for the listed strategies and records what ran
    struct ScriptedExecutor {
        succeed_on: Vec<&'static str>,
        ran: Vec<&'static str>,
    }

    #[async_trait]
    impl StrategyExecutor for ScriptedExecutor {
        async fn attempt(&mut self, strategy: &AuthStrategy) -> StrategyOutcome {
            self.ran.push(strategy.name());
            if self.succeed_on.contains(&strategy.name()) {
                StrategyOutcome::Established("frame received".into())
            } else {
                StrategyOutcome::NotEstablished("nothing".into())
            }
        }
    }

    fn executor(succeed_on: Vec<&'static str>) -> ScriptedExecutor {
        ScriptedExecutor {
            succeed_on,
            ran: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_halts_at_first_success() {
        let mut exec = executor(vec!["generic_key_write", "bonding"]);
        let log = EventLog::default();

        let negotiation = negotiate(&AuthStrategy::default_chain(), &mut exec, &log).await;

        assert_eq!(exec.ran, vec!["direct_notify", "generic_key_write"]);
        assert_eq!(negotiation.established, Some(AuthStrategy::GenericKeyWrite));
        assert_eq!(negotiation.attempts.len(), 2);
        assert!(!negotiation.attempts[0].succeeded);
        assert!(negotiation.attempts[1].succeeded);
    }

    #[tokio::test]
    async fn test_first_strategy_success_runs_nothing_else() {
        let mut exec = executor(vec!["direct_notify", "generic_key_write", "bonding"]);
        let log = EventLog::default();

        let negotiation = negotiate(&AuthStrategy::default_chain(), &mut exec, &log).await;

        assert_eq!(exec.ran, vec!["direct_notify"]);
        assert_eq!(negotiation.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_records_every_attempt() {
        let mut exec = executor(Vec::new());
        let log = EventLog::default();
        let chain = build_chain(&[CustomAuthWrite {
            characteristic: Uuid::from_u128(7),
            payload: vec![0xAA],
        }]);

        let negotiation = negotiate(&chain, &mut exec, &log).await;

        assert_eq!(
            exec.ran,
            vec!["direct_notify", "generic_key_write", "bonding", "custom_write"]
        );
        match negotiation.into_result() {
            Err(BleError::AuthenticationExhausted(attempts)) => {
                assert_eq!(attempts.len(), 4);
                assert!(attempts.iter().all(|a| !a.succeeded));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_chain_order_is_fixed() {
        assert_eq!(
            AuthStrategy::default_chain(),
            vec![
                AuthStrategy::DirectNotify,
                AuthStrategy::GenericKeyWrite,
                AuthStrategy::Bonding
            ]
        );
        let chain = build_chain(&[]);
        assert_eq!(chain, AuthStrategy::default_chain());
    }
}
