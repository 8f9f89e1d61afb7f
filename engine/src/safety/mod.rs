//! Safety controls
//!
//! Holds the process-wide emergency stop and the per-operation cancellation
//! tokens. Engaging the emergency stop cancels every registered token, so
//! running executors observe it at their next checkpoint. The stop stays
//! engaged until an operator clears it.
//!
//! Also evaluates the error-rate circuit breaker for an operation.

use sdk::errors::EngineError;
use sdk::types::{BatchOperation, OperationId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct SafetyController {
    emergency: AtomicBool,
    tokens: Mutex<HashMap<OperationId, CancellationToken>>,
}

impl SafetyController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation and hand back its cancellation token
    ///
    /// The flag is read under the token lock, so a concurrent `engage`
    /// either sees the new token or the token starts out cancelled.
    pub fn register(&self, operation_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let mut tokens = self.lock_tokens();
        if self.is_engaged() {
            token.cancel();
        }
        tokens.insert(operation_id.to_string(), token.clone());
        token
    }

    /// Drop an operation's token once it is terminal
    pub fn unregister(&self, operation_id: &str) {
        self.lock_tokens().remove(operation_id);
    }

    /// Cancel one operation's token. Returns false if it is not registered.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.lock_tokens().get(operation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Engage the emergency stop. Returns true if this call engaged it.
    pub fn engage(&self) -> bool {
        let tokens = self.lock_tokens();
        let newly = !self.emergency.swap(true, Ordering::SeqCst);

        for token in tokens.values() {
            token.cancel();
        }

        if newly {
            tracing::warn!(operations = tokens.len(), "Emergency stop engaged");
        }
        newly
    }

    /// Clear the emergency stop. Returns true if it was engaged.
    pub fn clear(&self) -> bool {
        let was = self.emergency.swap(false, Ordering::SeqCst);
        if was {
            tracing::info!("Emergency stop cleared");
        }
        was
    }

    pub fn is_engaged(&self) -> bool {
        self.emergency.load(Ordering::SeqCst)
    }

    /// Error-rate breaker. Trips once at least one term has been processed
    /// and the failure share exceeds the operation's limit.
    pub fn check_error_rate(&self, operation: &BatchOperation) -> Result<(), EngineError> {
        if operation.processed_terms == 0 {
            return Ok(());
        }

        let rate = operation.error_rate();
        let limit = operation.safety.max_error_rate;
        if rate > limit {
            return Err(EngineError::ErrorRateExceeded {
                operation_id: operation.operation_id.clone(),
                rate,
                limit,
            });
        }
        Ok(())
    }

    fn lock_tokens(&self) -> std::sync::MutexGuard<'_, HashMap<OperationId, CancellationToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
