//! Deal-making circuit breaker.
//!
//! An operator-controlled switch. While it is set, no new deals are made:
//! full zones wait instead of being sealed, except zones that outlived
//! their maximum lifetime.

use tokio::sync::watch;
use tracing::{info, warn};

/// Global flag suppressing new deals.
#[derive(Debug)]
pub struct DealCircuitBreaker {
    disabled: watch::Sender<bool>,
}

impl DealCircuitBreaker {
    /// Create a breaker with the given initial state.
    pub fn new(disabled: bool) -> Self {
        let (tx, _) = watch::channel(disabled);
        Self { disabled: tx }
    }

    /// Whether deal making is currently disabled.
    pub fn is_disabled(&self) -> bool {
        *self.disabled.borrow()
    }

    /// Set the breaker. Returns the previous value.
    pub fn set_disabled(&self, disabled: bool) -> bool {
        let previous = self.disabled.send_replace(disabled);
        if previous != disabled {
            if disabled {
                warn!("deal making disabled");
            } else {
                info!("deal making re-enabled");
            }
        }
        previous
    }

    /// Subscribe to breaker changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.disabled.subscribe()
    }
}

impl Default for DealCircuitBreaker {
    fn default() -> Self {
        Self::new(false)
    }
}
