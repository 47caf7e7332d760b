//! Supervisor-owned modem state.
//!
//! Global mutable flags in the original design become one struct with
//! explicit transition methods — handlers read it through a shared handle but
//! only the documented transitions below mutate it, matching spec.md's
//! invariant list in §3 and the re-architecture hint in §9.

use std::sync::Arc;

use tokio::sync::RwLock;

/// Process-wide modem lifecycle state. Cheaply cloneable; all clones share
/// the same inner lock.
#[derive(Clone)]
pub struct ModemState {
    inner: Arc<RwLock<Inner>>,
}

struct Inner {
    initialized: bool,
    network_ready: bool,
    sim_unlocked: bool,
    retry_number: u32,
    reset_number: u32,
    network_retry: u32,
    brownout_number: u32,
}

/// Snapshot of [`ModemState`] at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub initialized: bool,
    pub network_ready: bool,
    pub sim_unlocked: bool,
    pub retry_number: u32,
    pub reset_number: u32,
    pub network_retry: u32,
    pub brownout_number: u32,
}

impl ModemState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                initialized: false,
                network_ready: false,
                sim_unlocked: false,
                retry_number: 0,
                reset_number: 0,
                network_retry: 0,
                brownout_number: 0,
            })),
        }
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        let s = self.inner.read().await;
        StateSnapshot {
            initialized: s.initialized,
            network_ready: s.network_ready,
            sim_unlocked: s.sim_unlocked,
            retry_number: s.retry_number,
            reset_number: s.reset_number,
            network_retry: s.network_retry,
            brownout_number: s.brownout_number,
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.inner.read().await.initialized
    }

    pub async fn is_network_ready(&self) -> bool {
        self.inner.read().await.network_ready
    }

    // -- check-pin → simUnlocked ------------------------------------------------

    pub async fn set_sim_unlocked(&self, unlocked: bool) {
        self.inner.write().await.sim_unlocked = unlocked;
    }

    // -- check-network / internal network handler → networkReady ---------------

    /// `networkReady` transitions true on `REGISTERED` (1) or `ROAMING` (5);
    /// any other status counts as a registration loss.
    pub async fn observe_network_status(&self, network_status: i32) -> bool {
        let registered = network_status == 1 || network_status == 5;
        let mut s = self.inner.write().await;
        s.network_ready = registered;
        if registered {
            s.network_retry = 0;
        } else {
            s.network_retry += 1;
        }
        registered
    }

    pub async fn network_retry(&self) -> u32 {
        self.inner.read().await.network_retry
    }

    // -- brownout detector → brownoutNumber -------------------------------------

    pub async fn record_brownout_failure(&self) -> u32 {
        let mut s = self.inner.write().await;
        s.brownout_number += 1;
        s.brownout_number
    }

    pub async fn record_brownout_success(&self) {
        self.inner.write().await.brownout_number = 0;
    }

    // -- initialization sequence → initialized, retryNumber, resetNumber -------

    pub async fn mark_initialized(&self) {
        let mut s = self.inner.write().await;
        s.initialized = true;
        s.retry_number = 0;
        s.reset_number = 0;
    }

    pub async fn record_init_retry(&self) -> u32 {
        let mut s = self.inner.write().await;
        s.retry_number += 1;
        s.retry_number
    }

    // -- reset → full lifecycle block -------------------------------------------

    /// Apply the post-reset invariant block from spec.md §3: `initialized`
    /// and `networkReady` drop, the retry counters zero, `resetNumber` bumps.
    /// Returns the new `resetNumber`.
    pub async fn apply_reset(&self) -> u32 {
        let mut s = self.inner.write().await;
        s.initialized = false;
        s.network_ready = false;
        s.retry_number = 0;
        s.network_retry = 0;
        s.brownout_number = 0;
        s.reset_number += 1;
        s.reset_number
    }
}

impl Default for ModemState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reset_clears_lifecycle() {
        let state = ModemState::new();
        state.mark_initialized().await;
        state.observe_network_status(1).await;
        assert!(state.is_initialized().await);
        assert!(state.is_network_ready().await);

        let reset_number = state.apply_reset().await;
        assert_eq!(reset_number, 1);
        assert!(!state.is_initialized().await);
        assert!(!state.is_network_ready().await);
    }

    #[tokio::test]
    async fn network_retry_increments_on_loss() {
        let state = ModemState::new();
        state.observe_network_status(1).await;
        assert_eq!(state.network_retry().await, 0);
        state.observe_network_status(0).await;
        state.observe_network_status(0).await;
        assert_eq!(state.network_retry().await, 2);
    }
}
