//! Abort coordinator (C11) — spec §4.11.
//!
//! New relative to the teacher: each provider's `chat_loop` just drops its
//! background task when the caller stops polling, with no shared
//! cancellation signal. Here one [`CancellationToken`] per turn is threaded
//! through [`crate::http_client`] and [`crate::orchestrator`] so a
//! client-close, upstream error, or timeout all converge on the same
//! "abort this turn" edge.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a turn was aborted (spec §4.11's enumerated triggers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    ClientClosed,
    UpstreamError,
    Timeout,
    Explicit,
}

/// Owns the single cancellation signal for one turn.
///
/// Tool-batch timeouts are deliberately independent of this token (spec
/// §4.7: a slow tool call times out on its own batch deadline without
/// aborting the whole turn).
#[derive(Clone)]
pub struct AbortCoordinator {
    token: CancellationToken,
}

impl AbortCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn abort(&self, _reason: AbortReason) {
        self.token.cancel();
    }

    /// Spawn the turn's optional wall-clock timeout (spec §4.11
    /// `turn_timeout_ms`; `None` means no timeout).
    pub fn arm_timeout(&self, timeout: Option<Duration>) {
        let Some(timeout) = timeout else {
            return;
        };
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => token.cancel(),
                _ = token.cancelled() => {}
            }
        });
    }
}

impl Default for AbortCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
