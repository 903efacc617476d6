//! Instance state machine.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Phase of an instance's life.
///
/// ```text
/// Allocating -> Starting -> Ready -> Terminating -> Terminated
///      \____________\__________\__________\______> Failed
/// ```
///
/// `Terminated` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Binaries are being resolved and a port reserved.
    Allocating,
    /// The data directory is being initialised and the server started.
    Starting,
    /// The server accepts connections.
    Ready,
    /// The server is being shut down.
    Terminating,
    /// The server has stopped.
    Terminated,
    /// Start-up or teardown failed.
    Failed,
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal instance state transition from {from} to {to}")]
pub struct IllegalTransition {
    /// State before the attempted change.
    pub from: InstanceState,
    /// Requested state.
    pub to: InstanceState,
}

impl InstanceState {
    /// Returns `true` for the absorbing states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Returns `true` when moving from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Allocating, Self::Starting)
                | (Self::Starting, Self::Ready)
                | (Self::Ready, Self::Terminating)
                | (Self::Terminating, Self::Terminated)
                | (
                    Self::Allocating | Self::Starting | Self::Ready | Self::Terminating,
                    Self::Failed
                )
        )
    }

    /// Moves to `next`, leaving the state untouched when the change is
    /// illegal.
    ///
    /// # Errors
    /// Returns [`IllegalTransition`] when `next` is not reachable from the
    /// current state.
    pub fn transition(&mut self, next: Self) -> Result<(), IllegalTransition> {
        if !self.can_transition_to(next) {
            return Err(IllegalTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Allocating => "allocating",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
