//! Lifecycle states of [`ApplicationPrincipals`](super::ApplicationPrincipals).

use std::fmt;

/// Current state of an application's principals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrincipalsState {
    Inactive,
    Opening,
    Opened,
    /// Some users are waiting for a certificate; the retry timer is being armed.
    RetryScheduling,
    /// The retry timer is armed.
    RetryScheduled,
    UserCreationRetrying,
    UpdatingPrincipal,
    /// A read-only query is running; the previous state is restored afterwards.
    GettingPrincipal,
    Closing,
    Closed,
    Failed,
}

impl PrincipalsState {
    /// Whether moving from `self` to `next` is legal.
    pub fn can_transition_to(self, next: PrincipalsState) -> bool {
        use PrincipalsState::*;

        match (self, next) {
            (Closed, _) => false,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Closing | Failed) => true,
            (Inactive, Opening) => true,
            (Opening, Opened | RetryScheduling) => true,
            (RetryScheduling, RetryScheduled) => true,
            (RetryScheduled, UserCreationRetrying | GettingPrincipal) => true,
            (UserCreationRetrying, Opened | RetryScheduling) => true,
            (Opened, UpdatingPrincipal | GettingPrincipal) => true,
            (UpdatingPrincipal, Opened) => true,
            (GettingPrincipal, Opened | RetryScheduled) => true,
            _ => false,
        }
    }

    /// States a query may return to after `GettingPrincipal`.
    pub fn is_restorable(self) -> bool {
        matches!(self, Self::Opened | Self::RetryScheduled)
    }
}

impl fmt::Display for PrincipalsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
