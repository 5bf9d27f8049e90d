//! Lifecycle states of an application host proxy.

use std::fmt;

/// Current state of an application host proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostProxyState {
    /// Constructed, host not started.
    Created,
    /// Host is being started.
    Opening,
    /// Host is running and accepting requests.
    Opened,
    /// Host is being stopped.
    Closing,
    /// Host stopped cleanly.
    Closed,
    /// Host was torn down after a failure or termination.
    Aborted,
}

impl HostProxyState {
    /// Whether the proxy may move from `self` to `next`.
    ///
    /// `Opening -> Created` lets a caller retry an open whose environment
    /// could not be assembled.
    pub fn can_transition_to(self, next: HostProxyState) -> bool {
        use HostProxyState::*;
        match (self, next) {
            (Created, Opening) => true,
            (Opening, Opened) | (Opening, Created) => true,
            (Opened, Closing) => true,
            (Closing, Closed) => true,
            (Closed, _) | (Aborted, _) => false,
            (_, Aborted) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }
}

impl fmt::Display for HostProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Opening => write!(f, "Opening"),
            Self::Opened => write!(f, "Opened"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_edges() {
        use HostProxyState::*;
        assert!(Created.can_transition_to(Opening));
        assert!(Opening.can_transition_to(Opened));
        assert!(Opened.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Created.can_transition_to(Opened));
        assert!(!Opened.can_transition_to(Opening));
    }

    #[test]
    fn test_terminal_states() {
        use HostProxyState::*;
        for state in [Created, Opening, Opened, Closing] {
            assert!(state.can_transition_to(Aborted), "{state} should abort");
        }
        assert!(!Closed.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Aborted));
        assert!(Aborted.is_terminal());
    }
}
