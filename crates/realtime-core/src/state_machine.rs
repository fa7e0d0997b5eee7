use crate::{error::ChannelError, types::ChannelState};

/// Lifecycle tracker for one channel registration.
#[derive(Debug, Clone)]
pub struct ChannelStateMachine {
    state: ChannelState,
}

impl Default for ChannelStateMachine {
    fn default() -> Self {
        Self {
            state: ChannelState::Connecting,
        }
    }
}

impl ChannelStateMachine {
    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ChannelState::Closed | ChannelState::Failed)
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    ///
    /// Re-entering the current state is rejected as well so callers only
    /// publish real changes.
    pub fn transition(&mut self, next: ChannelState) -> Result<ChannelState, ChannelError> {
        use ChannelState::*;

        let allowed = match self.state {
            Connecting => matches!(next, Connected | Disconnected | Closed),
            Connected => matches!(next, Disconnected | Closed),
            Disconnected => matches!(next, Connecting | Failed | Closed),
            Failed => matches!(next, Closed),
            Closed => false,
        };

        if !allowed {
            return Err(ChannelError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        self.state = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_reconnect_cycle() {
        let mut sm = ChannelStateMachine::default();
        assert_eq!(sm.state(), ChannelState::Connecting);

        sm.transition(ChannelState::Connected).expect("connect");
        sm.transition(ChannelState::Disconnected).expect("drop");
        sm.transition(ChannelState::Connecting).expect("reconnect");
        sm.transition(ChannelState::Connected).expect("connect again");
        sm.transition(ChannelState::Closed).expect("close");
        assert!(sm.is_terminal());
    }

    #[test]
    fn failed_channels_can_only_close() {
        let mut sm = ChannelStateMachine::default();
        sm.transition(ChannelState::Disconnected).expect("open failure");
        sm.transition(ChannelState::Failed).expect("exhausted");

        let err = sm
            .transition(ChannelState::Connecting)
            .expect_err("failed channel must not reconnect");
        assert_eq!(
            err,
            ChannelError::InvalidTransition {
                from: ChannelState::Failed,
                to: ChannelState::Connecting,
            }
        );
        sm.transition(ChannelState::Closed).expect("close after failure");
    }

    #[test]
    fn closed_is_terminal() {
        let mut sm = ChannelStateMachine::default();
        sm.transition(ChannelState::Closed).expect("close");
        assert!(sm.transition(ChannelState::Connecting).is_err());
        assert!(sm.transition(ChannelState::Closed).is_err());
    }

    #[test]
    fn rejects_connected_to_failed_shortcut() {
        let mut sm = ChannelStateMachine::default();
        sm.transition(ChannelState::Connected).expect("connect");
        assert!(sm.transition(ChannelState::Failed).is_err());
        assert_eq!(sm.state(), ChannelState::Connected);
    }
}
