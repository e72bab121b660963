use core::fmt;

use crate::error::ChannelError;

/// Lifecycle state of a channel manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Uninitialized,
    PreConnect,
    Connected,
    Disconnecting,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::PreConnect => "pre-connect",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Operations whose legality depends on the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Register,
    PreConnect,
    PostConnect,
    Open,
    RegisterListener,
    Write,
    CloseChannel,
    NetworkEvent,
    Dispatch,
}

impl Operation {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Operation::Register => "register",
            Operation::PreConnect => "pre_connect",
            Operation::PostConnect => "post_connect",
            Operation::Open => "open",
            Operation::RegisterListener => "register_listener",
            Operation::Write => "write",
            Operation::CloseChannel => "close_channel",
            Operation::NetworkEvent => "network_event",
            Operation::Dispatch => "dispatch",
        }
    }

    pub(crate) fn is_allowed_in(self, state: ConnectionState) -> bool {
        use ConnectionState::*;

        match self {
            Operation::Register => matches!(state, Uninitialized | PreConnect),
            Operation::PreConnect => state == Uninitialized,
            Operation::PostConnect => state == PreConnect,
            Operation::Open | Operation::RegisterListener => matches!(state, PreConnect | Connected),
            Operation::Write => state == Connected,
            Operation::CloseChannel | Operation::Dispatch => matches!(state, PreConnect | Connected | Disconnecting),
            // Events arriving while disconnecting are accepted and dropped by the caller.
            Operation::NetworkEvent => matches!(state, Connected | Disconnecting),
        }
    }
}

pub(crate) fn ensure(state: ConnectionState, operation: Operation) -> Result<(), ChannelError> {
    if operation.is_allowed_in(state) {
        Ok(())
    } else {
        Err(ChannelError::InvalidState {
            operation: operation.name(),
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::ConnectionState::*;
    use super::*;

    #[rstest]
    #[case(Operation::Register, [true, true, false, false, false])]
    #[case(Operation::PreConnect, [true, false, false, false, false])]
    #[case(Operation::PostConnect, [false, true, false, false, false])]
    #[case(Operation::Open, [false, true, true, false, false])]
    #[case(Operation::RegisterListener, [false, true, true, false, false])]
    #[case(Operation::Write, [false, false, true, false, false])]
    #[case(Operation::CloseChannel, [false, true, true, true, false])]
    #[case(Operation::NetworkEvent, [false, false, true, true, false])]
    #[case(Operation::Dispatch, [false, true, true, true, false])]
    fn gating_matrix(#[case] operation: Operation, #[case] expected: [bool; 5]) {
        let states = [Uninitialized, PreConnect, Connected, Disconnecting, Closed];

        for (state, expected) in states.into_iter().zip(expected) {
            assert_eq!(
                expected,
                operation.is_allowed_in(state),
                "{} in {state}",
                operation.name()
            );
        }
    }

    #[test]
    fn ensure_reports_operation_and_state() {
        let error = ensure(Uninitialized, Operation::Write).unwrap_err();
        assert_eq!("`write` is illegal in the uninitialized state", error.to_string());
    }
}
