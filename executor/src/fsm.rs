use rust_fsm::*;

/// Lifecycle of one backend connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// No link object yet.
    Disconnected,
    /// Login phase: sending data.
    ConnectWrite,
    /// Login phase: waiting for the server.
    ConnectRead,
    /// Link ready for a query.
    Ready,
    /// Query phase: sending data.
    QueryWrite,
    /// Query phase: waiting for the server.
    QueryRead,
    /// Query done, result held.
    Done,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnEvent {
    StartConnect,
    PollWriting,
    PollReading,
    PollOk,
    Submit,
    FlushMore,
    FlushDone,
    Drained,
    TuningDrained,
    Reuse,
}

#[derive(Debug)]
pub enum ConnAction {
    Login,
    Tune,
    Pump,
}

state_machine! {
    #[derive(Debug)]
    #[state_machine(input(crate::fsm::ConnEvent), state(crate::fsm::ConnState), output(crate::fsm::ConnAction))]
    pub connection(Disconnected)

    Disconnected => {
        StartConnect => ConnectWrite[Login],
    },
    ConnectWrite => {
        PollWriting => ConnectWrite,
        PollReading => ConnectRead,
        PollOk => Ready[Tune],
    },
    ConnectRead => {
        PollReading => ConnectRead,
        PollWriting => ConnectWrite,
        PollOk => Ready[Tune],
    },
    Ready => {
        Submit => QueryWrite[Pump],
    },
    QueryWrite => {
        FlushMore => QueryWrite,
        FlushDone => QueryRead,
    },
    QueryRead => {
        Drained => Done,
        TuningDrained => Ready[Tune],
    },
    Done => {
        Reuse => Ready,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_walks_to_ready() {
        let mut sm = connection::StateMachine::new();
        assert_eq!(sm.state(), &ConnState::Disconnected);
        sm.consume(&ConnEvent::StartConnect).unwrap();
        assert_eq!(sm.state(), &ConnState::ConnectWrite);
        sm.consume(&ConnEvent::PollReading).unwrap();
        assert_eq!(sm.state(), &ConnState::ConnectRead);
        sm.consume(&ConnEvent::PollWriting).unwrap();
        assert_eq!(sm.state(), &ConnState::ConnectWrite);
        sm.consume(&ConnEvent::PollOk).unwrap();
        assert_eq!(sm.state(), &ConnState::Ready);
    }

    #[test]
    fn query_roundtrip_and_reuse() {
        let mut sm = connection::StateMachine::new();
        sm.consume(&ConnEvent::StartConnect).unwrap();
        sm.consume(&ConnEvent::PollOk).unwrap();
        sm.consume(&ConnEvent::Submit).unwrap();
        assert_eq!(sm.state(), &ConnState::QueryWrite);
        sm.consume(&ConnEvent::FlushMore).unwrap();
        assert_eq!(sm.state(), &ConnState::QueryWrite);
        sm.consume(&ConnEvent::FlushDone).unwrap();
        assert_eq!(sm.state(), &ConnState::QueryRead);
        sm.consume(&ConnEvent::Drained).unwrap();
        assert_eq!(sm.state(), &ConnState::Done);
        sm.consume(&ConnEvent::Reuse).unwrap();
        assert_eq!(sm.state(), &ConnState::Ready);
    }

    #[test]
    fn tuning_drain_returns_to_ready() {
        let mut sm = connection::StateMachine::new();
        sm.consume(&ConnEvent::StartConnect).unwrap();
        sm.consume(&ConnEvent::PollOk).unwrap();
        sm.consume(&ConnEvent::Submit).unwrap();
        sm.consume(&ConnEvent::FlushDone).unwrap();
        sm.consume(&ConnEvent::TuningDrained).unwrap();
        assert_eq!(sm.state(), &ConnState::Ready);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let mut sm = connection::StateMachine::new();
        assert!(sm.consume(&ConnEvent::Submit).is_err());
        sm.consume(&ConnEvent::StartConnect).unwrap();
        assert!(sm.consume(&ConnEvent::Drained).is_err());
    }
}
