//! TCP connection states and the transition table (RFC 793)

use core::fmt;

/// TCP Connection State (RFC 793)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    /// No connection
    Closed,
    /// Waiting for connection request
    Listen,
    /// Sent SYN, waiting for SYN-ACK
    SynSent,
    /// Received SYN, sent SYN-ACK, waiting for ACK
    SynReceived,
    /// Connection established, data transfer
    Established,
    /// Sent FIN, waiting for ACK
    FinWait1,
    /// Our FIN acknowledged, waiting for the peer's FIN
    FinWait2,
    /// Received FIN, waiting for the local close
    CloseWait,
    /// Both sides sent FIN, waiting for ACK of ours
    Closing,
    /// Sent FIN after receiving FIN, waiting for ACK
    LastAck,
    /// Waiting out old duplicates before the connection is forgotten
    TimeWait,
}

/// Inputs that move a connection between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpEvent {
    /// Local active open (connect)
    ActiveOpen,
    /// Local passive open (listen)
    PassiveOpen,
    /// SYN without ACK
    SynReceived,
    /// SYN+ACK acknowledging our SYN
    SynAckReceived,
    /// ACK covering our SYN or FIN
    AckReceived,
    FinReceived,
    /// Acceptable RST
    RstReceived,
    /// Local close
    Close,
    /// TIME_WAIT timer expiry
    Timeout,
    /// Retransmissions exhausted, or an orphan gave up waiting in FIN_WAIT_2
    Abort,
}

impl TcpState {
    /// Transition table
    ///
    /// Returns `None` when the event is not valid in this state.
    pub fn on_event(self, event: TcpEvent) -> Option<TcpState> {
        use TcpEvent as E;
        use TcpState as S;

        let next = match (self, event) {
            (S::Closed, E::ActiveOpen) => S::SynSent,
            (S::Closed, E::PassiveOpen) => S::Listen,
            (S::Closed, E::SynReceived) => S::SynReceived,

            (S::Listen, E::SynReceived) => S::SynReceived,
            (S::Listen, E::Close) => S::Closed,

            (S::SynSent, E::SynAckReceived) => S::Established,
            (S::SynSent, E::RstReceived) => S::Closed,
            (S::SynSent, E::Close) => S::Closed,

            (S::SynReceived, E::AckReceived) => S::Established,
            (S::SynReceived, E::RstReceived) => S::Listen,
            (S::SynReceived, E::Close) => S::Closed,

            (S::Established, E::Close) => S::FinWait1,
            (S::Established, E::FinReceived) => S::CloseWait,

            (S::FinWait1, E::AckReceived) => S::FinWait2,
            (S::FinWait1, E::FinReceived) => S::Closing,
            (S::FinWait2, E::FinReceived) => S::TimeWait,

            (S::CloseWait, E::Close) => S::LastAck,
            (S::Closing, E::AckReceived) => S::TimeWait,
            (S::LastAck, E::AckReceived) => S::Closed,
            (S::TimeWait, E::Timeout) => S::Closed,

            (
                S::Established
                | S::FinWait1
                | S::FinWait2
                | S::CloseWait
                | S::Closing
                | S::LastAck
                | S::TimeWait,
                E::RstReceived,
            ) => S::Closed,

            (S::Closed, E::Abort) => return None,
            (_, E::Abort) => S::Closed,

            _ => return None,
        };
        Some(next)
    }

    /// SYN exchanged in both directions
    pub fn is_synchronized(&self) -> bool {
        !matches!(
            self,
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived
        )
    }

    /// Local side may still queue data
    pub fn can_send(&self) -> bool {
        matches!(
            self,
            TcpState::SynSent | TcpState::SynReceived | TcpState::Established | TcpState::CloseWait
        )
    }

    /// Inbound data is still accepted
    pub fn can_receive(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TcpState::Closed => "CLOSED",
            TcpState::Listen => "LISTEN",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynReceived => "SYN_RECEIVED",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT_1",
            TcpState::FinWait2 => "FIN_WAIT_2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::Closing => "CLOSING",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(name)
    }
}
