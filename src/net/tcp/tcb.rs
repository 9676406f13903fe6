//! TCP control block

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::net::SocketAddrV4;
use core::time::Duration;

use super::ConnId;
use super::segment::{TcpFlags, seq_ge, seq_le, seq_lt};
use super::state::TcpState;
use crate::net::timer::{Instant, TimerId};

/// A sent segment waiting for acknowledgment
#[derive(Debug, Clone)]
pub struct Unacked {
    pub seq: u32,
    /// SYN and FIN are kept so they are retransmitted like data
    pub flags: TcpFlags,
    pub data: Vec<u8>,
    pub sent_at: Instant,
}

impl Unacked {
    pub fn seq_len(&self) -> u32 {
        let mut len = self.data.len() as u32;
        if self.flags.contains(TcpFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(TcpFlags::FIN) {
            len += 1;
        }
        len
    }

    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }
}

/// Who is allowed to operate on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// Handle held by the application
    User,
    /// Not yet accepted from this listener
    Listener(ConnId),
    /// Application closed the handle; teardown continues
    Orphan,
}

/// Pending connections of a listening socket
#[derive(Debug, Default)]
pub struct Backlog {
    pub limit: usize,
    /// Children still in SYN_RECEIVED
    pub embryonic: Vec<ConnId>,
    /// Established children waiting for `accept`
    pub ready: VecDeque<ConnId>,
}

impl Backlog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn is_full(&self) -> bool {
        self.embryonic.len() + self.ready.len() >= self.limit
    }

    pub fn remove(&mut self, child: ConnId) {
        self.embryonic.retain(|&id| id != child);
        self.ready.retain(|&id| id != child);
    }
}

/// Per-connection state (RFC 793 section 3.2)
#[derive(Debug)]
pub struct Tcb {
    pub local: SocketAddrV4,
    pub remote: SocketAddrV4,
    pub state: TcpState,
    pub owner: Owner,
    /// Local port is reserved in the port registry on our behalf
    pub owns_port: bool,

    pub iss: u32,
    pub irs: u32,
    /// Oldest unacknowledged sequence number
    pub snd_una: u32,
    /// Next sequence number to send
    pub snd_nxt: u32,
    /// Peer's advertised window
    pub snd_wnd: u16,
    /// Next sequence number expected from the peer
    pub rcv_nxt: u32,
    /// Last window we advertised
    pub adv_wnd: u16,
    pub mss: u16,

    pub retransmit_queue: VecDeque<Unacked>,
    pub rto: Duration,
    /// Consecutive retransmissions of the oldest segment
    pub backoff: u32,
    pub retransmit_timer: Option<TimerId>,
    pub time_wait_timer: Option<TimerId>,
    pub fin_wait2_timer: Option<TimerId>,

    /// Written by the application, not yet sent
    pub send_buffer: VecDeque<u8>,
    pub send_capacity: usize,
    /// Received in order, not yet read
    pub recv_buffer: VecDeque<u8>,
    pub recv_capacity: usize,

    /// Sequence number of our FIN once sent
    pub fin_seq: Option<u32>,
    pub fin_received: bool,

    /// Only set on listeners
    pub backlog: Option<Backlog>,
}

impl Tcb {
    pub fn new(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        owner: Owner,
        mss: u16,
        rto: Duration,
        send_capacity: usize,
        recv_capacity: usize,
    ) -> Self {
        Self {
            local,
            remote,
            state: TcpState::Closed,
            owner,
            owns_port: false,
            iss: 0,
            irs: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            rcv_nxt: 0,
            adv_wnd: 0,
            mss,
            retransmit_queue: VecDeque::new(),
            rto,
            backoff: 0,
            retransmit_timer: None,
            time_wait_timer: None,
            fin_wait2_timer: None,
            send_buffer: VecDeque::new(),
            send_capacity,
            recv_buffer: VecDeque::new(),
            recv_capacity,
            fin_seq: None,
            fin_received: false,
            backlog: None,
        }
    }

    /// Window we can offer right now
    pub fn rcv_wnd(&self) -> u16 {
        self.recv_capacity
            .saturating_sub(self.recv_buffer.len())
            .min(u16::MAX as usize) as u16
    }

    /// Bytes sent but not acknowledged
    pub fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// Room left in the peer's window
    pub fn usable_window(&self) -> u32 {
        (self.snd_wnd as u32).saturating_sub(self.in_flight())
    }

    /// `ack` acknowledges something new
    pub fn acks_new_data(&self, ack: u32) -> bool {
        seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt)
    }

    /// RST acceptance in synchronized states: seq within the receive window
    pub fn rst_in_window(&self, seq: u32) -> bool {
        let wnd = self.rcv_wnd() as u32;
        seq_ge(seq, self.rcv_nxt) && seq_le(seq, self.rcv_nxt.wrapping_add(wnd))
    }

    /// Our FIN has been sent and acknowledged
    pub fn fin_acked(&self) -> bool {
        self.fin_seq
            .is_some_and(|fin| seq_lt(fin, self.snd_una))
    }

    /// Drop every retransmission record covered by `snd_una`
    ///
    /// # Returns
    /// Whether any sequence space was released
    pub fn clear_acked(&mut self) -> bool {
        let mut progress = false;
        while let Some(front) = self.retransmit_queue.front_mut() {
            if seq_le(front.end(), self.snd_una) {
                self.retransmit_queue.pop_front();
                progress = true;
            } else if seq_lt(front.seq, self.snd_una) && !front.flags.contains(TcpFlags::SYN) {
                // Partially acknowledged data segment
                let covered = self.snd_una.wrapping_sub(front.seq) as usize;
                front.data.drain(..covered.min(front.data.len()));
                front.seq = self.snd_una;
                progress = true;
                break;
            } else {
                break;
            }
        }
        progress
    }

    pub fn is_listener(&self) -> bool {
        self.backlog.is_some()
    }
}
