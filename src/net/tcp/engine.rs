//! Connection table and segment processing
//!
//! The engine owns every control block, the listener table, the TCP port
//! registry and the retransmission, TIME_WAIT and FIN_WAIT_2 timers. It
//! never touches a device directly; outbound segments go through an
//! [`IpTransmit`].

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::net::{Ipv4Addr, SocketAddrV4};
use core::time::Duration;
use log::{debug, info, trace, warn};

use super::segment::{TcpFlags, TcpSegment, seq_ge, seq_gt};
use super::state::{TcpEvent, TcpState};
use super::tcb::{Backlog, Owner, Tcb, Unacked};
use super::{ConnId, TcpError, TcpInfo, TcpStats};
use crate::net::config::TcpConfig;
use crate::net::error::{NetError, SocketError};
use crate::net::ipv4::{IpProtocol, IpTransmit};
use crate::net::socket::{PortRegistry, Received};
use crate::net::timer::{Instant, TimerWheel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpTimer {
    Retransmit(ConnId),
    TimeWait(ConnId),
    FinWait2(ConnId),
}

/// What happens to a control block after it has been processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Keep,
    Destroy,
}

/// Per-stack TCP state
pub struct TcpEngine {
    conns: BTreeMap<ConnId, Tcb>,
    /// (local, remote) -> connection, for demultiplexing
    by_tuple: BTreeMap<(SocketAddrV4, SocketAddrV4), ConnId>,
    listeners: BTreeMap<u16, ConnId>,
    ports: PortRegistry,
    timers: TimerWheel<TcpTimer>,
    /// Why a still-open handle lost its connection
    aborted: BTreeMap<ConnId, SocketError>,
    /// Handles whose readiness changed since the last `take_ready`
    ready: BTreeSet<ConnId>,
    config: TcpConfig,
    now: Instant,
    next_id: u32,
    /// Connections opened so far, mixed into the ISN
    opened: u32,
    stats: TcpStats,
}

impl TcpEngine {
    pub fn new(config: TcpConfig, tick: Duration) -> Self {
        Self {
            conns: BTreeMap::new(),
            by_tuple: BTreeMap::new(),
            listeners: BTreeMap::new(),
            ports: PortRegistry::new(),
            timers: TimerWheel::new(tick),
            aborted: BTreeMap::new(),
            ready: BTreeSet::new(),
            config,
            now: Instant::ZERO,
            next_id: 0,
            opened: 0,
            stats: TcpStats::default(),
        }
    }

    pub fn config(&self) -> &TcpConfig {
        &self.config
    }

    pub fn stats(&self) -> TcpStats {
        self.stats
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Active open towards `remote` from an ephemeral port
    ///
    /// The SYN is sent before this returns; the connection is usable once
    /// [`connected`](Self::connected) reports `true`.
    pub fn connect(
        &mut self,
        remote: SocketAddrV4,
        ip: &mut impl IpTransmit,
    ) -> Result<ConnId, SocketError> {
        let port = self.ports.bind(0)?;
        let local = SocketAddrV4::new(ip.local_ip(), port);
        let id = self.alloc_id();

        let mut tcb = self.new_tcb(local, remote, Owner::User);
        tcb.owns_port = true;
        self.init_send_sequence(&mut tcb);
        Self::transition(id, &mut tcb, TcpEvent::ActiveOpen);

        info!("TCP: {} connecting {} -> {}", id, local, remote);
        if let Err(err) = self.send_tracked(id, &mut tcb, TcpFlags::SYN, Vec::new(), ip) {
            warn!("TCP: {} SYN to {} failed: {}", id, remote, err);
            self.destroy(id, tcb);
            return Err(err.into());
        }

        self.by_tuple.insert((local, remote), id);
        self.conns.insert(id, tcb);
        Ok(id)
    }

    /// Passive open on `port` (0 = ephemeral)
    ///
    /// A `backlog` of zero uses the configured default.
    pub fn listen(
        &mut self,
        port: u16,
        backlog: usize,
        ip: &impl IpTransmit,
    ) -> Result<ConnId, SocketError> {
        let port = self.ports.bind(port)?;
        let id = self.alloc_id();
        let local = SocketAddrV4::new(ip.local_ip(), port);

        let mut tcb = self.new_tcb(local, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), Owner::User);
        tcb.owns_port = true;
        let limit = if backlog == 0 {
            self.config.default_backlog
        } else {
            backlog
        };
        tcb.backlog = Some(Backlog::new(limit));
        Self::transition(id, &mut tcb, TcpEvent::PassiveOpen);

        info!("TCP: {} listening on port {} (backlog {})", id, port, limit);
        self.listeners.insert(port, id);
        self.conns.insert(id, tcb);
        Ok(id)
    }

    /// Take the oldest established connection off a listener's backlog
    pub fn accept(&mut self, listener: ConnId) -> Result<Option<ConnId>, SocketError> {
        let tcb = user_entry(&mut self.conns, &self.aborted, listener)?;
        let backlog = tcb.backlog.as_mut().ok_or(SocketError::InvalidState)?;

        let Some(child) = backlog.ready.pop_front() else {
            return Ok(None);
        };
        if let Some(child_tcb) = self.conns.get_mut(&child) {
            child_tcb.owner = Owner::User;
            debug!("TCP: {} accepted {} from {}", listener, child, child_tcb.remote);
        }
        Ok(Some(child))
    }

    /// Queue `data` for transmission
    ///
    /// # Returns
    /// Bytes accepted into the send buffer; fewer than `data.len()` when
    /// the buffer fills up
    pub fn send(
        &mut self,
        id: ConnId,
        data: &[u8],
        ip: &mut impl IpTransmit,
    ) -> Result<usize, SocketError> {
        let tcb = user_entry(&mut self.conns, &self.aborted, id)?;
        if tcb.is_listener() {
            return Err(SocketError::InvalidState);
        }
        if !tcb.state.can_send() {
            return Err(SocketError::NotConnected);
        }

        let room = tcb.send_capacity.saturating_sub(tcb.send_buffer.len());
        let accepted = room.min(data.len());
        if accepted == 0 && !data.is_empty() {
            return Err(SocketError::BufferFull);
        }
        tcb.send_buffer.extend(&data[..accepted]);

        let Some(mut tcb) = self.conns.remove(&id) else {
            return Err(SocketError::InvalidHandle);
        };
        // Accepted bytes are owned by the connection now; a failed transmit
        // is recovered by the retransmission timer
        if let Err(err) = self.output(id, &mut tcb, ip) {
            debug!("TCP: {} transmit failed: {}", id, err);
        }
        self.conns.insert(id, tcb);
        Ok(accepted)
    }

    /// Read up to `max_len` bytes
    ///
    /// # Returns
    /// * `Some(Received::Data)` - buffered bytes, in order
    /// * `Some(Received::Eof)` - the peer closed and everything was read
    /// * `None` - nothing to read yet
    pub fn recv(
        &mut self,
        id: ConnId,
        max_len: usize,
        ip: &mut impl IpTransmit,
    ) -> Result<Option<Received>, SocketError> {
        let tcb = user_entry(&mut self.conns, &self.aborted, id)?;
        if tcb.is_listener() {
            return Err(SocketError::InvalidState);
        }

        if !tcb.recv_buffer.is_empty() && max_len > 0 {
            let len = max_len.min(tcb.recv_buffer.len());
            let data: Vec<u8> = tcb.recv_buffer.drain(..len).collect();

            // Reading reopened a closed window; tell the peer
            if tcb.adv_wnd == 0 && tcb.rcv_wnd() > 0 && tcb.state.is_synchronized() {
                trace!("TCP: {} window update {}", id, tcb.rcv_wnd());
                let seq = tcb.snd_nxt;
                if let Err(err) = emit(&mut self.stats, tcb, TcpFlags::ACK, seq, Vec::new(), ip) {
                    debug!("TCP: {} window update failed: {}", id, err);
                }
            }
            return Ok(Some(Received::Data(data)));
        }

        if tcb.fin_received {
            return Ok(Some(Received::Eof));
        }
        Ok(None)
    }

    /// Release a handle
    ///
    /// Established connections go through the FIN handshake in the
    /// background; the handle is invalid as soon as this returns.
    pub fn close(&mut self, id: ConnId, ip: &mut impl IpTransmit) -> Result<(), SocketError> {
        self.ready.remove(&id);
        if self.aborted.remove(&id).is_some() {
            return Ok(());
        }

        let Some(mut tcb) = self.conns.remove(&id) else {
            return Err(SocketError::InvalidHandle);
        };
        if tcb.owner != Owner::User {
            self.conns.insert(id, tcb);
            return Err(SocketError::InvalidHandle);
        }

        match tcb.state {
            TcpState::Listen => {
                self.close_listener(id, tcb, ip);
            }
            TcpState::SynSent => {
                Self::transition(id, &mut tcb, TcpEvent::Close);
                self.destroy(id, tcb);
            }
            TcpState::SynReceived => {
                let seq = tcb.snd_nxt;
                self.stats.resets_sent += 1;
                if let Err(err) = emit(&mut self.stats, &mut tcb, TcpFlags::RST, seq, Vec::new(), ip) {
                    debug!("TCP: {} RST failed: {}", id, err);
                }
                Self::transition(id, &mut tcb, TcpEvent::Close);
                self.destroy(id, tcb);
            }
            TcpState::Established | TcpState::CloseWait => {
                // Unsent data is discarded; what is in flight is still retransmitted
                tcb.send_buffer.clear();
                tcb.recv_buffer.clear();
                tcb.owner = Owner::Orphan;
                Self::transition(id, &mut tcb, TcpEvent::Close);

                tcb.fin_seq = Some(tcb.snd_nxt);
                let flags = TcpFlags::FIN | TcpFlags::ACK;
                if let Err(err) = self.send_tracked(id, &mut tcb, flags, Vec::new(), ip) {
                    debug!("TCP: {} FIN deferred to retransmission: {}", id, err);
                }
                self.conns.insert(id, tcb);
            }
            _ => {
                self.conns.insert(id, tcb);
                return Err(SocketError::InvalidState);
            }
        }
        Ok(())
    }

    /// Data or EOF can be read without suspending
    pub fn readable(&self, id: ConnId) -> Result<bool, SocketError> {
        let tcb = self.user_tcb(id)?;
        if let Some(backlog) = &tcb.backlog {
            return Ok(!backlog.ready.is_empty());
        }
        Ok(!tcb.recv_buffer.is_empty() || tcb.fin_received)
    }

    /// Active open completed
    pub fn connected(&self, id: ConnId) -> Result<bool, SocketError> {
        let tcb = self.user_tcb(id)?;
        match tcb.state {
            TcpState::SynSent | TcpState::SynReceived => Ok(false),
            TcpState::Listen => Err(SocketError::InvalidState),
            _ => Ok(true),
        }
    }

    /// A listener has an established connection waiting
    pub fn acceptable(&self, listener: ConnId) -> Result<bool, SocketError> {
        let tcb = self.user_tcb(listener)?;
        tcb.backlog
            .as_ref()
            .map(|backlog| !backlog.ready.is_empty())
            .ok_or(SocketError::InvalidState)
    }

    /// Current state; unknown and destroyed connections report CLOSED
    pub fn state(&self, id: ConnId) -> TcpState {
        self.conns
            .get(&id)
            .map(|tcb| tcb.state)
            .unwrap_or(TcpState::Closed)
    }

    pub fn local_addr(&self, id: ConnId) -> Result<SocketAddrV4, SocketError> {
        self.user_tcb(id).map(|tcb| tcb.local)
    }

    pub fn remote_addr(&self, id: ConnId) -> Result<SocketAddrV4, SocketError> {
        self.user_tcb(id).map(|tcb| tcb.remote)
    }

    pub fn info(&self, id: ConnId) -> Option<TcpInfo> {
        self.conns.get(&id).map(|tcb| snapshot(id, tcb))
    }

    /// Every connection and listener, including orphans still closing
    pub fn connections(&self) -> Vec<TcpInfo> {
        self.conns
            .iter()
            .map(|(&id, tcb)| snapshot(id, tcb))
            .collect()
    }

    /// Handles that became readable, connected, acceptable or failed
    pub fn take_ready(&mut self) -> Vec<ConnId> {
        core::mem::take(&mut self.ready).into_iter().collect()
    }

    /// Handle an inbound segment addressed to `dest_ip`
    ///
    /// # Returns
    /// An error only for segments that failed to parse; they are dropped
    pub fn on_segment(
        &mut self,
        src_ip: Ipv4Addr,
        dest_ip: Ipv4Addr,
        data: &[u8],
        ip: &mut impl IpTransmit,
    ) -> Result<(), TcpError> {
        let segment = match TcpSegment::parse(data, src_ip, dest_ip) {
            Ok(segment) => segment,
            Err(err) => {
                match err {
                    TcpError::ChecksumMismatch => self.stats.checksum_errors += 1,
                    _ => self.stats.malformed += 1,
                }
                return Err(err);
            }
        };
        self.stats.segments_in += 1;

        let local = SocketAddrV4::new(dest_ip, segment.dest_port);
        let remote = SocketAddrV4::new(src_ip, segment.src_port);
        trace!(
            "TCP: {} -> {} [{:?}] seq={} ack={} len={}",
            remote,
            local,
            segment.flags,
            segment.seq,
            segment.ack,
            segment.data.len()
        );

        if let Some(&id) = self.by_tuple.get(&(local, remote)) {
            if let Some(tcb) = self.conns.remove(&id) {
                let fate = self.process(id, tcb, &segment, ip);
                trace!("TCP: {} segment processed ({:?})", id, fate);
            }
            return Ok(());
        }

        if let Some(&listener) = self.listeners.get(&segment.dest_port) {
            self.on_listen(listener, local, remote, &segment, ip);
            return Ok(());
        }

        debug!("TCP: no connection for {} -> {}", remote, local);
        self.reset_unknown(local, remote, &segment, ip);
        Ok(())
    }

    /// Advance the clock and fire due timers
    pub fn on_tick(&mut self, now: Instant, ip: &mut impl IpTransmit) {
        self.now = now;

        for (timer_id, timer) in self.timers.advance(now) {
            match timer {
                TcpTimer::Retransmit(id) => {
                    let Some(mut tcb) = self.conns.remove(&id) else {
                        continue;
                    };
                    if tcb.retransmit_timer != Some(timer_id) {
                        self.conns.insert(id, tcb);
                        continue;
                    }
                    tcb.retransmit_timer = None;
                    match self.on_retransmit_timeout(id, &mut tcb, ip) {
                        Fate::Keep => {
                            self.conns.insert(id, tcb);
                        }
                        Fate::Destroy => self.destroy(id, tcb),
                    }
                }
                TcpTimer::TimeWait(id) => {
                    let Some(mut tcb) = self.conns.remove(&id) else {
                        continue;
                    };
                    if tcb.time_wait_timer != Some(timer_id) {
                        self.conns.insert(id, tcb);
                        continue;
                    }
                    tcb.time_wait_timer = None;
                    Self::transition(id, &mut tcb, TcpEvent::Timeout);
                    self.destroy(id, tcb);
                }
                TcpTimer::FinWait2(id) => {
                    let Some(mut tcb) = self.conns.remove(&id) else {
                        continue;
                    };
                    if tcb.fin_wait2_timer != Some(timer_id) {
                        self.conns.insert(id, tcb);
                        continue;
                    }
                    tcb.fin_wait2_timer = None;
                    debug!("TCP: {} no FIN from {}, dropping connection", id, tcb.remote);
                    Self::transition(id, &mut tcb, TcpEvent::Abort);
                    self.destroy(id, tcb);
                }
            }
        }
    }

    fn alloc_id(&mut self) -> ConnId {
        let id = ConnId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    fn new_tcb(&self, local: SocketAddrV4, remote: SocketAddrV4, owner: Owner) -> Tcb {
        Tcb::new(
            local,
            remote,
            owner,
            self.config.mss,
            self.config.initial_rto,
            self.config.send_buffer,
            self.config.recv_buffer,
        )
    }

    /// Clock-driven initial sequence number
    fn init_send_sequence(&mut self, tcb: &mut Tcb) {
        let iss = self
            .config
            .isn_seed
            .wrapping_add((self.now.millis() as u32).wrapping_mul(250))
            .wrapping_add(self.opened.wrapping_mul(64_000));
        self.opened = self.opened.wrapping_add(1);

        tcb.iss = iss;
        tcb.snd_una = iss;
        tcb.snd_nxt = iss;
    }

    fn user_tcb(&self, id: ConnId) -> Result<&Tcb, SocketError> {
        if let Some(err) = self.aborted.get(&id) {
            return Err(*err);
        }
        match self.conns.get(&id) {
            Some(tcb) if tcb.owner == Owner::User => Ok(tcb),
            _ => Err(SocketError::InvalidHandle),
        }
    }

    fn transition(id: ConnId, tcb: &mut Tcb, event: TcpEvent) -> bool {
        match tcb.state.on_event(event) {
            Some(next) => {
                debug!("TCP: {} {} -> {} ({:?})", id, tcb.state, next, event);
                tcb.state = next;
                true
            }
            None => {
                warn!("TCP: {} ignoring {:?} in {}", id, event, tcb.state);
                false
            }
        }
    }

    /// Send a segment that occupies sequence space and keep it for retransmission
    fn send_tracked(
        &mut self,
        id: ConnId,
        tcb: &mut Tcb,
        flags: TcpFlags,
        data: Vec<u8>,
        ip: &mut impl IpTransmit,
    ) -> Result<(), NetError> {
        let seq = tcb.snd_nxt;
        let unacked = Unacked {
            seq,
            flags,
            data,
            sent_at: self.now,
        };
        tcb.snd_nxt = seq.wrapping_add(unacked.seq_len());
        let payload = unacked.data.clone();
        tcb.retransmit_queue.push_back(unacked);

        if tcb.retransmit_timer.is_none() {
            tcb.retransmit_timer = Some(
                self.timers
                    .schedule(TcpTimer::Retransmit(id), self.now + tcb.rto),
            );
        }
        emit(&mut self.stats, tcb, flags, seq, payload, ip)
    }

    /// Cancel the retransmission timer and re-arm it if anything is outstanding
    fn restart_retransmit(&mut self, id: ConnId, tcb: &mut Tcb) {
        if let Some(timer) = tcb.retransmit_timer.take() {
            self.timers.cancel(timer);
        }
        if !tcb.retransmit_queue.is_empty() {
            tcb.retransmit_timer = Some(
                self.timers
                    .schedule(TcpTimer::Retransmit(id), self.now + tcb.rto),
            );
        }
    }

    fn resend_oldest(&mut self, id: ConnId, tcb: &mut Tcb, ip: &mut impl IpTransmit) {
        let Some(front) = tcb.retransmit_queue.front_mut() else {
            return;
        };
        front.sent_at = self.now;
        let (flags, seq, data) = (front.flags, front.seq, front.data.clone());

        if let Err(err) = emit(&mut self.stats, tcb, flags, seq, data, ip) {
            debug!("TCP: {} retransmission failed: {}", id, err);
        }
    }

    fn send_ack(&mut self, id: ConnId, tcb: &mut Tcb, ip: &mut impl IpTransmit) {
        let seq = tcb.snd_nxt;
        if let Err(err) = emit(&mut self.stats, tcb, TcpFlags::ACK, seq, Vec::new(), ip) {
            debug!("TCP: {} ACK failed: {}", id, err);
        }
    }

    /// Segment buffered data into the usable window
    fn output(&mut self, id: ConnId, tcb: &mut Tcb, ip: &mut impl IpTransmit) -> Result<(), NetError> {
        if !matches!(tcb.state, TcpState::Established | TcpState::CloseWait) {
            return Ok(());
        }

        while !tcb.send_buffer.is_empty() {
            let window = tcb.usable_window() as usize;
            if window == 0 {
                trace!("TCP: {} peer window full, {} bytes waiting", id, tcb.send_buffer.len());
                break;
            }
            let len = window.min(tcb.mss as usize).min(tcb.send_buffer.len());
            let chunk: Vec<u8> = tcb.send_buffer.drain(..len).collect();
            self.send_tracked(id, tcb, TcpFlags::ACK | TcpFlags::PSH, chunk, ip)?;
        }
        Ok(())
    }

    fn enter_time_wait(&mut self, id: ConnId, tcb: &mut Tcb) {
        if let Some(timer) = tcb.retransmit_timer.take() {
            self.timers.cancel(timer);
        }
        if let Some(timer) = tcb.fin_wait2_timer.take() {
            self.timers.cancel(timer);
        }
        tcb.retransmit_queue.clear();
        self.restart_time_wait(id, tcb);
    }

    /// Nobody is left to close an orphan, so FIN_WAIT_2 is bounded
    fn enter_fin_wait2(&mut self, id: ConnId, tcb: &mut Tcb) {
        if tcb.owner != Owner::Orphan || tcb.fin_wait2_timer.is_some() {
            return;
        }
        tcb.fin_wait2_timer = Some(
            self.timers
                .schedule(TcpTimer::FinWait2(id), self.now + self.config.fin_wait2_timeout),
        );
    }

    fn restart_time_wait(&mut self, id: ConnId, tcb: &mut Tcb) {
        if let Some(timer) = tcb.time_wait_timer.take() {
            self.timers.cancel(timer);
        }
        tcb.time_wait_timer = Some(
            self.timers
                .schedule(TcpTimer::TimeWait(id), self.now + self.config.time_wait),
        );
    }

    /// Record why a connection died so the handle can report it
    fn fail(&mut self, id: ConnId, tcb: &Tcb, err: SocketError) -> Fate {
        info!("TCP: {} {} <-> {} failed: {}", id, tcb.local, tcb.remote, err);
        if tcb.owner == Owner::User {
            self.aborted.insert(id, err);
            self.ready.insert(id);
        }
        Fate::Destroy
    }

    /// Forget a control block and everything that refers to it
    fn destroy(&mut self, id: ConnId, tcb: Tcb) {
        if let Some(timer) = tcb.retransmit_timer {
            self.timers.cancel(timer);
        }
        if let Some(timer) = tcb.time_wait_timer {
            self.timers.cancel(timer);
        }
        if let Some(timer) = tcb.fin_wait2_timer {
            self.timers.cancel(timer);
        }

        let tuple = (tcb.local, tcb.remote);
        if self.by_tuple.get(&tuple) == Some(&id) {
            self.by_tuple.remove(&tuple);
        }
        if tcb.is_listener() && self.listeners.get(&tcb.local.port()) == Some(&id) {
            self.listeners.remove(&tcb.local.port());
        }
        if tcb.owns_port {
            self.ports.unbind(tcb.local.port());
        }
        if let Owner::Listener(parent) = tcb.owner {
            if let Some(backlog) = self
                .conns
                .get_mut(&parent)
                .and_then(|parent| parent.backlog.as_mut())
            {
                backlog.remove(id);
            }
        }
        debug!("TCP: {} released ({})", id, tcb.state);
    }

    fn close_listener(&mut self, id: ConnId, mut tcb: Tcb, ip: &mut impl IpTransmit) {
        let children: Vec<ConnId> = tcb
            .backlog
            .as_ref()
            .map(|backlog| {
                backlog
                    .embryonic
                    .iter()
                    .chain(backlog.ready.iter())
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        for child in children {
            let Some(mut child_tcb) = self.conns.remove(&child) else {
                continue;
            };
            let seq = child_tcb.snd_nxt;
            self.stats.resets_sent += 1;
            if let Err(err) = emit(&mut self.stats, &mut child_tcb, TcpFlags::RST, seq, Vec::new(), ip) {
                debug!("TCP: {} RST failed: {}", child, err);
            }
            Self::transition(child, &mut child_tcb, TcpEvent::Abort);
            self.destroy(child, child_tcb);
        }

        Self::transition(id, &mut tcb, TcpEvent::Close);
        info!("TCP: {} stopped listening on port {}", id, tcb.local.port());
        self.destroy(id, tcb);
    }

    /// Answer a segment that matches no connection or listener
    fn reset_unknown(
        &mut self,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        segment: &TcpSegment,
        ip: &mut impl IpTransmit,
    ) {
        if segment.has(TcpFlags::RST) {
            return;
        }

        let reply = if segment.has(TcpFlags::ACK) {
            TcpSegment::new(local.port(), remote.port(), segment.ack, 0, TcpFlags::RST)
        } else {
            TcpSegment::new(
                local.port(),
                remote.port(),
                0,
                segment.seq.wrapping_add(segment.seq_len()),
                TcpFlags::RST | TcpFlags::ACK,
            )
        };

        self.stats.resets_sent += 1;
        self.stats.segments_out += 1;
        let bytes = reply.build(*local.ip(), *remote.ip());
        if let Err(err) = ip.send_ipv4(*remote.ip(), IpProtocol::Tcp, bytes) {
            debug!("TCP: RST to {} failed: {}", remote, err);
        }
    }

    fn on_listen(
        &mut self,
        listener: ConnId,
        local: SocketAddrV4,
        remote: SocketAddrV4,
        segment: &TcpSegment,
        ip: &mut impl IpTransmit,
    ) {
        if segment.has(TcpFlags::RST) {
            return;
        }
        if segment.has(TcpFlags::ACK) {
            self.reset_unknown(local, remote, segment, ip);
            return;
        }
        if !segment.has(TcpFlags::SYN) {
            self.stats.dropped += 1;
            return;
        }

        let full = self
            .conns
            .get(&listener)
            .and_then(|tcb| tcb.backlog.as_ref())
            .is_none_or(Backlog::is_full);
        if full {
            self.stats.backlog_overflows += 1;
            debug!("TCP: {} backlog full, dropping SYN from {}", listener, remote);
            return;
        }

        let id = self.alloc_id();
        let mut child = self.new_tcb(local, remote, Owner::Listener(listener));
        child.irs = segment.seq;
        child.rcv_nxt = segment.seq.wrapping_add(1);
        child.snd_wnd = segment.window;
        self.init_send_sequence(&mut child);
        Self::transition(id, &mut child, TcpEvent::SynReceived);

        debug!("TCP: {} SYN from {} on {}", id, remote, listener);
        let flags = TcpFlags::SYN | TcpFlags::ACK;
        if let Err(err) = self.send_tracked(id, &mut child, flags, Vec::new(), ip) {
            debug!("TCP: {} SYN-ACK deferred to retransmission: {}", id, err);
        }

        if let Some(backlog) = self
            .conns
            .get_mut(&listener)
            .and_then(|tcb| tcb.backlog.as_mut())
        {
            backlog.embryonic.push(id);
        }
        self.by_tuple.insert((local, remote), id);
        self.conns.insert(id, child);
    }

    /// Process a segment for a connection taken out of the table
    fn process(
        &mut self,
        id: ConnId,
        mut tcb: Tcb,
        segment: &TcpSegment,
        ip: &mut impl IpTransmit,
    ) -> Fate {
        let fate = match tcb.state {
            TcpState::SynSent => self.process_syn_sent(id, &mut tcb, segment, ip),
            TcpState::Closed | TcpState::Listen => {
                self.stats.dropped += 1;
                Fate::Keep
            }
            _ => self.process_synchronized(id, &mut tcb, segment, ip),
        };

        match fate {
            Fate::Keep => {
                self.conns.insert(id, tcb);
            }
            Fate::Destroy => self.destroy(id, tcb),
        }
        fate
    }

    fn process_syn_sent(
        &mut self,
        id: ConnId,
        tcb: &mut Tcb,
        segment: &TcpSegment,
        ip: &mut impl IpTransmit,
    ) -> Fate {
        // Only our SYN is outstanding, so snd_nxt is the one acceptable ACK
        if segment.has(TcpFlags::ACK) && segment.ack != tcb.snd_nxt {
            self.stats.dropped += 1;
            self.reset_unknown(tcb.local, tcb.remote, segment, ip);
            return Fate::Keep;
        }

        if segment.has(TcpFlags::RST) {
            Self::transition(id, tcb, TcpEvent::RstReceived);
            return self.fail(id, tcb, SocketError::ConnectionRefused);
        }

        if !(segment.has(TcpFlags::SYN) && segment.has(TcpFlags::ACK)) {
            // Simultaneous open is not supported
            self.stats.dropped += 1;
            return Fate::Keep;
        }

        tcb.irs = segment.seq;
        tcb.rcv_nxt = segment.seq.wrapping_add(1);
        tcb.snd_una = segment.ack;
        tcb.snd_wnd = segment.window;
        tcb.clear_acked();
        tcb.rto = self.config.initial_rto;
        tcb.backoff = 0;
        self.restart_retransmit(id, tcb);

        Self::transition(id, tcb, TcpEvent::SynAckReceived);
        info!("TCP: {} established {} <-> {}", id, tcb.local, tcb.remote);
        self.ready.insert(id);

        self.send_ack(id, tcb, ip);
        if let Err(err) = self.output(id, tcb, ip) {
            debug!("TCP: {} output failed: {}", id, err);
        }
        Fate::Keep
    }

    fn process_synchronized(
        &mut self,
        id: ConnId,
        tcb: &mut Tcb,
        segment: &TcpSegment,
        ip: &mut impl IpTransmit,
    ) -> Fate {
        if segment.has(TcpFlags::RST) {
            if !tcb.rst_in_window(segment.seq) {
                self.stats.dropped += 1;
                return Fate::Keep;
            }
            let was_embryonic = tcb.state == TcpState::SynReceived;
            Self::transition(id, tcb, TcpEvent::RstReceived);
            if was_embryonic {
                // The listener keeps listening; only this child goes away
                debug!("TCP: {} reset by {} before completing", id, tcb.remote);
                return Fate::Destroy;
            }
            return self.fail(id, tcb, SocketError::ConnectionReset);
        }

        if segment.has(TcpFlags::SYN) {
            if tcb.state == TcpState::SynReceived && segment.seq == tcb.irs {
                // Peer never saw our SYN-ACK
                self.resend_oldest(id, tcb, ip);
            } else {
                self.send_ack(id, tcb, ip);
            }
            self.stats.dropped += 1;
            return Fate::Keep;
        }

        let has_text = !segment.data.is_empty() || segment.has(TcpFlags::FIN);
        if has_text && segment.seq != tcb.rcv_nxt {
            if tcb.state == TcpState::TimeWait && segment.has(TcpFlags::FIN) {
                self.restart_time_wait(id, tcb);
            }
            self.stats.dropped += 1;
            self.send_ack(id, tcb, ip);
            return Fate::Keep;
        }

        if !segment.has(TcpFlags::ACK) {
            self.stats.dropped += 1;
            return Fate::Keep;
        }

        if tcb.state == TcpState::SynReceived {
            if !tcb.acks_new_data(segment.ack) {
                self.stats.dropped += 1;
                self.reset_unknown(tcb.local, tcb.remote, segment, ip);
                return Fate::Keep;
            }
            Self::transition(id, tcb, TcpEvent::AckReceived);
            self.promote(id, tcb);
        }

        if seq_gt(segment.ack, tcb.snd_nxt) {
            // Acknowledges something we never sent
            self.stats.dropped += 1;
            self.send_ack(id, tcb, ip);
            return Fate::Keep;
        }

        if tcb.acks_new_data(segment.ack) {
            tcb.snd_una = segment.ack;
            tcb.clear_acked();
            tcb.rto = self.config.initial_rto;
            tcb.backoff = 0;
            self.restart_retransmit(id, tcb);
        }
        if seq_ge(segment.ack, tcb.snd_una) {
            tcb.snd_wnd = segment.window;
        }

        if tcb.fin_acked() {
            match tcb.state {
                TcpState::FinWait1 => {
                    Self::transition(id, tcb, TcpEvent::AckReceived);
                    self.enter_fin_wait2(id, tcb);
                }
                TcpState::Closing => {
                    Self::transition(id, tcb, TcpEvent::AckReceived);
                    self.enter_time_wait(id, tcb);
                }
                TcpState::LastAck => {
                    Self::transition(id, tcb, TcpEvent::AckReceived);
                    return Fate::Destroy;
                }
                _ => {}
            }
        }

        let mut ack_needed = false;
        let mut truncated = false;
        if !segment.data.is_empty() && tcb.state.can_receive() {
            let window = tcb.rcv_wnd() as usize;
            let accepted = window.min(segment.data.len());
            truncated = accepted < segment.data.len();

            if tcb.owner != Owner::Orphan {
                tcb.recv_buffer.extend(&segment.data[..accepted]);
            }
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(accepted as u32);
            if accepted > 0 && tcb.owner == Owner::User {
                self.ready.insert(id);
            }
            trace!("TCP: {} received {} bytes", id, accepted);
            ack_needed = true;
        }

        if segment.has(TcpFlags::FIN) && !truncated && tcb.state.is_synchronized() {
            tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
            tcb.fin_received = true;
            if Self::transition(id, tcb, TcpEvent::FinReceived) && tcb.state == TcpState::TimeWait {
                self.enter_time_wait(id, tcb);
            }
            if tcb.owner == Owner::User {
                self.ready.insert(id);
            }
            ack_needed = true;
        }

        if ack_needed {
            self.send_ack(id, tcb, ip);
        }
        if let Err(err) = self.output(id, tcb, ip) {
            debug!("TCP: {} output failed: {}", id, err);
        }
        Fate::Keep
    }

    /// Move an established child onto its listener's accept queue
    fn promote(&mut self, id: ConnId, tcb: &Tcb) {
        let Owner::Listener(parent) = tcb.owner else {
            return;
        };
        if let Some(backlog) = self
            .conns
            .get_mut(&parent)
            .and_then(|listener| listener.backlog.as_mut())
        {
            backlog.embryonic.retain(|&child| child != id);
            backlog.ready.push_back(id);
            self.ready.insert(parent);
            info!("TCP: {} established {} <-> {}", id, tcb.local, tcb.remote);
        }
    }

    fn on_retransmit_timeout(&mut self, id: ConnId, tcb: &mut Tcb, ip: &mut impl IpTransmit) -> Fate {
        if tcb.retransmit_queue.is_empty() {
            return Fate::Keep;
        }

        if tcb.backoff >= self.config.max_retries {
            warn!("TCP: {} gave up after {} retransmissions", id, tcb.backoff);
            self.stats.timeouts += 1;
            Self::transition(id, tcb, TcpEvent::Abort);
            return self.fail(id, tcb, SocketError::TimedOut);
        }

        tcb.backoff += 1;
        tcb.rto = (tcb.rto * 2).min(self.config.max_rto);
        self.stats.retransmissions += 1;
        debug!("TCP: {} retransmitting (attempt {}, next rto {:?})", id, tcb.backoff, tcb.rto);

        self.resend_oldest(id, tcb, ip);
        tcb.retransmit_timer = Some(
            self.timers
                .schedule(TcpTimer::Retransmit(id), self.now + tcb.rto),
        );
        Fate::Keep
    }
}

/// Look up a handle the application is allowed to use
fn user_entry<'a>(
    conns: &'a mut BTreeMap<ConnId, Tcb>,
    aborted: &BTreeMap<ConnId, SocketError>,
    id: ConnId,
) -> Result<&'a mut Tcb, SocketError> {
    if let Some(err) = aborted.get(&id) {
        return Err(*err);
    }
    match conns.get_mut(&id) {
        Some(tcb) if tcb.owner == Owner::User => Ok(tcb),
        _ => Err(SocketError::InvalidHandle),
    }
}

/// Build and transmit one segment from a connection's current state
fn emit(
    stats: &mut TcpStats,
    tcb: &mut Tcb,
    flags: TcpFlags,
    seq: u32,
    data: Vec<u8>,
    ip: &mut impl IpTransmit,
) -> Result<(), NetError> {
    let ack = if flags.contains(TcpFlags::ACK) {
        tcb.rcv_nxt
    } else {
        0
    };
    let mut segment = TcpSegment::new(tcb.local.port(), tcb.remote.port(), seq, ack, flags);
    segment.window = tcb.rcv_wnd();
    segment.data = data;
    tcb.adv_wnd = segment.window;

    stats.segments_out += 1;
    let bytes = segment.build(*tcb.local.ip(), *tcb.remote.ip());
    ip.send_ipv4(*tcb.remote.ip(), IpProtocol::Tcp, bytes)
}

fn snapshot(id: ConnId, tcb: &Tcb) -> TcpInfo {
    TcpInfo {
        id,
        local: tcb.local,
        remote: tcb.remote,
        state: tcb.state,
        snd_una: tcb.snd_una,
        snd_nxt: tcb.snd_nxt,
        snd_wnd: tcb.snd_wnd,
        rcv_nxt: tcb.rcv_nxt,
        rcv_wnd: tcb.rcv_wnd(),
        rto: tcb.rto,
        backoff: tcb.backoff,
        unacked: tcb.retransmit_queue.len(),
        send_buffered: tcb.send_buffer.len(),
        recv_buffered: tcb.recv_buffer.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    /// Captures outbound segments instead of sending them
    #[derive(Default)]
    struct MockIp {
        sent: Vec<(Ipv4Addr, Vec<u8>)>,
    }

    impl IpTransmit for MockIp {
        fn local_ip(&self) -> Ipv4Addr {
            LOCAL
        }

        fn send_ipv4(
            &mut self,
            dest: Ipv4Addr,
            _protocol: IpProtocol,
            payload: Vec<u8>,
        ) -> Result<(), NetError> {
            self.sent.push((dest, payload));
            Ok(())
        }
    }

    impl MockIp {
        fn take(&mut self) -> Vec<TcpSegment> {
            self.sent
                .drain(..)
                .map(|(dest, bytes)| TcpSegment::parse(&bytes, LOCAL, dest).unwrap())
                .collect()
        }
    }

    fn engine() -> TcpEngine {
        let config = TcpConfig {
            isn_seed: 100,
            ..TcpConfig::default()
        };
        TcpEngine::new(config, Duration::from_millis(10))
    }

    fn deliver(engine: &mut TcpEngine, ip: &mut MockIp, segment: TcpSegment) {
        let bytes = segment.build(PEER, LOCAL);
        engine.on_segment(PEER, LOCAL, &bytes, ip).unwrap();
    }

    fn from_peer(src: u16, dst: u16, seq: u32, ack: u32, flags: TcpFlags) -> TcpSegment {
        let mut segment = TcpSegment::new(src, dst, seq, ack, flags);
        segment.window = 4096;
        segment
    }

    fn established(engine: &mut TcpEngine, ip: &mut MockIp) -> (ConnId, u16) {
        let id = engine.connect(SocketAddrV4::new(PEER, 80), ip).unwrap();
        let syn = ip.take().remove(0);
        let port = syn.src_port;
        deliver(
            engine,
            ip,
            from_peer(80, port, 500, syn.seq + 1, TcpFlags::SYN | TcpFlags::ACK),
        );
        ip.take();
        (id, port)
    }

    #[test]
    fn test_active_open_handshake() {
        let mut engine = engine();
        let mut ip = MockIp::default();

        let id = engine.connect(SocketAddrV4::new(PEER, 80), &mut ip).unwrap();
        assert_eq!(engine.state(id), TcpState::SynSent);
        let syn = ip.take().remove(0);
        assert_eq!(syn.flags, TcpFlags::SYN);
        assert_eq!(syn.seq, 100);

        deliver(
            &mut engine,
            &mut ip,
            from_peer(80, syn.src_port, 500, 101, TcpFlags::SYN | TcpFlags::ACK),
        );
        assert_eq!(engine.state(id), TcpState::Established);
        assert_eq!(engine.connected(id), Ok(true));

        let ack = ip.take().remove(0);
        assert_eq!(ack.flags, TcpFlags::ACK);
        assert_eq!((ack.seq, ack.ack), (101, 501));
        assert_eq!(engine.take_ready(), vec![id]);
    }

    #[test]
    fn test_rst_in_syn_sent_refuses() {
        let mut engine = engine();
        let mut ip = MockIp::default();
        let id = engine.connect(SocketAddrV4::new(PEER, 80), &mut ip).unwrap();
        let syn = ip.take().remove(0);

        deliver(
            &mut engine,
            &mut ip,
            from_peer(80, syn.src_port, 0, 101, TcpFlags::RST | TcpFlags::ACK),
        );
        assert_eq!(engine.state(id), TcpState::Closed);
        assert_eq!(engine.connected(id), Err(SocketError::ConnectionRefused));
        assert_eq!(engine.close(id, &mut ip), Ok(()));
        assert_eq!(engine.connected(id), Err(SocketError::InvalidHandle));
    }

    #[test]
    fn test_retransmission_backs_off_and_stops_on_ack() {
        let mut engine = engine();
        let mut ip = MockIp::default();
        let (id, port) = established(&mut engine, &mut ip);

        assert_eq!(engine.send(id, b"hello", &mut ip), Ok(5));
        let data = ip.take().remove(0);
        assert_eq!(data.data, b"hello".to_vec());

        engine.on_tick(Instant::from_millis(999), &mut ip);
        assert!(ip.take().is_empty());
        engine.on_tick(Instant::from_millis(1000), &mut ip);
        let again = ip.take();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].seq, data.seq);
        assert_eq!(engine.info(id).unwrap().rto, Duration::from_secs(2));

        deliver(
            &mut engine,
            &mut ip,
            from_peer(80, port, 501, data.seq + 5, TcpFlags::ACK),
        );
        let info = engine.info(id).unwrap();
        assert_eq!(info.unacked, 0);
        assert_eq!(info.backoff, 0);

        engine.on_tick(Instant::from_millis(10_000), &mut ip);
        assert!(ip.take().is_empty());
    }

    #[test]
    fn test_retries_exhausted_times_out() {
        let mut engine = engine();
        let mut ip = MockIp::default();
        let id = engine.connect(SocketAddrV4::new(PEER, 80), &mut ip).unwrap();

        let mut now = 0;
        for _ in 0..=engine.config().max_retries {
            now += engine.info(id).unwrap().rto.as_millis() as u64;
            engine.on_tick(Instant::from_millis(now), &mut ip);
        }
        assert_eq!(engine.state(id), TcpState::Closed);
        assert_eq!(engine.connected(id), Err(SocketError::TimedOut));
        assert_eq!(engine.stats().timeouts, 1);
    }

    #[test]
    fn test_passive_open_and_accept() {
        let mut engine = engine();
        let mut ip = MockIp::default();
        let listener = engine.listen(8080, 2, &ip).unwrap();

        deliver(&mut engine, &mut ip, from_peer(5000, 8080, 7000, 0, TcpFlags::SYN));
        let syn_ack = ip.take().remove(0);
        assert_eq!(syn_ack.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(syn_ack.ack, 7001);
        assert_eq!(engine.accept(listener), Ok(None));

        deliver(
            &mut engine,
            &mut ip,
            from_peer(5000, 8080, 7001, syn_ack.seq + 1, TcpFlags::ACK),
        );
        assert_eq!(engine.acceptable(listener), Ok(true));
        let child = engine.accept(listener).unwrap().unwrap();
        assert_eq!(engine.state(child), TcpState::Established);
        assert_eq!(
            engine.remote_addr(child),
            Ok(SocketAddrV4::new(PEER, 5000))
        );
        assert_eq!(engine.state(listener), TcpState::Listen);
    }

    #[test]
    fn test_backlog_overflow_drops_syn() {
        let mut engine = engine();
        let mut ip = MockIp::default();
        engine.listen(8080, 1, &ip).unwrap();

        deliver(&mut engine, &mut ip, from_peer(5000, 8080, 1, 0, TcpFlags::SYN));
        deliver(&mut engine, &mut ip, from_peer(5001, 8080, 1, 0, TcpFlags::SYN));
        assert_eq!(ip.take().len(), 1);
        assert_eq!(engine.stats().backlog_overflows, 1);
    }

    #[test]
    fn test_unknown_port_gets_reset() {
        let mut engine = engine();
        let mut ip = MockIp::default();

        deliver(&mut engine, &mut ip, from_peer(5000, 9, 41, 0, TcpFlags::SYN));
        let rst = ip.take().remove(0);
        assert_eq!(rst.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!((rst.seq, rst.ack), (0, 42));

        deliver(&mut engine, &mut ip, from_peer(5000, 9, 41, 77, TcpFlags::ACK));
        let rst = ip.take().remove(0);
        assert_eq!(rst.flags, TcpFlags::RST);
        assert_eq!(rst.seq, 77);

        deliver(&mut engine, &mut ip, from_peer(5000, 9, 41, 0, TcpFlags::RST));
        assert!(ip.take().is_empty());
    }

    #[test]
    fn test_fin_then_eof() {
        let mut engine = engine();
        let mut ip = MockIp::default();
        let (id, port) = established(&mut engine, &mut ip);

        let mut data = from_peer(80, port, 501, 101, TcpFlags::ACK | TcpFlags::PSH | TcpFlags::FIN);
        data.data = b"bye".to_vec();
        deliver(&mut engine, &mut ip, data);

        assert_eq!(engine.state(id), TcpState::CloseWait);
        let ack = ip.take().remove(0);
        assert_eq!(ack.ack, 501 + 3 + 1);

        assert_eq!(
            engine.recv(id, 100, &mut ip),
            Ok(Some(Received::Data(b"bye".to_vec())))
        );
        assert_eq!(engine.recv(id, 100, &mut ip), Ok(Some(Received::Eof)));
    }

    #[test]
    fn test_out_of_order_segment_is_dropped() {
        let mut engine = engine();
        let mut ip = MockIp::default();
        let (id, port) = established(&mut engine, &mut ip);

        let mut future = from_peer(80, port, 510, 101, TcpFlags::ACK);
        future.data = vec![1, 2, 3];
        deliver(&mut engine, &mut ip, future);

        assert_eq!(engine.readable(id), Ok(false));
        let ack = ip.take().remove(0);
        assert_eq!(ack.ack, 501);
    }

    #[test]
    fn test_send_respects_peer_window() {
        let mut engine = engine();
        let mut ip = MockIp::default();
        let id = engine.connect(SocketAddrV4::new(PEER, 80), &mut ip).unwrap();
        let syn = ip.take().remove(0);
        let mut syn_ack = from_peer(80, syn.src_port, 500, 101, TcpFlags::SYN | TcpFlags::ACK);
        syn_ack.window = 4;
        deliver(&mut engine, &mut ip, syn_ack);
        ip.take();

        assert_eq!(engine.send(id, b"abcdefgh", &mut ip), Ok(8));
        let sent = ip.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, b"abcd".to_vec());
        assert_eq!(engine.info(id).unwrap().send_buffered, 4);

        deliver(
            &mut engine,
            &mut ip,
            from_peer(80, syn.src_port, 501, 105, TcpFlags::ACK),
        );
        let sent = ip.take();
        assert_eq!(sent[0].data, b"efgh".to_vec());
    }

    #[test]
    fn test_active_close_reaches_time_wait_then_closed() {
        let mut engine = engine();
        let mut ip = MockIp::default();
        let (id, port) = established(&mut engine, &mut ip);

        engine.close(id, &mut ip).unwrap();
        let fin = ip.take().remove(0);
        assert!(fin.has(TcpFlags::FIN));
        assert_eq!(engine.state(id), TcpState::FinWait1);

        deliver(&mut engine, &mut ip, from_peer(80, port, 501, fin.seq + 1, TcpFlags::ACK));
        assert_eq!(engine.state(id), TcpState::FinWait2);

        deliver(
            &mut engine,
            &mut ip,
            from_peer(80, port, 501, fin.seq + 1, TcpFlags::FIN | TcpFlags::ACK),
        );
        assert_eq!(engine.state(id), TcpState::TimeWait);

        engine.on_tick(Instant::from_millis(60_000), &mut ip);
        assert_eq!(engine.state(id), TcpState::Closed);
        assert!(engine.connections().is_empty());
    }
}
