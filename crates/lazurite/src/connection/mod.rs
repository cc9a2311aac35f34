//! The per-connection data-plane engine: packet number management, ACK
//! bookkeeping, loss detection, congestion control, the stream and message
//! reassemblers, and the sender scheduler.
//!
//! All mutable state lives in [`ConnState`] behind a single mutex that is
//! never held across an await point. A driver task owns the send side: it
//! sleeps until woken by API calls or inbound packets, or until the next
//! loss-detection or delayed-ACK deadline.

mod input;
mod output;

use crate::error::{Error, Result};
use crate::mux::MuxShared;
use crate::protocol::{ConnId, MAX_PACKET_SIZE};
use crate::recovery::{CongestionController, MsgReassembler, RttFilter, StreamReassembler};
use crate::protocol::packet_number::{PacketNumber, PacketNumberRanges};
use crate::sec::TransportAead;
use bytes::Bytes;
use lazuli_binary::MAX_VARINT;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};

/// How many received packet number ranges are kept track of; older ranges
/// fall off the tail.
pub(crate) const MAX_RCVD_PACKET_NUMBER_RANGE_COUNT: usize = 8;

pub(crate) const MAX_ACKED_PACKET_NUMBER_RANGE_COUNT: usize = MAX_RCVD_PACKET_NUMBER_RANGE_COUNT;

/// Maximum timeout backoff, in powers of two.
const MAX_TIMEOUT_BACKOFF: u32 = 5;

/// How often a migration probe can be sent, per connection.
pub(crate) const MIN_MIGRATION_PROBE_INTERVAL: Duration = Duration::from_millis(333);

/// Debugging: disables nack-based loss detection.
pub(crate) const NO_NACKS: bool = false;

/// Debugging: disables a STREAM frame acking our advertised window up to
/// the end of the received data.
pub(crate) const NO_STREAM_OFF_IMPLICIT_ACK: bool = false;

/// A fragment of the outbound reliable stream: borrowed cheaply from the
/// buffer the user's write was copied into.
#[derive(Debug, Clone)]
pub(crate) struct StreamFragment {
    pub data: Bytes,
    pub off: u64,
}

impl StreamFragment {
    /// Carves off the first `i` bytes as a new fragment; `self` becomes
    /// the tail.
    pub fn split_to(&mut self, i: usize) -> StreamFragment {
        let head = StreamFragment { data: self.data.split_to(i), off: self.off };
        self.off += i as u64;
        head
    }
}

/// A sent, not-yet-acknowledged packet. Only ack-eliciting packets are
/// tracked.
#[derive(Debug)]
pub(crate) struct InFlightPacket {
    /// Highest received packet number this packet acknowledged, or -1.
    pub max_pn_acks: PacketNumber,
    /// Stream-data limit this packet advertised, or 0.
    pub max_stream_off: u64,
    pub stream_fragments: Vec<StreamFragment>,
    pub contains_msg: bool,
    /// Migration probe target, if this packet probed one.
    pub probe_addr: Option<SocketAddr>,
    pub sent: Instant,
    /// Bytes on the wire.
    pub size: usize,
}

impl InFlightPacket {
    fn new(now: Instant) -> Self {
        Self {
            max_pn_acks: -1,
            max_stream_off: 0,
            stream_fragments: Vec::new(),
            contains_msg: false,
            probe_addr: None,
            sent: now,
            size: 0,
        }
    }

    pub fn ack_eliciting(&self) -> bool {
        self.max_stream_off > 0
            || !self.stream_fragments.is_empty()
            || self.contains_msg
            || self.probe_addr.is_some()
    }
}

#[derive(Debug, Default)]
pub(crate) struct ConnStats {
    pub bytes_rcvd: u64,
    pub stream_bytes_read: u64,
    pub msg_bytes_read: u64,
    pub msg_bytes_rcvd: u64,
    pub bytes_sent: u64,
    pub bytes_nacked: u64,
    pub bytes_timed_out: u64,
    pub tail_acks_sent: u64,
    pub stream_bytes_written: u64,
    pub msg_bytes_written: u64,
}

impl ConnStats {
    fn log_summary(&self, id: ConnId) {
        let bytes_acked = self.bytes_sent.saturating_sub(self.bytes_nacked + self.bytes_timed_out);
        debug!(
            "[{id}] closed: rcvd={} sent={} acked={} nacked={} timed_out={} tail_acks={}",
            self.bytes_rcvd,
            self.bytes_sent,
            bytes_acked,
            self.bytes_nacked,
            self.bytes_timed_out,
            self.tail_acks_sent,
        );
        debug!(
            "[{id}] stream read/written={}/{} msg read/rcvd/written={}/{}/{}",
            self.stream_bytes_read,
            self.stream_bytes_written,
            self.msg_bytes_read,
            self.msg_bytes_rcvd,
            self.msg_bytes_written,
        );
        if bytes_acked > 0 {
            let payload = (self.stream_bytes_written + self.msg_bytes_written) as f64;
            debug!(
                "[{id}] overhead {:.2}% loss {:.2}%",
                100.0 * (1.0 - payload / bytes_acked as f64),
                100.0 * (self.bytes_nacked + self.bytes_timed_out) as f64 / bytes_acked as f64,
            );
        }
    }
}

pub(crate) struct ConnState {
    /// `Some` once the connection is closed, with the error every
    /// subsequent user-facing call reports.
    pub closed: Option<Error>,

    pub recv_aead: TransportAead,
    pub send_aead: TransportAead,

    /// Packet number counter.
    pub seq: PacketNumber,
    /// Maximum packet number that the peer acked.
    pub max_pn_acked: PacketNumber,
    /// The last several received packet number ranges.
    pub max_rcvd_pn_ranges: PacketNumberRanges,
    /// When the newest entry of `max_rcvd_pn_ranges` was received.
    pub max_rcvd_pn_rcv_time: Instant,
    /// Sent ack-eliciting packets, neither acked nor declared lost yet.
    pub in_flight_packets: HashMap<PacketNumber, InFlightPacket>,
    /// Sum of the sizes of `in_flight_packets`.
    pub in_flight_bytes: usize,

    pub congestion: CongestionController,
    pub rtt: RttFilter,

    pub timeout_backoff: u32,
    /// When time-based loss detection fires.
    pub timeout: Option<Instant>,

    pub send_ack_by: Option<Instant>,
    pub sent_tail_ack: bool,

    pub stream_reassembler: StreamReassembler,
    /// Max stream offset the peer has acknowledged learning.
    pub max_stream_off_acked: u64,
    pub max_stream_off_in_flight: u64,

    /// Outbound stream data not yet sent (or returned here by loss).
    pub stream_fragments: VecDeque<StreamFragment>,
    pub stream_off: u64,
    /// The peer's advertised stream window.
    pub max_stream_off: u64,
    /// Stream payload bytes in flight plus pending, bounded by
    /// `Config::max_stream_bytes_in_flight`.
    pub stream_bytes_in_flight: usize,

    pub msg_reassembler: MsgReassembler,
    pub msg_rcvd_seq: i64,

    /// Remaining tail of the pending outbound message.
    pub msg_data: Bytes,
    pub msg_seq: u64,
    pub msg_continued: bool,

    pub migration_addr: Option<SocketAddr>,
    pub migration_probe_cooldown: Instant,

    pub raddr: SocketAddr,

    pub stats: ConnStats,
}

pub(crate) struct ConnInner {
    pub mux: Arc<MuxShared>,
    pub id: ConnId,
    pub state: Mutex<ConnState>,

    /// Edge-triggered, coalesced ready signals: the driver posts with
    /// `notify_one` (at most one stored permit), blocked API calls wait.
    pub rel_rcv_ready: Notify,
    pub rel_snd_ready: Notify,
    pub unrel_rcv_ready: Notify,
    /// One pending outbound message at a time: writers take the permit,
    /// the sender scheduler returns it with the final segment.
    pub unrel_snd_sem: Semaphore,
    /// Wakes the driver task.
    pub wakeup: Notify,
    /// Fired once, on close.
    pub closed_notify: Notify,
}

impl ConnInner {
    pub fn new(
        mux: Arc<MuxShared>,
        id: ConnId,
        recv_aead: TransportAead,
        send_aead: TransportAead,
        raddr: SocketAddr,
    ) -> Arc<Self> {
        let now = Instant::now();
        let stream_receive_window = mux.config.stream_receive_window;
        Arc::new(Self {
            mux,
            id,
            state: Mutex::new(ConnState {
                closed: None,
                recv_aead,
                send_aead,
                seq: rand::random_range(0..3),
                max_pn_acked: -1,
                max_rcvd_pn_ranges: PacketNumberRanges::default(),
                max_rcvd_pn_rcv_time: now,
                in_flight_packets: HashMap::new(),
                in_flight_bytes: 0,
                congestion: CongestionController::new(now),
                rtt: RttFilter::new(),
                timeout_backoff: 0,
                timeout: None,
                send_ack_by: None,
                sent_tail_ack: false,
                stream_reassembler: StreamReassembler::new(stream_receive_window),
                max_stream_off_acked: 0,
                max_stream_off_in_flight: 0,
                stream_fragments: VecDeque::new(),
                stream_off: 0,
                max_stream_off: 0,
                stream_bytes_in_flight: 0,
                msg_reassembler: MsgReassembler::new(0),
                msg_rcvd_seq: -2,
                msg_data: Bytes::new(),
                msg_seq: rand::random_range(0..3),
                msg_continued: false,
                migration_addr: None,
                migration_probe_cooldown: now,
                raddr,
                stats: ConnStats::default(),
            }),
            rel_rcv_ready: Notify::new(),
            rel_snd_ready: Notify::new(),
            unrel_rcv_ready: Notify::new(),
            unrel_snd_sem: Semaphore::new(1),
            wakeup: Notify::new(),
            closed_notify: Notify::new(),
        })
    }

    /// Starts the driver task and the mux-shutdown watcher.
    pub fn spawn(self: &Arc<Self>) {
        let conn = self.clone();
        tokio::spawn(async move {
            let mux = conn.mux.clone();
            let mut mux_closed = pin!(mux.closed_notify.notified());
            mux_closed.as_mut().enable();
            let mut conn_closed = pin!(conn.closed_notify.notified());
            conn_closed.as_mut().enable();

            if conn.close_err().is_none() {
                if mux.close_err().is_none() {
                    tokio::select! {
                        _ = mux_closed => conn.close_with_error(Error::Closed).await,
                        _ = conn_closed => {}
                    }
                } else {
                    conn.close_with_error(Error::Closed).await;
                }
            }
        });

        let conn = self.clone();
        tokio::spawn(async move {
            conn.run().await;
        });
    }

    async fn run(&self) {
        loop {
            let mut wakeup = pin!(self.wakeup.notified());
            wakeup.as_mut().enable();

            if self.state.lock().unwrap().closed.is_some() {
                return;
            }

            match self.wake().await {
                Some(deadline) => {
                    tokio::select! {
                        _ = wakeup => {}
                        _ = tokio::time::sleep_until(deadline.into()) => {}
                    }
                }
                None => wakeup.await,
            }
        }
    }

    /// One scheduler pass: scavenge timed-out packets, produce as many
    /// packets as the window allows, and report the next deadline.
    async fn wake(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut batch = Vec::new();
        let mut probes: Vec<(Vec<u8>, SocketAddr)> = Vec::new();

        let (raddr, deadline) = {
            let mut st = self.state.lock().unwrap();
            self.scavenge_timed_out_packets(&mut st, now);

            loop {
                let mut buf = [0u8; MAX_PACKET_SIZE];
                let (n, probe_addr) = output::send_packet(self, &mut st, &mut buf, now);
                if n == 0 {
                    break;
                }
                match probe_addr {
                    Some(paddr) => probes.push((buf[..n].to_vec(), paddr)),
                    None => batch.extend_from_slice(&buf[..n]),
                }
                // Only the final packet of a batch may be short.
                if n < MAX_PACKET_SIZE || st.closed.is_some() {
                    break;
                }
            }

            let deadline = match (st.timeout, st.send_ack_by) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            (st.raddr, deadline)
        };

        if !batch.is_empty() {
            let _ = self.mux.endpoint.send_segmented(&batch, MAX_PACKET_SIZE, raddr).await;
        }
        for (pkt, paddr) in probes {
            let _ = self.mux.endpoint.send_to(&pkt, paddr).await;
        }

        deadline
    }

    /// Time-based loss detection: declares lost every in-flight packet
    /// older than the loss threshold once the timeout deadline passes.
    fn scavenge_timed_out_packets(&self, st: &mut ConnState, now: Instant) {
        match st.timeout {
            Some(timeout) if now >= timeout => {}
            _ => return,
        }

        let loss_thresh = st.rtt.loss_duration_threshold();
        let had_in_flight = !st.in_flight_packets.is_empty();

        let lost: Vec<PacketNumber> = st
            .in_flight_packets
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent) >= loss_thresh)
            .map(|(&pn, _)| pn)
            .collect();

        let mut backoff = false;
        for pn in lost {
            let p = st.in_flight_packets.remove(&pn).expect("collected above");
            st.in_flight_bytes -= p.size;

            st.congestion.loss(p.sent, now);

            if st.max_stream_off_in_flight == p.max_stream_off {
                // This packet carried the largest advertised window limit;
                // forget it so it gets reasserted.
                st.max_stream_off_in_flight = 0;
            }

            for f in p.stream_fragments.into_iter().rev() {
                st.stream_fragments.push_front(f);
            }

            st.stats.bytes_timed_out += p.size as u64;

            // A timed-out packet likely means a congested link.
            backoff = true;
        }

        if backoff && st.timeout_backoff < MAX_TIMEOUT_BACKOFF {
            st.timeout_backoff += 1;
        }
        st.timeout = if had_in_flight {
            Some(now + backoff_pto(st.rtt.pto(), st.timeout_backoff))
        } else {
            None
        };
    }

    /// Adopts `raddr` as the peer's address, resetting the path-dependent
    /// estimators.
    pub(crate) fn set_remote_addr(&self, st: &mut ConnState, raddr: SocketAddr, now: Instant) {
        st.congestion = CongestionController::new(now);
        st.rtt = RttFilter::new();

        st.migration_addr = None;
        st.migration_probe_cooldown = now + MIN_MIGRATION_PROBE_INTERVAL;

        if st.raddr != raddr {
            debug!("[{}] migrated to {raddr}", self.id);
        }
        st.raddr = raddr;
    }

    fn close_err(&self) -> Option<Error> {
        self.state.lock().unwrap().closed.clone()
    }

    pub(crate) async fn close_with_error(&self, err: Error) {
        let (close_pkt, raddr) = {
            let mut st = self.state.lock().unwrap();
            if st.closed.is_some() {
                return;
            }
            st.closed = Some(err);

            // Best-effort CLOSE packet.
            let now = Instant::now();
            let mut buf = [0u8; MAX_PACKET_SIZE];
            let (n, _) = output::send_packet(self, &mut st, &mut buf, now);

            st.stats.log_summary(self.id);
            (buf[..n].to_vec(), st.raddr)
        };

        self.mux.remove_conn(self.id);

        self.closed_notify.notify_waiters();
        self.rel_rcv_ready.notify_waiters();
        self.rel_snd_ready.notify_waiters();
        self.unrel_rcv_ready.notify_waiters();
        self.unrel_snd_sem.close();
        self.wakeup.notify_one();

        if !close_pkt.is_empty() {
            let _ = self.mux.endpoint.send_to(&close_pkt, raddr).await;
        }
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut notified = pin!(self.rel_rcv_ready.notified());
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().unwrap();
                let n = st.stream_reassembler.read(buf);
                if n > 0 {
                    st.stats.stream_bytes_read += n as u64;
                    // The read freed window; let the sender advertise it.
                    self.wakeup.notify_one();
                    return Ok(n);
                }
                // Remaining stream contents are drained before the close
                // error is reported.
                if let Some(err) = &st.closed {
                    return Err(err.clone());
                }
            }
            notified.await;
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if let Some(err) = self.close_err() {
            return Err(err);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        // Copied so the caller's buffer is not retained; fragments slice
        // into this one allocation.
        let b = Bytes::copy_from_slice(buf);

        let mut n = 0;
        loop {
            let mut notified = pin!(self.rel_snd_ready.notified());
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().unwrap();
                if let Some(err) = &st.closed {
                    // Partially queued writes report their progress; the
                    // close error resurfaces on the next call.
                    return if n > 0 { Ok(n) } else { Err(err.clone()) };
                }

                let window = (st.max_stream_off - st.stream_off) as usize;
                let budget = self.mux.config.max_stream_bytes_in_flight - st.stream_bytes_in_flight;
                let nn = (b.len() - n).min(window).min(budget);
                if nn > 0 {
                    if MAX_VARINT - st.stream_off < nn as u64 {
                        panic!("stream offset wraparound");
                    }
                    let off = st.stream_off;
                    st.stream_fragments.push_back(StreamFragment { data: b.slice(n..n + nn), off });
                    st.stream_off += nn as u64;
                    st.stream_bytes_in_flight += nn;

                    self.wakeup.notify_one();

                    st.stats.stream_bytes_written += nn as u64;

                    n += nn;
                    if n == b.len() {
                        return Ok(n);
                    }
                    continue;
                }
            }
            notified.await;
        }
    }

    async fn read_msg(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let mut notified = pin!(self.unrel_rcv_ready.notified());
            notified.as_mut().enable();
            {
                let mut st = self.state.lock().unwrap();
                if st.msg_reassembler.has_msg() {
                    let n = st.msg_reassembler.read(buf);
                    st.stats.msg_bytes_read += n as u64;
                    return Ok(n);
                }
                if let Some(err) = &st.closed {
                    return Err(err.clone());
                }
            }
            notified.await;
        }
    }

    async fn write_msg(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        // Wait for the previous message to be fully handed to the wire.
        match self.unrel_snd_sem.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(self.close_err().unwrap_or(Error::Closed)),
        }

        let mut st = self.state.lock().unwrap();
        if let Some(err) = &st.closed {
            return Err(err.clone());
        }
        st.msg_data = Bytes::copy_from_slice(buf);
        st.msg_continued = false;

        self.wakeup.notify_one();

        st.stats.msg_bytes_written += buf.len() as u64;
        Ok(buf.len())
    }

    fn set_msg_receive_window(&self, n: usize) {
        let mut st = self.state.lock().unwrap();
        st.msg_reassembler = MsgReassembler::new(n);
    }
}

fn backoff_pto(pto: Duration, backoff: u32) -> Duration {
    pto * (1u32 << backoff)
}

/// An established connection: one reliable byte stream and one unreliable
/// message channel, multiplexed over encrypted UDP packets.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Reads from the reliable stream, blocking until at least one byte is
    /// available. After a close, buffered stream contents are drained
    /// before the close error is reported.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf).await
    }

    /// Writes to the reliable stream, blocking until every byte is queued.
    /// If the connection closes mid-write, the number of bytes queued so
    /// far is returned and the close error surfaces on the next call.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.inner.write(buf).await
    }

    /// Receives one whole message, blocking until one arrives. A message
    /// longer than `buf` is truncated.
    pub async fn read_msg(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read_msg(buf).await
    }

    /// Queues one message for unreliable delivery, blocking while a
    /// previous message is still being sent. Messages are delivered whole,
    /// at most once, in order; a lost segment drops the whole message.
    pub async fn write_msg(&self, buf: &[u8]) -> Result<usize> {
        self.inner.write_msg(buf).await
    }

    /// Sets the receive window of the message channel. Must not be called
    /// concurrently with `read_msg`.
    pub fn set_msg_receive_window(&self, n: usize) {
        self.inner.set_msg_receive_window(n);
    }

    /// The peer's current address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.state.lock().unwrap().raddr
    }

    /// Closes the connection, sending a best-effort CLOSE packet. Pending
    /// and future operations fail with [`Error::Closed`].
    pub async fn close(&self) {
        self.inner.close_with_error(Error::Closed).await;
    }
}
