//! The receive path: AEAD open, frame dispatch, ACK processing with
//! nack-based loss detection, and migration candidate tracking.

use crate::connection::{
    ConnInner, ConnState, MAX_ACKED_PACKET_NUMBER_RANGE_COUNT, MAX_RCVD_PACKET_NUMBER_RANGE_COUNT,
    NO_NACKS, NO_STREAM_OFF_IMPLICIT_ACK,
};
use crate::error::Error;
use crate::protocol::packet_number::{PacketNumber, PacketNumberRange, guess_packet_number};
use crate::protocol::{DATA_PACKET, MAX_ACK_DELAY, PACKET_TAG_MASK, TIMER_GRANULARITY, frame};
use lazuli_binary::Reader;
use std::net::SocketAddr;
use std::time::Instant;

impl ConnInner {
    /// Handles one datagram addressed to this connection. Packets that
    /// fail authentication are dropped silently; protocol violations tear
    /// the connection down.
    pub(crate) async fn handle_packet(&self, p: &mut [u8], raddr: SocketAddr) {
        if p[0] & PACKET_TAG_MASK != DATA_PACKET {
            return;
        }
        if p.len() < 12 {
            return;
        }

        let result = {
            let mut st = self.state.lock().unwrap();
            self.handle_packet_impl(&mut st, p, raddr, Instant::now())
        };
        if let Err(err) = result {
            self.close_with_error(err).await;
        }
    }

    fn handle_packet_impl(
        &self,
        st: &mut ConnState,
        p: &mut [u8],
        raddr: SocketAddr,
        now: Instant,
    ) -> Result<(), Error> {
        let packet_len = p.len();
        let max_rcvd_pn = st.max_rcvd_pn_ranges.max();

        let truncated = u32::from_le_bytes(p[8..12].try_into().expect("length checked"));
        let pn = guess_packet_number(max_rcvd_pn, truncated);

        let (header, body) = p.split_at_mut(12);
        let Some(payload) = st.recv_aead.open_in_place(pn as u64, &header[..8], body) else {
            // Spoofed or corrupt packets must not tear down the
            // connection.
            return Ok(());
        };

        let mut ack_eliciting = false;
        let mut r = Reader::new(payload);
        while r.remaining() > 0 {
            let t = r.peek_u8();

            if frame::is_padding(t) {
                let _ = r.read_u8();
            } else if frame::is_ping(t) {
                frame::Ping::decode(&mut r)
                    .map_err(|e| Error::Protocol(format!("decode PING: {e}")))?;
            } else if frame::is_ack(t) {
                let ack = frame::Ack::decode(&mut r, MAX_ACKED_PACKET_NUMBER_RANGE_COUNT)
                    .map_err(|e| Error::Protocol(format!("decode ACK: {e}")))?;
                self.handle_ack(st, &ack, raddr, now)?;
            } else if frame::is_stream(t) {
                let s = frame::Stream::decode(&mut r)
                    .map_err(|e| Error::Protocol(format!("decode STREAM: {e}")))?;
                self.handle_stream(st, &s)?;
            } else if frame::is_max_stream_data(t) {
                let off = frame::decode_max_stream_data(&mut r)
                    .map_err(|e| Error::Protocol(format!("decode MAX_STREAM_DATA: {e}")))?;
                self.handle_max_stream_data(st, off);
            } else if frame::is_msg(t) {
                let m = frame::Msg::decode(&mut r)
                    .map_err(|e| Error::Protocol(format!("decode MSG: {e}")))?;
                self.handle_msg(st, &m);
            } else if frame::is_close(t) {
                return Err(Error::Closed);
            } else {
                return Err(Error::Protocol(format!("unknown frame {t:#04x}")));
            }

            if max_rcvd_pn < pn && !frame::is_padding(t) && !frame::is_ack(t) {
                ack_eliciting = true;
            }
        }

        if max_rcvd_pn < pn {
            let ranges = &mut st.max_rcvd_pn_ranges.0;
            if ranges.is_empty() || ranges[0].max + 1 < pn {
                ranges.insert(0, PacketNumberRange { min: pn, max: pn });
            } else if ranges[0].max + 1 == pn {
                ranges[0].max = pn;
            }
            ranges.truncate(MAX_RCVD_PACKET_NUMBER_RANGE_COUNT);
            st.max_rcvd_pn_rcv_time = now;
        }

        if max_rcvd_pn + 1 < pn {
            // A gap: the packet before this one is likely lost, ack ASAP
            // so the peer learns it.
            st.send_ack_by = Some(now);
        } else if max_rcvd_pn + 1 == pn && ack_eliciting {
            st.send_ack_by = match st.send_ack_by {
                None => Some(now + MAX_ACK_DELAY - TIMER_GRANULARITY),
                // Send the ACK immediately every now and then.
                Some(_) => Some(now),
            };
        }

        if st.raddr != raddr && max_rcvd_pn < pn {
            st.migration_addr = Some(raddr);
        }

        self.wakeup.notify_one();

        st.stats.bytes_rcvd += packet_len as u64;
        Ok(())
    }

    fn handle_ack(
        &self,
        st: &mut ConnState,
        ack: &frame::Ack,
        raddr: SocketAddr,
        now: Instant,
    ) -> Result<(), Error> {
        let max_pn_acks = ack.ranges.max();
        if max_pn_acks >= st.seq {
            return Err(Error::Protocol("optimistic ack".into()));
        }

        if let Some(p) = st.in_flight_packets.get(&max_pn_acks) {
            if st.max_pn_acked < max_pn_acks {
                let sent = p.sent;
                let probe_addr = p.probe_addr;

                // Confirming a migration resets the RTT filter; do it
                // before feeding the sample.
                if probe_addr == Some(raddr) {
                    self.set_remote_addr(st, raddr, now);
                } else {
                    // An ack that arrived some other way aborts the
                    // candidate.
                    st.migration_addr = None;
                }

                st.rtt.update(now.duration_since(sent), ack.delay.min(MAX_ACK_DELAY), now);
            }
        }

        let mut acked: Vec<PacketNumber> = Vec::new();
        let mut nacked: Vec<PacketNumber> = Vec::new();
        let mut ack_eliciting_packets_in_flight = false;
        for &pn in st.in_flight_packets.keys() {
            if ack.ranges.contains(pn) {
                acked.push(pn);
            } else if pn < max_pn_acks && !NO_NACKS {
                // Every packet below the ack's highest number that it does
                // not cover is taken as lost.
                nacked.push(pn);
            } else {
                ack_eliciting_packets_in_flight = true;
            }
        }

        for pn in acked {
            let p = st.in_flight_packets.remove(&pn).expect("collected above");

            st.max_pn_acked = st.max_pn_acked.max(pn);
            st.max_rcvd_pn_ranges.trim_lesser(p.max_pn_acks);

            st.in_flight_bytes -= p.size;

            st.congestion.ack(p.size, p.sent, now);

            st.max_stream_off_acked = st.max_stream_off_acked.max(p.max_stream_off);

            for f in &p.stream_fragments {
                st.stream_bytes_in_flight -= f.data.len();
            }
            if !p.stream_fragments.is_empty() {
                // Unblock a writer waiting on the in-flight budget.
                self.rel_snd_ready.notify_one();
            }
        }

        for pn in nacked {
            let p = st.in_flight_packets.remove(&pn).expect("collected above");

            st.in_flight_bytes -= p.size;

            st.congestion.loss(p.sent, now);

            if st.max_stream_off_in_flight == p.max_stream_off {
                st.max_stream_off_in_flight = 0;
            }

            for f in p.stream_fragments.into_iter().rev() {
                st.stream_fragments.push_front(f);
            }

            st.stats.bytes_nacked += p.size as u64;
        }

        if ack_eliciting_packets_in_flight {
            st.timeout_backoff = 0;
            st.timeout = Some(now + st.rtt.pto());
        }

        Ok(())
    }

    fn handle_stream(&self, st: &mut ConnState, s: &frame::Stream<'_>) -> Result<(), Error> {
        st.stream_reassembler.write_at(s.data, s.off)?;

        if !NO_STREAM_OFF_IMPLICIT_ACK {
            // Data at this offset proves the peer learned our window at
            // least up to its end, even if the packet acking the
            // MAX_STREAM_DATA was lost.
            st.max_stream_off_acked = st.max_stream_off_acked.max(s.off + s.data.len() as u64);
        }

        if st.stream_reassembler.can_be_read() {
            self.rel_rcv_ready.notify_one();
        }
        Ok(())
    }

    fn handle_max_stream_data(&self, st: &mut ConnState, off: u64) {
        if st.max_stream_off < off {
            st.max_stream_off = off;

            self.rel_snd_ready.notify_one();
        }
    }

    fn handle_msg(&self, st: &mut ConnState, m: &frame::Msg<'_>) {
        let seq = m.seq as i64;
        if m.first && st.msg_rcvd_seq < seq {
            st.msg_reassembler.clear();
        } else if st.msg_rcvd_seq + 1 != seq {
            // Out of order; the in-progress message is already lost.
            return;
        }

        if !st.msg_reassembler.write(m.data) {
            // The message is bigger than our receive window.
            return;
        }
        st.msg_rcvd_seq = seq;

        if m.last {
            st.msg_reassembler.swap();

            self.unrel_rcv_ready.notify_one();
        }

        st.stats.msg_bytes_rcvd += m.data.len() as u64;
    }
}
