//! The sender scheduler: composes frames into packets under the
//! congestion window, seals them, and registers ack-eliciting packets with
//! the in-flight tracker.

use crate::connection::{ConnInner, ConnState, InFlightPacket, MIN_MIGRATION_PROBE_INTERVAL};
use crate::protocol::packet_number::{MAX_PACKET_NUMBER, PacketNumber};
use crate::protocol::{DATA_PACKET, MAX_ACK_DELAY, MAX_PACKET_SIZE, TAG_LEN, frame};
use lazuli_binary::{MAX_VARINT, Writer};
use std::net::SocketAddr;
use std::time::Instant;

/// Composes, numbers and seals one packet into `dst`. Returns the packet
/// length (zero when there is nothing to send) and the probe address if
/// the packet must go out as a migration probe instead of to the current
/// peer address.
pub(super) fn send_packet(
    conn: &ConnInner,
    st: &mut ConnState,
    dst: &mut [u8; MAX_PACKET_SIZE],
    now: Instant,
) -> (usize, Option<SocketAddr>) {
    dst[..8].copy_from_slice(conn.id.as_bytes());
    dst[0] |= DATA_PACKET;

    let mut p = InFlightPacket::new(now);
    let payload_len;
    {
        let (_, tail) = dst.split_at_mut(12);
        let mut w = Writer::new(&mut tail[..MAX_PACKET_SIZE - 12 - TAG_LEN]);

        if st.closed.is_some() {
            frame::Close.encode(&mut w).expect("CLOSE fits in an empty packet");
        } else {
            let cwnd_limited = st.congestion.cwnd_limited(st.in_flight_bytes, st.rtt.pto(), now);

            maybe_send_ack(st, &mut w, &mut p, cwnd_limited, now);
            if !cwnd_limited {
                maybe_send_max_stream_data(st, &mut w, &mut p);

                // Random interleave so neither channel starves the other.
                if rand::random::<bool>() {
                    maybe_send_stream(st, &mut w, &mut p);
                    maybe_send_msg(conn, st, &mut w, &mut p);
                } else {
                    maybe_send_msg(conn, st, &mut w, &mut p);
                    maybe_send_stream(st, &mut w, &mut p);
                }
            }

            if st.migration_addr.is_some() && now >= st.migration_probe_cooldown {
                st.migration_probe_cooldown = now + MIN_MIGRATION_PROBE_INTERVAL;

                // A probe must be ack-eliciting so its ack can confirm
                // the path.
                if !p.ack_eliciting() {
                    frame::Ping.encode(&mut w).expect("PING fits");
                }
                p.probe_addr = st.migration_addr;
            }
        }

        if w.is_empty() {
            return (0, None);
        }
        payload_len = w.len();
    }

    p.sent = now;
    // The true wire size has some constant per-datagram overhead on top;
    // underestimating it only matters for tiny packets, which are rare.
    p.size = 12 + payload_len + TAG_LEN;

    let pn = next_packet_number(st);

    let probe_addr = p.probe_addr;
    if p.ack_eliciting() {
        st.in_flight_bytes += p.size;
        st.stats.bytes_sent += p.size as u64;
        st.in_flight_packets.insert(pn, p);

        st.congestion.validate(st.in_flight_bytes, st.rtt.pto(), now);

        st.timeout = Some(now + st.rtt.pto() * (1u32 << st.timeout_backoff));
    }

    dst[8..12].copy_from_slice(&(pn as u32).to_le_bytes());

    let (header, body) = dst.split_at_mut(12);
    let sealed_len = st.send_aead.seal_in_place(pn as u64, &header[..8], body, payload_len);

    (12 + sealed_len, probe_addr)
}

fn next_packet_number(st: &mut ConnState) -> PacketNumber {
    let pn = st.seq;
    if pn == MAX_PACKET_NUMBER {
        panic!("packet number wraparound");
    }
    st.seq += 1;
    pn
}

fn maybe_send_ack(
    st: &mut ConnState,
    w: &mut Writer<'_>,
    p: &mut InFlightPacket,
    cwnd_limited: bool,
    now: Instant,
) {
    if st.max_rcvd_pn_ranges.0.is_empty() {
        return; // nothing to ack
    }

    let due = st.send_ack_by.is_some_and(|t| now >= t);
    if due || (cwnd_limited && !st.sent_tail_ack) {
        frame::Ack {
            delay: now.duration_since(st.max_rcvd_pn_rcv_time).min(MAX_ACK_DELAY),
            ranges: st.max_rcvd_pn_ranges.clone(),
        }
        .encode(w)
        .expect("ACK fits in an empty packet");

        st.send_ack_by = None;
        if cwnd_limited {
            // One tail ack per congestion episode keeps the peer informed
            // without flooding.
            st.sent_tail_ack = true;

            st.stats.tail_acks_sent += 1;
        }

        p.max_pn_acks = st.max_rcvd_pn_ranges.max();
    }
    if !cwnd_limited {
        st.sent_tail_ack = false;
    }
}

fn maybe_send_max_stream_data(st: &mut ConnState, w: &mut Writer<'_>, p: &mut InFlightPacket) {
    let off = st.stream_reassembler.max_offset();
    if st.max_stream_off_acked < off && st.max_stream_off_in_flight < off {
        st.max_stream_off_in_flight = off;

        frame::encode_max_stream_data(w, off).expect("MAX_STREAM_DATA fits");

        p.max_stream_off = off;
    }
}

fn maybe_send_stream(st: &mut ConnState, w: &mut Writer<'_>, p: &mut InFlightPacket) {
    loop {
        let (front_off, front_len) = match st.stream_fragments.front() {
            Some(f) => (f.off, f.data.len()),
            None => break,
        };

        let (n, explicit_len) = frame::stream_max_data_len(w.remaining(), front_off, front_len);
        let f = if n == front_len {
            st.stream_fragments.pop_front().expect("checked above")
        } else if n > 0 {
            st.stream_fragments.front_mut().expect("checked above").split_to(n)
        } else {
            break;
        };

        frame::Stream { off: f.off, data: &f.data }
            .encode(w, explicit_len)
            .expect("oracle-sized STREAM fits");

        p.stream_fragments.push(f);
    }
}

fn maybe_send_msg(conn: &ConnInner, st: &mut ConnState, w: &mut Writer<'_>, p: &mut InFlightPacket) {
    let (n, explicit_len) = frame::msg_max_data_len(w.remaining(), st.msg_seq, st.msg_data.len());
    if n == 0 {
        return; // nothing to send, or it wouldn't fit
    }

    let first = !st.msg_continued;
    st.msg_continued = true;

    let last = n == st.msg_data.len();

    let data = st.msg_data.split_to(n);

    let seq = st.msg_seq;
    if seq == MAX_VARINT {
        panic!("message sequence number wraparound");
    }
    st.msg_seq += 1;

    frame::Msg { first, last, seq, data: &data }
        .encode(w, explicit_len)
        .expect("oracle-sized MSG fits");

    if st.msg_data.is_empty() {
        // Hand the message slot back to the next writer.
        conn.unrel_snd_sem.add_permits(1);
    }

    p.contains_msg = true;
}
