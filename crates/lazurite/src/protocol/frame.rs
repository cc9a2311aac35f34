//! Frame codecs for the data packet payload.
//!
//! Every frame starts with a one-byte type tag. STREAM and MSG carry their
//! length explicitly only when they are not the last frame in a packet; the
//! `*_max_data_len` oracles tell the packet composer how much data fits and
//! whether the explicit length is required.

use crate::protocol::packet_number::{PacketNumber, PacketNumberRange, PacketNumberRanges};
use lazuli_binary::{BinaryError, MAX_VARINT, Reader, Writer, varint_len};
use std::time::Duration;

pub const FRAME_PADDING: u8 = 0b0000_0000;
pub const FRAME_PING: u8 = 0b0000_0001;
pub const FRAME_ACK: u8 = 0b0000_0010;
pub const FRAME_STREAM: u8 = 0b1000_0010;
pub const FRAME_MAX_STREAM_DATA: u8 = 0b1000_0100;
pub const FRAME_MSG: u8 = 0b1000_1000;
pub const FRAME_CLOSE: u8 = 0b1111_1111;

const STREAM_EXPLICIT_LEN_BIT: u8 = 0b001;
const MSG_EXPLICIT_LEN_BIT: u8 = 0b001;
const MSG_FIRST_BIT: u8 = 0b010;
const MSG_LAST_BIT: u8 = 0b100;

/// Largest ACK delay encodable on the wire, in microseconds.
const MAX_RAW_ACK_DELAY: u64 = MAX_VARINT / 1000;

#[inline]
pub fn is_padding(t: u8) -> bool {
    t == FRAME_PADDING
}

#[inline]
pub fn is_ping(t: u8) -> bool {
    t == FRAME_PING
}

#[inline]
pub fn is_ack(t: u8) -> bool {
    t == FRAME_ACK
}

#[inline]
pub fn is_stream(t: u8) -> bool {
    t & !STREAM_EXPLICIT_LEN_BIT == FRAME_STREAM
}

#[inline]
pub fn is_max_stream_data(t: u8) -> bool {
    t == FRAME_MAX_STREAM_DATA
}

#[inline]
pub fn is_msg(t: u8) -> bool {
    t & !(MSG_EXPLICIT_LEN_BIT | MSG_FIRST_BIT | MSG_LAST_BIT) == FRAME_MSG
}

#[inline]
pub fn is_close(t: u8) -> bool {
    t == FRAME_CLOSE
}

/// PING: makes a packet ack-eliciting without carrying data.
#[derive(Debug, PartialEq, Eq)]
pub struct Ping;

impl Ping {
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, BinaryError> {
        r.read_u8()?;
        Ok(Ping)
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), BinaryError> {
        w.write_u8(FRAME_PING)
    }
}

/// CLOSE: the sender is gone.
#[derive(Debug, PartialEq, Eq)]
pub struct Close;

impl Close {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), BinaryError> {
        w.write_u8(FRAME_CLOSE)
    }
}

/// ACK: the ranges of packet numbers the sender has received, plus how long
/// it held the newest of them before acking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Time since the highest acknowledged packet was received.
    pub delay: Duration,
    pub ranges: PacketNumberRanges,
}

impl Ack {
    /// Decodes an ACK, keeping at most `limit` ranges. Ranges beyond the
    /// limit are parsed and discarded, so a peer advertising more than we
    /// track is not a protocol violation.
    pub fn decode(r: &mut Reader<'_>, limit: usize) -> Result<Self, BinaryError> {
        r.read_u8()?;

        let mut max = r.read_varint()? as i64;

        let raw_delay = r.read_varint()?;
        let delay = Duration::from_micros(raw_delay.min(MAX_RAW_ACK_DELAY));

        let mut min = decode_diff(r, max)?;

        let n = r.read_varint()?;

        let mut ranges = Vec::new();
        let mut i: u64 = 0;
        loop {
            if ranges.len() < limit {
                ranges.push(PacketNumberRange { min, max });
            }
            if i >= n {
                break;
            }
            max = decode_diff(r, min - 2)?;
            min = decode_diff(r, max)?;
            i += 1;
        }

        Ok(Ack { delay, ranges: PacketNumberRanges(ranges) })
    }

    /// Encodes the ACK. The range list must be non-empty.
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), BinaryError> {
        let ranges = &self.ranges.0;
        w.write_u8(FRAME_ACK)?;
        w.write_varint(ranges[0].max as u64)?;
        w.write_varint((self.delay.as_micros() as u64).min(MAX_RAW_ACK_DELAY))?;
        encode_diff(w, ranges[0].max, ranges[0].min)?;
        w.write_varint((ranges.len() - 1) as u64)?;
        let mut prev_min = ranges[0].min;
        for r in &ranges[1..] {
            encode_diff(w, prev_min, r.max + 2)?;
            encode_diff(w, r.max, r.min)?;
            prev_min = r.min;
        }
        Ok(())
    }
}

fn decode_diff(r: &mut Reader<'_>, max: i64) -> Result<PacketNumber, BinaryError> {
    let gap = r.read_varint()? as i64;
    if max < gap {
        return Err(BinaryError::InvalidData("invalid range".into()));
    }
    Ok(max - gap)
}

fn encode_diff(w: &mut Writer<'_>, x: PacketNumber, y: PacketNumber) -> Result<(), BinaryError> {
    w.write_varint((x - y) as u64)
}

/// MAX_STREAM_DATA: advertises the receive window's upper offset.
pub fn decode_max_stream_data(r: &mut Reader<'_>) -> Result<u64, BinaryError> {
    r.read_u8()?;
    r.read_varint()
}

pub fn encode_max_stream_data(w: &mut Writer<'_>, off: u64) -> Result<(), BinaryError> {
    w.write_u8(FRAME_MAX_STREAM_DATA)?;
    w.write_varint(off)
}

/// STREAM: a fragment of the reliable byte stream at an absolute offset.
#[derive(Debug, PartialEq, Eq)]
pub struct Stream<'a> {
    /// `0 <= off <= MAX_VARINT`.
    pub off: u64,
    /// Must be non-empty.
    pub data: &'a [u8],
}

impl<'a> Stream<'a> {
    pub fn decode(r: &mut Reader<'a>) -> Result<Self, BinaryError> {
        let t = r.read_u8()?;

        let off = r.read_varint()?;

        let data_len = if t & STREAM_EXPLICIT_LEN_BIT != 0 {
            usize::try_from(r.read_varint()?).map_err(|_| BinaryError::UnexpectedEof {
                needed: usize::MAX,
                remaining: r.remaining(),
            })?
        } else {
            r.remaining()
        };
        if data_len == 0 {
            return Err(BinaryError::InvalidData("empty STREAM".into()));
        }
        if off + data_len as u64 > MAX_VARINT {
            return Err(BinaryError::InvalidData("STREAM overflows offset".into()));
        }

        Ok(Stream { off, data: r.read_exact(data_len)? })
    }

    pub fn encode(&self, w: &mut Writer<'_>, explicit_len: bool) -> Result<(), BinaryError> {
        let mut t = FRAME_STREAM;
        if explicit_len {
            t |= STREAM_EXPLICIT_LEN_BIT;
        }
        w.write_u8(t)?;
        w.write_varint(self.off)?;
        if explicit_len {
            w.write_varint(self.data.len() as u64)?;
        }
        w.write_all(self.data)
    }
}

/// How many bytes of a STREAM frame at `off` fit in `n` bytes of packet
/// room, and whether the frame needs an explicit length (it is only allowed
/// to omit it when the data runs to the end of the packet).
pub fn stream_max_data_len(n: usize, off: u64, data_len: usize) -> (usize, bool) {
    let overhead = 1 + varint_len(off);
    if n < overhead + 1 {
        // Too small to fit the offset and a single byte of data.
        return (0, false);
    }

    if n <= overhead + data_len {
        // The data fills the rest of the packet, the length is implied.
        return (n - overhead, false);
    }

    // min(n-overhead-1, data_len) is a conservative bound on the data that
    // can be written once at least one byte goes to the length itself.
    let fit = (n - overhead - 1).min(data_len);
    ((n - overhead - varint_len(fit as u64)).min(data_len), true)
}

/// MSG: one segment of an unreliable message.
#[derive(Debug, PartialEq, Eq)]
pub struct Msg<'a> {
    pub first: bool,
    pub last: bool,
    /// `0 <= seq <= MAX_VARINT`. Each segment consumes one sequence number.
    pub seq: u64,
    /// Must be non-empty.
    pub data: &'a [u8],
}

impl<'a> Msg<'a> {
    pub fn decode(r: &mut Reader<'a>) -> Result<Self, BinaryError> {
        let t = r.read_u8()?;

        let seq = r.read_varint()?;

        let data_len = if t & MSG_EXPLICIT_LEN_BIT != 0 {
            usize::try_from(r.read_varint()?).map_err(|_| BinaryError::UnexpectedEof {
                needed: usize::MAX,
                remaining: r.remaining(),
            })?
        } else {
            r.remaining()
        };
        if data_len == 0 {
            return Err(BinaryError::InvalidData("empty MSG".into()));
        }

        Ok(Msg {
            first: t & MSG_FIRST_BIT != 0,
            last: t & MSG_LAST_BIT != 0,
            seq,
            data: r.read_exact(data_len)?,
        })
    }

    pub fn encode(&self, w: &mut Writer<'_>, explicit_len: bool) -> Result<(), BinaryError> {
        let mut t = FRAME_MSG;
        if explicit_len {
            t |= MSG_EXPLICIT_LEN_BIT;
        }
        if self.first {
            t |= MSG_FIRST_BIT;
        }
        if self.last {
            t |= MSG_LAST_BIT;
        }
        w.write_u8(t)?;
        w.write_varint(self.seq)?;
        if explicit_len {
            w.write_varint(self.data.len() as u64)?;
        }
        w.write_all(self.data)
    }
}

/// See [`stream_max_data_len`].
pub fn msg_max_data_len(n: usize, seq: u64, data_len: usize) -> (usize, bool) {
    let overhead = 1 + varint_len(seq);
    if n < overhead + 1 {
        return (0, false);
    }
    if n <= overhead + data_len {
        return (n - overhead, false);
    }
    let fit = (n - overhead - 1).min(data_len);
    ((n - overhead - varint_len(fit as u64)).min(data_len), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(pairs: &[(PacketNumber, PacketNumber)]) -> PacketNumberRanges {
        PacketNumberRanges(
            pairs.iter().map(|&(min, max)| PacketNumberRange { min, max }).collect(),
        )
    }

    #[test]
    fn ack_round_trip_single_range() {
        let ack = Ack { delay: Duration::from_micros(1500), ranges: ranges(&[(3, 17)]) };

        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        ack.encode(&mut w).unwrap();
        let n = w.len();

        let decoded = Ack::decode(&mut Reader::new(&buf[..n]), 8).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn ack_round_trip_many_ranges() {
        let ack = Ack {
            delay: Duration::ZERO,
            ranges: ranges(&[(100, 120), (80, 90), (50, 50), (0, 10)]),
        };

        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        ack.encode(&mut w).unwrap();
        let n = w.len();

        let decoded = Ack::decode(&mut Reader::new(&buf[..n]), 8).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn ack_decode_truncates_to_limit() {
        let all: Vec<(PacketNumber, PacketNumber)> =
            (0..10).map(|i| (100 - 10 * i, 105 - 10 * i)).collect();
        let ack = Ack { delay: Duration::ZERO, ranges: ranges(&all) };

        let mut buf = [0u8; 128];
        let mut w = Writer::new(&mut buf);
        ack.encode(&mut w).unwrap();
        let n = w.len();

        let decoded = Ack::decode(&mut Reader::new(&buf[..n]), 8).unwrap();
        assert_eq!(decoded.ranges.0.len(), 8);
        assert_eq!(decoded.ranges.0[..], ack.ranges.0[..8]);
    }

    #[test]
    fn ack_decode_caps_delay() {
        let ack = Ack { delay: Duration::from_micros(MAX_RAW_ACK_DELAY), ranges: ranges(&[(0, 1)]) };
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        ack.encode(&mut w).unwrap();
        let n = w.len();
        let decoded = Ack::decode(&mut Reader::new(&buf[..n]), 8).unwrap();
        assert_eq!(decoded.delay, Duration::from_micros(MAX_RAW_ACK_DELAY));
    }

    #[test]
    fn ack_decode_rejects_inverted_range() {
        // max = 5, delay = 0, first range min gap = 7 > max.
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        w.write_u8(FRAME_ACK).unwrap();
        w.write_varint(5).unwrap();
        w.write_varint(0).unwrap();
        w.write_varint(7).unwrap();
        w.write_varint(0).unwrap();
        let n = w.len();
        assert!(matches!(
            Ack::decode(&mut Reader::new(&buf[..n]), 8),
            Err(BinaryError::InvalidData(_))
        ));
    }

    #[test]
    fn ping_round_trip() {
        let mut buf = [0u8; 4];
        let mut w = Writer::new(&mut buf);
        Ping.encode(&mut w).unwrap();
        assert_eq!(w.len(), 1);
        assert!(is_ping(buf[0]));
        Ping::decode(&mut Reader::new(&buf[..1])).unwrap();
    }

    #[test]
    fn max_stream_data_round_trip() {
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        encode_max_stream_data(&mut w, 123_456_789).unwrap();
        let n = w.len();
        let mut r = Reader::new(&buf[..n]);
        assert!(is_max_stream_data(r.peek_u8()));
        assert_eq!(decode_max_stream_data(&mut r).unwrap(), 123_456_789);
    }

    #[test]
    fn stream_round_trip_both_length_encodings() {
        for explicit in [false, true] {
            let frame = Stream { off: 70_000, data: b"hello stream" };
            let mut buf = [0u8; 64];
            let mut w = Writer::new(&mut buf);
            frame.encode(&mut w, explicit).unwrap();
            let n = w.len();

            let decoded = Stream::decode(&mut Reader::new(&buf[..n])).unwrap();
            assert_eq!(decoded, frame, "explicit = {explicit}");
        }
    }

    #[test]
    fn stream_rejects_empty_and_overflowing() {
        let frame = Stream { off: 0, data: b"x" };
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        frame.encode(&mut w, true).unwrap();
        let n = w.len();
        // Patch the explicit length to zero.
        buf[2] = 0;
        assert!(matches!(
            Stream::decode(&mut Reader::new(&buf[..n])),
            Err(BinaryError::InvalidData(_))
        ));

        let frame = Stream { off: MAX_VARINT, data: b"x" };
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        frame.encode(&mut w, false).unwrap();
        let n = w.len();
        assert!(matches!(
            Stream::decode(&mut Reader::new(&buf[..n])),
            Err(BinaryError::InvalidData(_))
        ));
    }

    #[test]
    fn msg_round_trip_flags() {
        for (first, last, explicit) in [
            (false, false, false),
            (true, false, true),
            (false, true, false),
            (true, true, true),
        ] {
            let frame = Msg { first, last, seq: 42, data: b"payload" };
            let mut buf = [0u8; 64];
            let mut w = Writer::new(&mut buf);
            frame.encode(&mut w, explicit).unwrap();
            let n = w.len();

            let decoded = Msg::decode(&mut Reader::new(&buf[..n])).unwrap();
            assert_eq!(decoded, frame, "first={first} last={last} explicit={explicit}");
        }
    }

    #[test]
    fn stream_oracle_respects_room() {
        for room in 0..64usize {
            for data_len in 0..64usize {
                for off in [0u64, 63, 64, 1 << 20] {
                    let (n, explicit) = stream_max_data_len(room, off, data_len);
                    if n == 0 {
                        continue;
                    }
                    assert!(n <= data_len);
                    let data = vec![0xaa; n];
                    let mut buf = vec![0u8; room];
                    let mut w = Writer::new(&mut buf);
                    Stream { off, data: &data }
                        .encode(&mut w, explicit)
                        .unwrap_or_else(|e| {
                            panic!("room={room} data_len={data_len} off={off}: {e}")
                        });
                    if !explicit {
                        // Implicit length requires the frame to run to the
                        // end of the packet.
                        assert_eq!(w.len(), room);
                    }
                }
            }
        }
    }

    #[test]
    fn msg_oracle_matches_stream_oracle_shape() {
        for room in 0..48usize {
            for data_len in 0..48usize {
                let (n, explicit) = msg_max_data_len(room, 5, data_len);
                if n == 0 {
                    continue;
                }
                let data = vec![0xbb; n];
                let mut buf = vec![0u8; room];
                let mut w = Writer::new(&mut buf);
                Msg { first: true, last: n == data_len, seq: 5, data: &data }
                    .encode(&mut w, explicit)
                    .unwrap();
                if !explicit {
                    assert_eq!(w.len(), room);
                }
            }
        }
    }
}
