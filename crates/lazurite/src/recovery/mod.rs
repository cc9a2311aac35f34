//! Loss recovery and reassembly support: the RTT filter, the congestion
//! controller, and the reliable-stream / unreliable-message reassemblers.

mod bitset;
mod congestion;
mod msg_reassembler;
mod rtt;
mod stream_reassembler;

pub(crate) use bitset::Bitset;
pub(crate) use congestion::CongestionController;
pub(crate) use msg_reassembler::MsgReassembler;
pub(crate) use rtt::RttFilter;
pub(crate) use stream_reassembler::StreamReassembler;
