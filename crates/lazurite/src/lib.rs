//! # Lazurite
//!
//! A connection-oriented secure datagram transport over UDP: each
//! connection multiplexes one reliable, flow-controlled byte stream and
//! one unreliable best-effort message channel, with mutual authentication
//! and forward secrecy from a Noise_IK handshake, ACK-driven and
//! time-driven loss recovery, a validated congestion window, and
//! connection migration.
//!
//! A [`Mux`] owns a UDP socket and demultiplexes packets to connections by
//! an 8-byte connection id. Servers [`Mux::accept`], clients [`dial`] (or
//! [`Mux::dial`] for a single address), and both ends then talk through
//! [`Connection`].

mod config;
mod connection;
mod cookie;
mod dial;
mod endpoint;
mod error;
mod handshaker;
mod mux;
mod protocol;
mod recovery;
mod sec;

pub use config::{Config, PrivateKey, PublicKey};
pub use connection::Connection;
pub use dial::dial;
pub use error::{Error, Result};
pub use mux::Mux;
