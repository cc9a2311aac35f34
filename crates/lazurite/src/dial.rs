//! Retrying, multi-address dialing on top of [`Mux::dial`].

use crate::config::PublicKey;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::mux::Mux;
use log::trace;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

const ATTEMPTS: u32 = 5;

/// Connects to `address` (a `host:port` string). Every resolved address is
/// dialed concurrently; each gets up to five attempts under exponentially
/// growing, fully jittered deadlines, with one transparent redial on the
/// attempt's remaining time when the server demands a fresh cookie. The
/// first connection to complete wins.
pub async fn dial(
    mux: &Mux,
    address: &str,
    remote_static_public_key: PublicKey,
) -> Result<Connection> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(address).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing").into());
    }

    let (tx, mut rx) = mpsc::channel::<Result<Connection>>(addrs.len() as usize * ATTEMPTS as usize);
    let mut attempts = Vec::new();
    for addr in addrs {
        let mux = mux.clone();
        let tx = tx.clone();
        attempts.push(tokio::spawn(async move {
            for i in 0..ATTEMPTS {
                // Exponential backoff with full jitter. One deadline
                // bounds the attempt, cookie redial included.
                let timeout = Duration::from_nanos(rand::random_range(1..=1_000_000_000u64 << i));
                let deadline = Instant::now() + timeout;

                let mut result = mux.dial(remote_static_public_key, addr, timeout).await;
                if matches!(result, Err(Error::Again)) {
                    trace!("redialing {addr} with a fresh cookie");
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    result = mux.dial(remote_static_public_key, addr, remaining).await;
                }

                let done = result.is_ok();
                match tx.send(result).await {
                    Ok(()) if done => return,
                    Ok(()) => {}
                    Err(send_err) => {
                        // A sibling already won; give this one back.
                        if let Ok(conn) = send_err.0 {
                            conn.close().await;
                        }
                        return;
                    }
                }
            }
        }));
    }
    drop(tx);

    let mut first_err = None;
    while let Some(result) = rx.recv().await {
        match result {
            Ok(conn) => {
                for attempt in &attempts {
                    attempt.abort();
                }
                // Close any connection that raced us into the channel.
                while let Ok(result) = rx.try_recv() {
                    if let Ok(extra) = result {
                        extra.close().await;
                    }
                }
                return Ok(conn);
            }
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }
    Err(first_err.unwrap_or(Error::Timeout))
}
