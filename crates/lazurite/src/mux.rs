//! The muxer: one UDP endpoint shared by every connection, a wait-free
//! ConnID dispatch map, and the cookie-gated server side of connection
//! establishment.

use crate::config::{Config, PublicKey};
use crate::connection::{ConnInner, Connection};
use crate::cookie::Authenticator;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::handshaker::Handshaker;
use crate::protocol::{
    ConnId, DATA_PACKET, HANDSHAKE_PACKET, MAX_PACKET_SIZE, NOISE_PROLOGUE, PACKET_TAG_MASK,
    RETRY_PACKET,
};
use crate::sec::{Handshake, Role};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{debug, info, trace};
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, mpsc};

/// Time between renewals of the cookie authenticator's key, and so an
/// upper bound on how long a handed-out cookie stays valid.
const COOKIE_AUTH_RENEWAL_INTERVAL: Duration = Duration::from_secs(120);

/// Capacity of the queue of connections awaiting [`Mux::accept`].
const BACKLOG: usize = 3;

#[derive(Clone)]
pub(crate) enum Handler {
    Handshaker(Arc<Handshaker>),
    Conn(Arc<ConnInner>),
}

pub(crate) struct MuxShared {
    pub endpoint: Endpoint,
    pub config: Config,

    /// ConnID to handler. Dispatch does lock-free reads; entries are
    /// added on dial/accept and removed on close.
    pub conns: DashMap<ConnId, Handler>,
    /// Last retry cookie each remote handed us, presented on the next
    /// dial.
    pub jar: DashMap<SocketAddr, Vec<u8>>,

    auth: Mutex<Option<(Authenticator, Instant)>>,

    close: Mutex<Option<Error>>,
    pub closed_notify: Notify,

    accept_tx: mpsc::Sender<Connection>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
}

impl MuxShared {
    pub fn close_err(&self) -> Option<Error> {
        self.close.lock().unwrap().clone()
    }

    pub fn remove_conn(&self, id: ConnId) {
        self.conns.remove(&id);
    }

    fn close_with_error(&self, err: Error) {
        {
            let mut slot = self.close.lock().unwrap();
            if slot.is_some() {
                return;
            }
            *slot = Some(err);
        }
        // Connections observe this and close themselves; see the watcher
        // in ConnInner::spawn.
        self.closed_notify.notify_waiters();
    }

    async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];
        loop {
            let mut closed = pin!(self.closed_notify.notified());
            closed.as_mut().enable();
            if self.close_err().is_some() {
                return;
            }

            tokio::select! {
                res = self.endpoint.recv_from(&mut buf) => match res {
                    Ok((n, raddr)) => {
                        let (p, _) = buf.split_at_mut(n);
                        self.handle_packet(p, raddr).await;
                    }
                    Err(e) => {
                        self.close_with_error(e.into());
                        return;
                    }
                },
                _ = closed => return,
            }
        }
    }

    async fn handle_packet(self: &Arc<Self>, p: &mut [u8], raddr: SocketAddr) {
        // Too short: a packet must at least have a connection ID.
        if p.len() < 8 {
            return;
        }

        let cid = ConnId::from_wire(p);

        match p[0] & PACKET_TAG_MASK {
            HANDSHAKE_PACKET => {
                if self.config.listen && p.len() == MAX_PACKET_SIZE {
                    self.receive_handshake(p, raddr).await;
                }
            }
            RETRY_PACKET | DATA_PACKET => {
                // Clone the handler out so no map lock is held while the
                // packet is processed.
                let handler = self.conns.get(&cid).map(|h| h.value().clone());
                match handler {
                    Some(Handler::Conn(conn)) => conn.handle_packet(p, raddr).await,
                    Some(Handler::Handshaker(hsk)) => hsk.handle_packet(p),
                    None => {}
                }
            }
            _ => {}
        }
    }

    async fn receive_handshake(self: &Arc<Self>, p: &[u8], raddr: SocketAddr) {
        let cid = ConnId::from_wire(p);

        let mut r = lazuli_binary::Reader::new(&p[8..]);
        let Ok(cookie) = r.read_length_prefixed() else { return };
        let Ok(noise_msg) = r.read_length_prefixed() else { return };

        let additional_data = raddr.to_string();
        let fresh_cookie = {
            let mut slot = self.auth.lock().unwrap();
            let now = Instant::now();
            let stale = match &*slot {
                Some((_, created)) => now.duration_since(*created) >= COOKIE_AUTH_RENEWAL_INTERVAL,
                None => true,
            };
            if stale {
                *slot = Some((Authenticator::new(), now));
            }
            let (auth, _) = slot.as_ref().expect("just populated");
            if auth.verify(cookie, additional_data.as_bytes()) {
                None
            } else {
                Some(auth.sign(additional_data.as_bytes()))
            }
        };

        if let Some(fresh) = fresh_cookie {
            let mut buf = [0u8; MAX_PACKET_SIZE];
            buf[..8].copy_from_slice(cid.as_bytes());
            buf[0] |= RETRY_PACKET;
            buf[8..8 + fresh.len()].copy_from_slice(&fresh);
            let _ = self.endpoint.send_to(&buf[..8 + fresh.len()], raddr).await;
            trace!("sent retry cookie to {raddr}");
            return;
        }

        let mut hs = Handshake::new(
            NOISE_PROLOGUE,
            self.config.private_key.as_bytes(),
            None,
            rand::random(),
            Role::Responder,
        );
        if hs.read_message(noise_msg, 0).is_err() {
            return;
        }

        let mut buf = [0u8; MAX_PACKET_SIZE];
        buf[..8].copy_from_slice(cid.as_bytes());
        buf[0] |= DATA_PACKET;
        let reply = match hs.write_message(&[]) {
            Ok(m) => m,
            Err(_) => return,
        };
        buf[8..8 + reply.len()].copy_from_slice(&reply);
        let reply_len = 8 + reply.len();

        let (c1, c2, _) = hs.split();
        let conn = ConnInner::new(self.clone(), cid, c1, c2, raddr);

        // A connection with this id already exists: ignore the attempt.
        match self.conns.entry(cid) {
            Entry::Occupied(_) => return,
            Entry::Vacant(v) => {
                v.insert(Handler::Conn(conn.clone()));
            }
        }

        match self.accept_tx.try_send(Connection { inner: conn.clone() }) {
            Ok(()) => {
                // The reply must hit the wire before the driver's first
                // packet, or the client mistakes that packet for the
                // handshake response.
                let _ = self.endpoint.send_to(&buf[..reply_len], raddr).await;
                conn.spawn();
                debug!("[{cid}] accepted connection from {raddr}");
            }
            Err(_) => {
                // Accept backlog full; drop the attempt.
                self.conns.remove(&cid);
            }
        }
    }

    async fn dial(
        self: &Arc<Self>,
        remote_static_public_key: PublicKey,
        raddr: SocketAddr,
        timeout: Duration,
    ) -> Result<Connection> {
        if let Some(err) = self.close_err() {
            return Err(err);
        }

        let cid = ConnId::random();
        let hsk = Arc::new(Handshaker::new(cid, raddr));
        match self.conns.entry(cid) {
            Entry::Occupied(_) => return Err(Error::Again),
            Entry::Vacant(v) => {
                v.insert(Handler::Handshaker(hsk.clone()));
            }
        }
        // Whatever happens below, never leave a dangling handshaker
        // behind, even if this future is dropped mid-await.
        let mut guard = ConnsGuard { shared: self.as_ref(), cid, armed: true };

        let mut hs = Handshake::new(
            NOISE_PROLOGUE,
            self.config.private_key.as_bytes(),
            Some(remote_static_public_key.as_bytes()),
            rand::random(),
            Role::Initiator,
        );

        match tokio::time::timeout(timeout, hsk.handshake(self, &mut hs)).await {
            Ok(Ok(())) => {
                let (c1, c2, _) = hs.split();
                let conn = ConnInner::new(self.clone(), cid, c2, c1, raddr);
                self.conns.insert(cid, Handler::Conn(conn.clone()));
                guard.armed = false;
                conn.spawn();
                debug!("[{cid}] connected to {raddr}");
                Ok(Connection { inner: conn })
            }
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Err(Error::Timeout),
        }
    }
}

struct ConnsGuard<'a> {
    shared: &'a MuxShared,
    cid: ConnId,
    armed: bool,
}

impl Drop for ConnsGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.conns.remove(&self.cid);
        }
    }
}

/// A UDP endpoint multiplexing any number of connections, inbound and
/// outbound. Cheap to clone.
#[derive(Clone)]
pub struct Mux {
    shared: Arc<MuxShared>,
}

impl Mux {
    /// Binds `laddr` and starts dispatching. With `config.listen` unset,
    /// inbound handshakes are ignored and the mux only dials out.
    pub async fn listen(laddr: SocketAddr, config: Config) -> Result<Mux> {
        let endpoint = Endpoint::bind(laddr).await?;
        info!("mux bound to {}", endpoint.local_addr()?);

        let (accept_tx, accept_rx) = mpsc::channel(BACKLOG);
        let shared = Arc::new(MuxShared {
            endpoint,
            config,
            conns: DashMap::new(),
            jar: DashMap::new(),
            auth: Mutex::new(None),
            close: Mutex::new(None),
            closed_notify: Notify::new(),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
        });
        tokio::spawn(shared.clone().run());
        Ok(Mux { shared })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.endpoint.local_addr()?)
    }

    /// Waits for the next accepted inbound connection.
    pub async fn accept(&self) -> Result<Connection> {
        let mut closed = pin!(self.shared.closed_notify.notified());
        closed.as_mut().enable();
        if let Some(err) = self.shared.close_err() {
            return Err(err);
        }

        let mut rx = self.shared.accept_rx.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or(Error::Closed),
            _ = closed => Err(self.shared.close_err().unwrap_or(Error::Closed)),
        }
    }

    /// Dials `raddr` once, with a deadline. Fails with [`Error::Again`]
    /// when the server demands a cookie round-trip first; redialing
    /// presents the received cookie. See [`crate::dial`] for the retrying
    /// convenience wrapper.
    ///
    /// When this returns, the peer may not have completed the handshake
    /// yet.
    pub async fn dial(
        &self,
        remote_static_public_key: PublicKey,
        raddr: SocketAddr,
        timeout: Duration,
    ) -> Result<Connection> {
        self.shared.dial(remote_static_public_key, raddr, timeout).await
    }

    /// Shuts down the mux and all its connections. Connections close with
    /// a best-effort CLOSE packet; peers that miss it fall back on their
    /// own timeouts.
    pub async fn close(&self) {
        self.shared.close_with_error(Error::Closed);
    }
}
