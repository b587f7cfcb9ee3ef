/// Socket ownership, liveness and reconnect supervision.
///
/// ```text
/// ConnectionSupervisor
///   ├── Link (TcpStream, socket2 keepalive + timeouts)
///   ├── ClientIdentity + SessionKey from the last handshake
///   └── recovery: up to max_reconnects cycles of
///         sleep(reconnect_delay) → connect → handshake → rebuild request
/// ```
///
/// Only [`TransferError::Network`] triggers recovery. Everything else is
/// handed straight back to the caller.

use std::io::{ErrorKind, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};
use strongbox_crypto::SessionKey;
use strongbox_types::events::{Phase, StatusEvent};
use strongbox_types::models::ClientId;
use tracing::{debug, info, warn};

use crate::config::{TransferConfig, TransferContext};
use crate::error::{Result, TransferError};
use crate::handshake::Handshake;
use crate::identity::{ClientIdentity, IdentityStore};
use crate::integrity::BoundedCounter;
use crate::protocol::{Request, Response, read_response};

/// Granularity of cancellation checks while waiting to reconnect.
const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// The kernel takes keepalive timings in whole seconds, minimum one.
const MIN_OS_KEEPALIVE: Duration = Duration::from_secs(1);

/// Request/response transport.
pub trait RequestChannel {
    fn send_request(&mut self, request: &Request) -> Result<()>;
    fn receive_response(&mut self) -> Result<Response>;

    fn exchange(&mut self, request: &Request) -> Result<Response> {
        self.send_request(request)?;
        self.receive_response()
    }
}

/// One TCP connection to the backup server.
pub struct Link {
    stream: TcpStream,
    peer: SocketAddr,
    last_activity: Instant,
}

impl Link {
    /// Connect with a bounded timeout and configure keepalive, `TCP_NODELAY`
    /// and per-operation I/O timeouts.
    pub fn open(addr: SocketAddr, config: &TransferConfig) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| TransferError::network("creating socket", e))?;

        let os_interval = config.keepalive_interval.max(MIN_OS_KEEPALIVE);
        let keepalive = TcpKeepalive::new()
            .with_time(os_interval)
            .with_interval(os_interval);
        socket
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| TransferError::network("enabling keepalive", e))?;
        socket
            .set_nodelay(true)
            .map_err(|e| TransferError::network("setting TCP_NODELAY", e))?;

        socket
            .connect_timeout(&SockAddr::from(addr), config.connect_timeout)
            .map_err(|e| TransferError::network(&format!("connecting to {}", addr), e))?;

        socket
            .set_read_timeout(Some(config.io_timeout))
            .map_err(|e| TransferError::network("setting read timeout", e))?;
        socket
            .set_write_timeout(Some(config.io_timeout))
            .map_err(|e| TransferError::network("setting write timeout", e))?;

        Ok(Self {
            stream: socket.into(),
            peer: addr,
            last_activity: Instant::now(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Time since the last successful send or receive.
    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Non-blocking peek. A clean EOF or a hard error means the peer is gone;
    /// `WouldBlock` means the socket is open with nothing to read.
    pub fn is_alive(&self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut probe = [0u8; 1];
        let alive = match self.stream.peek(&mut probe) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) if e.kind() == ErrorKind::WouldBlock => true,
            Err(_) => false,
        };
        self.stream.set_nonblocking(false).is_ok() && alive
    }
}

impl RequestChannel for Link {
    fn send_request(&mut self, request: &Request) -> Result<()> {
        let frame = request.encode()?;
        self.stream
            .write_all(&frame)
            .and_then(|_| self.stream.flush())
            .map_err(|e| TransferError::network("sending request", e))?;
        self.last_activity = Instant::now();
        debug!(code = %request.code, bytes = frame.len(), "request sent");
        Ok(())
    }

    fn receive_response(&mut self) -> Result<Response> {
        let response = read_response(&mut self.stream)?;
        self.last_activity = Instant::now();
        debug!(code = %response.code, bytes = response.payload_size(), "response received");
        Ok(response)
    }
}

/// Resolve `host:port`, taking the first address.
pub fn resolve(server_addr: &str) -> Result<SocketAddr> {
    server_addr
        .to_socket_addrs()
        .map_err(|e| TransferError::network(&format!("resolving {}", server_addr), e))?
        .next()
        .ok_or_else(|| TransferError::Config(format!("{} resolved to no addresses", server_addr)))
}

/// A response plus whether the connection had to be re-established to get it.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub response: Response,
    pub recovered: bool,
}

/// Builds a request for the current identity and session key. Called again
/// after every reconnect, because the session key changes.
pub type RequestBuilder<'a> = dyn FnMut(ClientId, &SessionKey) -> Result<Request> + 'a;

/// What the transfer engine and integrity controller talk to.
pub trait Exchanger {
    fn client_id(&self) -> ClientId;

    /// Send a request and wait for its response, recovering the connection
    /// if needed.
    fn exchange_with(&mut self, build: &mut RequestBuilder<'_>) -> Result<Exchange>;

    /// Send a request that has no response. Returns whether recovery ran.
    fn send_with(&mut self, build: &mut RequestBuilder<'_>) -> Result<bool>;
}

/// Sole owner of the socket for a backup session.
pub struct ConnectionSupervisor {
    ctx: TransferContext,
    store: Arc<dyn IdentityStore>,
    link: Option<Link>,
    identity: Option<ClientIdentity>,
    session_key: Option<SessionKey>,
    /// Cycles spent on the current failure episode.
    reconnect: BoundedCounter,
    reconnects: u32,
}

impl ConnectionSupervisor {
    pub fn new(ctx: TransferContext, store: Arc<dyn IdentityStore>) -> Self {
        Self {
            reconnect: BoundedCounter::new(ctx.config.max_reconnects),
            ctx,
            store,
            link: None,
            identity: None,
            session_key: None,
            reconnects: 0,
        }
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some() && self.session_key.is_some()
    }

    /// Reconnect budget of the latest failure episode.
    pub fn reconnect_budget(&self) -> BoundedCounter {
        self.reconnect
    }

    /// Total successful reconnects over the supervisor's lifetime.
    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    /// Open a connection and run the handshake on it.
    pub fn connect(&mut self) -> Result<()> {
        self.ctx.cancel.check()?;
        self.ctx.emit(StatusEvent::Phase(Phase::Connecting));
        let addr = resolve(&self.ctx.config.server_addr)?;
        let mut link = Link::open(addr, &self.ctx.config)?;
        info!(peer = %addr, "connected");
        self.ctx.emit(StatusEvent::ConnectionState { connected: true });

        let mut handshake = Handshake::new(&self.ctx);
        let outcome = handshake.establish(
            &mut link,
            self.store.as_ref(),
            &self.ctx.config.username,
            self.identity.clone(),
        );
        match outcome {
            Ok((identity, key)) => {
                info!(client_id = %identity.client_id, "session established");
                self.identity = Some(identity);
                self.session_key = Some(key);
                self.link = Some(link);
                Ok(())
            }
            Err(e) => {
                drop(link);
                self.ctx.emit(StatusEvent::ConnectionState { connected: false });
                Err(e)
            }
        }
    }

    /// [`connect`](Self::connect) with the same bounded recovery as an
    /// exchange.
    pub fn open(&mut self) -> Result<()> {
        match self.connect() {
            Err(e) if e.is_network() => {
                self.reconnect.reset();
                self.recover(e)
            }
            other => other,
        }
    }

    /// Probe an idle link before using it; a dead one is dropped so the
    /// next exchange goes through recovery.
    pub fn keepalive(&mut self) {
        let interval = self.ctx.config.keepalive_interval;
        let dead = self
            .link
            .as_ref()
            .is_some_and(|link| link.idle() >= interval && !link.is_alive());
        if dead {
            warn!("idle connection found dead");
            self.drop_link();
        }
    }

    pub fn is_alive(&self) -> bool {
        self.link.as_ref().is_some_and(Link::is_alive)
    }

    /// Drop the connection and forget the session key.
    pub fn close(&mut self) {
        if self.link.is_some() {
            debug!("closing connection");
        }
        self.drop_link();
    }

    fn drop_link(&mut self) {
        self.session_key = None;
        if self.link.take().is_some() {
            self.ctx.emit(StatusEvent::ConnectionState { connected: false });
        }
    }

    /// Sleep `delay`, waking early to honour cancellation.
    fn pause(&self, delay: Duration) -> Result<()> {
        let deadline = Instant::now() + delay;
        loop {
            self.ctx.cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    /// Reconnect cycles for one failure episode, bounded by
    /// `max_reconnects`.
    fn recover(&mut self, cause: TransferError) -> Result<()> {
        let mut last = cause;
        while self.reconnect.try_increment() {
            warn!(attempt = %self.reconnect, error = %last, "connection lost, reconnecting");
            self.ctx.emit(StatusEvent::error(
                format!("connection lost ({}), reconnect {}", last, self.reconnect),
                false,
            ));
            self.pause(self.ctx.config.reconnect_delay)?;
            match self.connect() {
                Ok(()) => {
                    self.reconnects += 1;
                    return Ok(());
                }
                Err(e) if e.is_network() => last = e,
                Err(e) => return Err(e),
            }
        }
        Err(TransferError::Network(format!(
            "gave up after {} reconnect attempts: {}",
            self.reconnect.max(),
            last
        )))
    }

    fn supervised<T>(
        &mut self,
        build: &mut RequestBuilder<'_>,
        mut op: impl FnMut(&mut Link, &Request) -> Result<T>,
    ) -> Result<(T, bool)> {
        let mut recovered = false;
        loop {
            self.ctx.cancel.check()?;
            self.keepalive();
            let attempt = match (&self.identity, &self.session_key, self.link.as_mut()) {
                (Some(identity), Some(key), Some(link)) => {
                    let request = build(identity.client_id, key)?;
                    op(link, &request)
                }
                _ => Err(TransferError::Network("not connected".into())),
            };
            match attempt {
                Ok(value) => return Ok((value, recovered)),
                Err(e) if e.is_network() => {
                    self.drop_link();
                    if !recovered {
                        self.reconnect.reset();
                    }
                    self.recover(e)?;
                    recovered = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Exchanger for ConnectionSupervisor {
    fn client_id(&self) -> ClientId {
        self.identity
            .as_ref()
            .map(|i| i.client_id)
            .unwrap_or_else(ClientId::nil)
    }

    fn exchange_with(&mut self, build: &mut RequestBuilder<'_>) -> Result<Exchange> {
        let (response, recovered) = self.supervised(build, |link, req| link.exchange(req))?;
        Ok(Exchange { response, recovered })
    }

    fn send_with(&mut self, build: &mut RequestBuilder<'_>) -> Result<bool> {
        let ((), recovered) = self.supervised(build, |link, req| link.send_request(req))?;
        Ok(recovered)
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.close();
    }
}
