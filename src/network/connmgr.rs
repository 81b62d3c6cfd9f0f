//! Connection manager
//!
//! Owns the lifecycle of outbound connection requests and the accept loops
//! of our listeners. A single control task owns the pending and established
//! request maps; everything else talks to it over a bounded queue.

use crate::network::server::connect_to_peer;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Base delay between connection retries
pub const DEFAULT_RETRY_DURATION: Duration = Duration::from_secs(5);

/// Cap on the delay between retries of a permanent request
pub const MAX_RETRY_DURATION: Duration = Duration::from_secs(5 * 60);

/// Outbound connections kept open by default
pub const DEFAULT_TARGET_OUTBOUND: usize = 8;

/// Consecutive failures before new attempts are throttled
pub const MAX_FAILED_ATTEMPTS: u64 = 25;

/// How long a single dial may take
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

const REQUEST_QUEUE_SIZE: usize = 128;

/// Connection manager errors
#[derive(Error, Debug)]
pub enum ConnError {
    #[error("Connection manager is stopped")]
    Stopped,

    #[error("No valid connect address: {0}")]
    NoAddress(String),

    #[error("Connection request has no address")]
    MissingAddress,

    #[error("Dial failed: {0}")]
    DialFailed(#[from] std::io::Error),
}

/// State of a connection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Pending,
    Failing,
    Canceled,
    Established,
    Disconnected,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Pending => "pending",
            ConnState::Failing => "failing",
            ConnState::Canceled => "canceled",
            ConnState::Established => "established",
            ConnState::Disconnected => "disconnected",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
struct ConnReqState {
    addr: Option<SocketAddr>,
    state: ConnState,
    retry_count: u32,
    ban: bool,
}

/// A request to keep a connection to some address
#[derive(Debug)]
pub struct ConnReq {
    id: AtomicU64,
    permanent: bool,
    inner: Mutex<ConnReqState>,
}

impl ConnReq {
    /// Request a connection to a known address
    pub fn new(addr: SocketAddr, permanent: bool) -> Self {
        Self::build(Some(addr), permanent)
    }

    fn unassigned() -> Self {
        Self::build(None, false)
    }

    fn build(addr: Option<SocketAddr>, permanent: bool) -> Self {
        Self {
            id: AtomicU64::new(0),
            permanent,
            inner: Mutex::new(ConnReqState {
                addr,
                state: ConnState::Pending,
                retry_count: 0,
                ban: false,
            }),
        }
    }

    /// Id assigned by the manager, 0 until registered
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.inner.lock().addr
    }

    pub fn permanent(&self) -> bool {
        self.permanent
    }

    pub fn state(&self) -> ConnState {
        self.inner.lock().state
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.lock().retry_count
    }

    /// Delay the next replacement for this request as if it were banned
    pub fn mark_banned(&self) {
        self.inner.lock().ban = true;
    }

    fn set_addr(&self, addr: SocketAddr) {
        self.inner.lock().addr = Some(addr);
    }

    fn update_state(&self, state: ConnState) {
        self.inner.lock().state = state;
    }

    fn bump_retry(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.retry_count += 1;
        inner.retry_count
    }

    fn take_ban(&self) -> bool {
        std::mem::take(&mut self.inner.lock().ban)
    }
}

impl fmt::Display for ConnReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr() {
            Some(addr) => write!(f, "{} (reqid {})", addr, self.id()),
            None => write!(f, "reqid {}", self.id()),
        }
    }
}

/// Delay before the `retry_count`-th retry of a permanent request
pub fn retry_delay(retry_count: u32, base: Duration, max: Duration) -> Duration {
    base.saturating_mul(retry_count).min(max)
}

/// Opens a TCP connection
pub type DialFn =
    Arc<dyn Fn(SocketAddr) -> BoxFuture<'static, std::io::Result<TcpStream>> + Send + Sync>;

/// Supplies the next address to dial
pub type AddressSource =
    Arc<dyn Fn() -> BoxFuture<'static, Result<SocketAddr, ConnError>> + Send + Sync>;

/// Receives the sockets the manager produces
pub trait ConnHandler: Send + Sync + 'static {
    /// A listener accepted an inbound connection
    fn on_accept(&self, stream: TcpStream, addr: SocketAddr);

    /// An outbound request connected
    fn on_connection(&self, req: Arc<ConnReq>, stream: TcpStream);

    /// An established request was torn down
    fn on_disconnection(&self, _req: Arc<ConnReq>) {}
}

/// Connection manager settings
#[derive(Clone)]
pub struct ConnManagerConfig {
    pub target_outbound: usize,
    pub retry_duration: Duration,
    pub max_retry_duration: Duration,
    pub dial_timeout: Duration,
    /// Custom dialer; TCP with `dial_timeout` when unset
    pub dial: Option<DialFn>,
    /// Source of addresses for automatic outbound connections
    pub get_new_address: Option<AddressSource>,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        Self {
            target_outbound: DEFAULT_TARGET_OUTBOUND,
            retry_duration: DEFAULT_RETRY_DURATION,
            max_retry_duration: MAX_RETRY_DURATION,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            dial: None,
            get_new_address: None,
        }
    }
}

enum ConnRequest {
    RegisterPending {
        req: Arc<ConnReq>,
        done: oneshot::Sender<()>,
    },
    Connected {
        req: Arc<ConnReq>,
        stream: TcpStream,
    },
    Disconnected {
        id: u64,
        retry: bool,
    },
    Failed {
        req: Arc<ConnReq>,
        err: ConnError,
    },
}

/// Resolves once `stop` has run, even for a receiver subscribed after it
async fn wait_stopped(quit: &mut watch::Receiver<bool>) {
    let _ = quit.wait_for(|stopped| *stopped).await;
}

struct Shared {
    config: ConnManagerConfig,
    dial: DialFn,
    handler: Arc<dyn ConnHandler>,
    req_count: AtomicU64,
    failed_attempts: AtomicU64,
    requests: mpsc::Sender<ConnRequest>,
    requests_rx: Mutex<Option<mpsc::Receiver<ConnRequest>>>,
    listeners: Mutex<Vec<TcpListener>>,
    listen_addrs: Vec<SocketAddr>,
    quit: watch::Sender<bool>,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the connection manager
#[derive(Clone)]
pub struct ConnManager {
    shared: Arc<Shared>,
}

impl ConnManager {
    pub fn new(
        config: ConnManagerConfig,
        listeners: Vec<TcpListener>,
        handler: Arc<dyn ConnHandler>,
    ) -> Self {
        let dial: DialFn = match config.dial.clone() {
            Some(dial) => dial,
            None => {
                let timeout = config.dial_timeout;
                Arc::new(move |addr: SocketAddr| connect_to_peer(addr, timeout).boxed())
            }
        };
        let (requests, requests_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let (quit, _) = watch::channel(false);
        // The listeners move into their tasks on start
        let listen_addrs = listeners
            .iter()
            .filter_map(|l| l.local_addr().ok())
            .collect();

        Self {
            shared: Arc::new(Shared {
                config,
                dial,
                handler,
                req_count: AtomicU64::new(0),
                failed_attempts: AtomicU64::new(0),
                requests,
                requests_rx: Mutex::new(Some(requests_rx)),
                listeners: Mutex::new(listeners),
                listen_addrs,
                quit,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Addresses the listeners are bound to
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.shared.listen_addrs.clone()
    }

    fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Start the control loop, the listeners and the automatic outbound
    /// connections
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }

        log::trace!("Connection manager started");
        let mut tasks = Vec::new();

        if let Some(rx) = self.shared.requests_rx.lock().take() {
            let manager = self.clone();
            tasks.push(tokio::spawn(manager.conn_handler(rx)));
        }

        for listener in self.shared.listeners.lock().drain(..) {
            let manager = self.clone();
            tasks.push(tokio::spawn(manager.listen_handler(listener)));
        }

        self.shared.tasks.lock().extend(tasks);

        if self.shared.config.get_new_address.is_some() {
            for _ in 0..self.shared.config.target_outbound {
                let manager = self.clone();
                tokio::spawn(async move { manager.new_conn_req().await });
            }
        }
    }

    /// Stop every task; returns once the control loop and listeners exited
    pub async fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            log::warn!("Connection manager already stopped");
            return;
        }

        self.shared.quit.send_replace(true);
        let tasks: Vec<_> = self.shared.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Connection manager task failed: {}", e);
            }
        }
        log::trace!("Connection manager stopped");
    }

    async fn send(&self, request: ConnRequest) -> bool {
        self.shared.requests.send(request).await.is_ok()
    }

    async fn register_pending(&self, req: &Arc<ConnReq>) -> bool {
        let (done, registered) = oneshot::channel();
        if !self
            .send(ConnRequest::RegisterPending {
                req: Arc::clone(req),
                done,
            })
            .await
        {
            return false;
        }
        registered.await.is_ok()
    }

    /// Open a fresh request to whatever address the source hands out
    pub async fn new_conn_req(&self) {
        if self.is_stopped() {
            return;
        }
        let Some(get_new_address) = self.shared.config.get_new_address.clone() else {
            return;
        };

        let req = Arc::new(ConnReq::unassigned());
        req.id
            .store(self.shared.req_count.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
        if !self.register_pending(&req).await {
            return;
        }

        match get_new_address().await {
            Ok(addr) => {
                req.set_addr(addr);
                self.connect(req).await;
            }
            Err(err) => {
                self.send(ConnRequest::Failed { req, err }).await;
            }
        }
    }

    /// Dial the request's address and report the outcome to the control loop
    pub async fn connect(&self, req: Arc<ConnReq>) {
        if self.is_stopped() {
            return;
        }
        if req.state() == ConnState::Canceled {
            log::debug!("Ignoring connect for canceled connreq={}", req);
            return;
        }

        if req.id() == 0 {
            req.id
                .store(self.shared.req_count.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
            if !self.register_pending(&req).await {
                return;
            }
        }

        let Some(addr) = req.addr() else {
            self.send(ConnRequest::Failed {
                req,
                err: ConnError::MissingAddress,
            })
            .await;
            return;
        };

        log::debug!("Attempting to connect to {}", req);
        match (self.shared.dial)(addr).await {
            Ok(stream) => {
                self.send(ConnRequest::Connected { req, stream }).await;
            }
            Err(e) => {
                self.send(ConnRequest::Failed {
                    req,
                    err: ConnError::DialFailed(e),
                })
                .await;
            }
        }
    }

    /// Tear down a request, reconnecting when policy says so
    pub async fn disconnect(&self, id: u64) {
        if self.is_stopped() {
            return;
        }
        self.send(ConnRequest::Disconnected { id, retry: true })
            .await;
    }

    /// Tear down a request and never reconnect it
    pub async fn remove(&self, id: u64) {
        if self.is_stopped() {
            return;
        }
        self.send(ConnRequest::Disconnected { id, retry: false })
            .await;
    }

    /// Run `task` after `delay` unless the manager stops first
    fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut quit = self.shared.quit.subscribe();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_stopped(&mut quit) => return,
                }
            }
            task.await;
        });
    }

    fn handle_failed_conn(&self, req: Arc<ConnReq>) {
        if self.is_stopped() {
            return;
        }

        let base = self.shared.config.retry_duration;
        if req.permanent() {
            let count = req.bump_retry();
            let delay = retry_delay(count, base, self.shared.config.max_retry_duration);
            log::debug!("Retrying connection to {} in {:?}", req, delay);
            let manager = self.clone();
            self.schedule(delay, async move { manager.connect(req).await });
            return;
        }

        if self.shared.config.get_new_address.is_none() {
            return;
        }

        let attempts = self.shared.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let manager = self.clone();
        if req.take_ban() {
            log::debug!("Replacing banned request {} in {:?}", req, base * 2);
            self.schedule(base * 2, async move { manager.new_conn_req().await });
        } else if attempts >= MAX_FAILED_ATTEMPTS {
            log::trace!(
                "Max failed connection attempts reached: [{}] -- retrying connection in: {:?}",
                MAX_FAILED_ATTEMPTS,
                base
            );
            self.schedule(base, async move { manager.new_conn_req().await });
        } else {
            self.schedule(Duration::ZERO, async move { manager.new_conn_req().await });
        }
    }

    async fn conn_handler(self, mut rx: mpsc::Receiver<ConnRequest>) {
        let mut quit = self.shared.quit.subscribe();
        let mut pending: HashMap<u64, Arc<ConnReq>> = HashMap::new();
        let mut conns: HashMap<u64, Arc<ConnReq>> = HashMap::new();

        loop {
            let request = tokio::select! {
                biased;
                _ = wait_stopped(&mut quit) => break,
                request = rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            match request {
                ConnRequest::RegisterPending { req, done } => {
                    req.update_state(ConnState::Pending);
                    pending.insert(req.id(), req);
                    let _ = done.send(());
                }

                ConnRequest::Connected { req, stream } => {
                    let id = req.id();
                    if pending.remove(&id).is_none() {
                        log::debug!("Ignoring connection for canceled connreq={}", req);
                        drop(stream);
                        continue;
                    }

                    req.update_state(ConnState::Established);
                    req.inner.lock().retry_count = 0;
                    self.shared.failed_attempts.store(0, Ordering::SeqCst);
                    conns.insert(id, Arc::clone(&req));
                    log::debug!("Connected to {}", req);

                    self.shared.handler.on_connection(req, stream);
                }

                ConnRequest::Disconnected { id, retry } => {
                    if let Some(req) = conns.remove(&id) {
                        log::debug!("Disconnected from {}", req);
                        self.shared.handler.on_disconnection(Arc::clone(&req));

                        if !retry {
                            req.update_state(ConnState::Disconnected);
                            continue;
                        }

                        if req.permanent() {
                            req.update_state(ConnState::Pending);
                            pending.insert(id, Arc::clone(&req));
                            self.handle_failed_conn(req);
                        } else {
                            // Retired; a fresh request takes its place
                            req.update_state(ConnState::Disconnected);
                            if conns.len() < self.shared.config.target_outbound {
                                self.handle_failed_conn(req);
                            }
                        }
                    } else if let Some(req) = pending.remove(&id) {
                        req.update_state(ConnState::Canceled);
                        log::debug!("Canceling: {}", req);
                    } else {
                        log::error!("Unknown connid={}", id);
                    }
                }

                ConnRequest::Failed { req, err } => {
                    let id = req.id();
                    if !pending.contains_key(&id) {
                        log::debug!("Ignoring connection error for canceled connreq={}", req);
                        continue;
                    }

                    req.update_state(ConnState::Failing);
                    let attempts = self.shared.failed_attempts.load(Ordering::SeqCst);
                    if attempts >= MAX_FAILED_ATTEMPTS {
                        log::trace!("Failed to connect to {}: {}", req, err);
                    } else {
                        log::debug!("Failed to connect to {}: {}", req, err);
                    }

                    if !req.permanent() {
                        pending.remove(&id);
                    }
                    self.handle_failed_conn(req);
                }
            }
        }

        log::trace!("Connection handler done");
    }

    async fn listen_handler(self, listener: TcpListener) {
        let mut quit = self.shared.quit.subscribe();
        let local = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        log::info!("Server listening on {}", local);

        loop {
            tokio::select! {
                _ = wait_stopped(&mut quit) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.shared.handler.on_accept(stream, addr),
                    Err(e) => {
                        if !self.is_stopped() {
                            log::error!("Can't accept connection: {}", e);
                        }
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        log::trace!("Listener handler done for {}", local);
    }
}
