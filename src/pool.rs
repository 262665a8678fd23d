//! Client connection pooling keyed on [`EndpointKey`].

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    future::Future,
    ops::Deref,
    pin::Pin,
    rc::Rc,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use actix_codec::{AsyncRead, AsyncWrite, ReadBuf};
use actix_rt::{
    task::JoinHandle,
    time::{sleep, Sleep},
};
use actix_service::Service;
use futures_core::future::LocalBoxFuture;
use futures_util::FutureExt as _;
use pin_project_lite::pin_project;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{
    config::{ConnectorConfig, PoolConfig},
    connection::ConnectionIo,
    endpoint::EndpointKey,
    error::ConnectError,
};

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Connection counts of one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections waiting in the idle set.
    pub idle: usize,

    /// Connections that are open, idle or checked out.
    pub live: usize,

    /// Connections currently used by an exchange.
    pub checked_out: usize,
}

/// Lifecycle of an [`Acquired`] connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Returned to the idle set.
    Idle,

    /// Owned by an exchange.
    CheckedOut,

    /// Closed and forgotten by the pool, never handed out again.
    Invalid,
}

/// Connection pool.
///
/// Connections are partitioned by [`EndpointKey`]; every key gets its own permits and idle set.
/// The pool is cheap to clone and clones share state.
pub struct ConnectionPool<S, Io>
where
    Io: ConnectionIo,
{
    connector: Rc<S>,
    inner: ConnectionPoolInner<Io>,
}

impl<S, Io> Clone for ConnectionPool<S, Io>
where
    Io: ConnectionIo,
{
    fn clone(&self) -> Self {
        Self {
            connector: self.connector.clone(),
            inner: self.inner.clone(),
        }
    }
}

/// wrapper type for check the ref count of Rc.
struct ConnectionPoolInner<Io>(Rc<ConnectionPoolInnerPriv<Io>>)
where
    Io: ConnectionIo;

impl<Io> ConnectionPoolInner<Io>
where
    Io: ConnectionIo,
{
    /// Starts the idle reaper of a dynamic pool, once.
    fn ensure_reaper(&self) {
        let PoolConfig::Dynamic { ttl, .. } = self.config.pool else {
            return;
        };

        let mut reaper = self.reaper.borrow_mut();
        if reaper.is_some() {
            return;
        }

        let pool = Rc::downgrade(&self.0);
        let period = (ttl / 2).max(MIN_REAP_INTERVAL);

        *reaper = Some(actix_rt::spawn(async move {
            let mut interval = actix_rt::time::interval(period);

            loop {
                interval.tick().await;

                match pool.upgrade() {
                    Some(pool) => pool.reap(),
                    None => break,
                }
            }
        }));
    }
}

impl<Io> Clone for ConnectionPoolInner<Io>
where
    Io: ConnectionIo,
{
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<Io> Deref for ConnectionPoolInner<Io>
where
    Io: ConnectionIo,
{
    type Target = ConnectionPoolInnerPriv<Io>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<Io> Drop for ConnectionPoolInner<Io>
where
    Io: ConnectionIo,
{
    fn drop(&mut self) {
        // When strong count is one it means the pool is dropped
        // remove and drop all Io types.
        if Rc::strong_count(&self.0) == 1 {
            self.shutdown();
        }
    }
}

struct IdleConnection<Io> {
    id: u64,
    io: Io,
    created: Instant,
    used: Instant,
}

/// Per-endpoint bookkeeping. `live` counts idle and checked out connections.
struct Slots<Io> {
    idle: VecDeque<IdleConnection<Io>>,
    live: usize,
    checked_out: usize,
    permits: Option<Arc<Semaphore>>,
}

impl<Io> Slots<Io> {
    fn new(pool: &PoolConfig) -> Self {
        Slots {
            idle: VecDeque::new(),
            live: 0,
            checked_out: 0,
            permits: pool
                .capacity()
                .map(|size| Arc::new(Semaphore::new(size.min(Semaphore::MAX_PERMITS)))),
        }
    }

    /// No connection exists and nobody holds or waits for a permit.
    fn is_unused(&self, pool: &PoolConfig) -> bool {
        let permits_free = match (&self.permits, pool.capacity()) {
            (Some(permits), Some(size)) => {
                permits.available_permits() == size.min(Semaphore::MAX_PERMITS)
            }
            _ => true,
        };

        self.live == 0 && self.checked_out == 0 && self.idle.is_empty() && permits_free
    }
}

struct ConnectionPoolInnerPriv<Io>
where
    Io: ConnectionIo,
{
    config: ConnectorConfig,
    available: RefCell<HashMap<EndpointKey, Slots<Io>>>,
    reaper: RefCell<Option<JoinHandle<()>>>,
    next_id: Cell<u64>,
}

impl<Io> ConnectionPoolInnerPriv<Io>
where
    Io: ConnectionIo,
{
    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));
        id
    }

    /// Permits of the endpoint, `None` when the pool is unbounded.
    fn permits(&self, key: &EndpointKey) -> Option<Arc<Semaphore>> {
        self.available
            .borrow_mut()
            .entry(key.clone())
            .or_insert_with(|| Slots::new(&self.config.pool))
            .permits
            .clone()
    }

    /// Pops the most suitable idle connection and marks it checked out.
    ///
    /// Expired or tainted connections met on the way are closed.
    fn checkout_idle(&self, key: &EndpointKey) -> Option<IdleConnection<Io>> {
        let now = Instant::now();
        let mut closed = Vec::new();

        let found = {
            let mut available = self.available.borrow_mut();
            let slots = available.get_mut(key)?;
            let mut found = None;

            while let Some(mut c) = slots.idle.pop_front() {
                if now.saturating_duration_since(c.used) > self.config.conn_keep_alive
                    || now.saturating_duration_since(c.created) > self.config.conn_lifetime
                {
                    slots.live -= 1;
                    closed.push(c.io);
                    continue;
                }

                let state = ConnectionCheckFuture { io: &mut c.io }.now_or_never();

                match state {
                    // peer sent bytes nobody asked for, close it gracefully
                    Some(Liveness::Tainted) => {
                        slots.live -= 1;
                        closed.push(c.io);
                    }

                    // socket is gone, nothing to shut down
                    Some(Liveness::Skip) | None => {
                        slots.live -= 1;
                    }

                    Some(Liveness::Live) => {
                        slots.checked_out += 1;
                        found = Some(c);
                        break;
                    }
                }
            }

            found
        };

        for io in closed {
            self.close(io);
        }

        found
    }

    /// Records a freshly connected transport as checked out.
    fn register(&self, key: &EndpointKey) {
        let mut available = self.available.borrow_mut();
        let slots = available
            .entry(key.clone())
            .or_insert_with(|| Slots::new(&self.config.pool));

        slots.live += 1;
        slots.checked_out += 1;
    }

    /// Puts a checked out connection into the idle set.
    fn release(&self, key: &EndpointKey, id: u64, io: Io, created: Instant) {
        let mut available = self.available.borrow_mut();

        match available.get_mut(key) {
            Some(slots) => {
                debug_assert!(slots.checked_out > 0);
                slots.checked_out -= 1;
                slots.idle.push_back(IdleConnection {
                    id,
                    io,
                    created,
                    used: Instant::now(),
                });
            }
            None => {
                drop(available);
                self.close(io);
            }
        }
    }

    /// Forgets a checked out connection.
    fn discard(&self, key: &EndpointKey) {
        let mut available = self.available.borrow_mut();

        if let Some(slots) = available.get_mut(key) {
            debug_assert!(slots.live > 0 && slots.checked_out > 0);
            slots.live -= 1;
            slots.checked_out -= 1;

            if slots.is_unused(&self.config.pool) {
                available.remove(key);
            }
        }
    }

    /// Takes the idle connection `id` out of the pool, if it is still idle.
    fn evict(&self, key: &EndpointKey, id: u64) -> Option<Io> {
        let mut available = self.available.borrow_mut();
        let slots = available.get_mut(key)?;
        let pos = slots.idle.iter().position(|c| c.id == id)?;
        let c = slots.idle.remove(pos)?;

        debug_assert!(slots.live > 0);
        slots.live -= 1;

        if slots.is_unused(&self.config.pool) {
            available.remove(key);
        }

        Some(c.io)
    }

    /// Closes idle connections unused for the dynamic pool's ttl while above its minimum.
    fn reap(&self) {
        let PoolConfig::Dynamic { minimum, ttl, .. } = self.config.pool else {
            return;
        };

        let now = Instant::now();
        let mut expired = Vec::new();

        let mut available = self.available.borrow_mut();

        for (key, slots) in available.iter_mut() {
            let before = expired.len();
            let mut kept = VecDeque::with_capacity(slots.idle.len());

            for c in slots.idle.drain(..) {
                if slots.live > minimum && now.saturating_duration_since(c.used) >= ttl {
                    slots.live -= 1;
                    expired.push(c.io);
                } else {
                    kept.push_back(c);
                }
            }

            slots.idle = kept;

            if expired.len() > before {
                log::trace!(
                    "reaped {} idle connection(s) to {key}",
                    expired.len() - before
                );
            }
        }

        let pool = &self.config.pool;
        available.retain(|_, slots| !slots.is_unused(pool));
        drop(available);

        for io in expired {
            self.close(io);
        }
    }

    fn stats(&self, key: &EndpointKey) -> PoolStats {
        self.available
            .borrow()
            .get(key)
            .map(|slots| PoolStats {
                idle: slots.idle.len(),
                live: slots.live,
                checked_out: slots.checked_out,
            })
            .unwrap_or_default()
    }

    fn close(&self, io: Io) {
        if let Some(timeout) = self.config.disconnect_timeout {
            if tokio::runtime::Handle::try_current().is_ok() {
                actix_rt::spawn(CloseConnection::new(io, timeout));
            }
        }
    }

    fn shutdown(&self) {
        if let Some(reaper) = self.reaper.borrow_mut().take() {
            reaper.abort();
        }

        let available = std::mem::take(&mut *self.available.borrow_mut());

        for slots in available.into_values() {
            if let Some(permits) = slots.permits {
                permits.close();
            }

            for c in slots.idle {
                self.close(c.io);
            }
        }
    }
}

impl<S, Io> ConnectionPool<S, Io>
where
    Io: ConnectionIo,
{
    /// Construct a new connection pool.
    ///
    /// [`super::config::ConnectorConfig`]'s pool policy is used as the per endpoint limit of
    /// live connections.
    pub fn new(connector: S, mut config: ConnectorConfig) -> Self {
        config.pool = config.pool.normalize();

        let inner = ConnectionPoolInner(Rc::new(ConnectionPoolInnerPriv {
            config,
            available: RefCell::new(HashMap::new()),
            reaper: RefCell::new(None),
            next_id: Cell::new(0),
        }));

        Self {
            connector: Rc::new(connector),
            inner,
        }
    }

    /// Whether connections may be returned to the pool after an exchange.
    pub fn enable_keep_alive(&self) -> bool {
        self.inner.config.pool.keep_alive()
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    /// Connection counts of `key`.
    pub fn stats(&self, key: &EndpointKey) -> PoolStats {
        self.inner.stats(key)
    }
}

impl<S, Io> ConnectionPool<S, Io>
where
    S: Service<EndpointKey, Response = Io, Error = ConnectError> + 'static,
    Io: ConnectionIo,
{
    /// Checks out a connection to `key`.
    ///
    /// Waits in FIFO order while the endpoint is at capacity. An idle connection is preferred
    /// over opening a new one. Dropping the returned future before it resolves gives the slot
    /// back.
    pub fn acquire(
        &self,
        key: EndpointKey,
    ) -> LocalBoxFuture<'static, Result<Acquired<Io>, ConnectError>> {
        let connector = self.connector.clone();
        let inner = self.inner.clone();

        Box::pin(async move {
            inner.ensure_reaper();

            // acquire an owned permit and carry it with connection
            let permit = match inner.permits(&key) {
                Some(permits) => Some(
                    permits
                        .acquire_owned()
                        .await
                        // semaphore is only closed when the pool shuts down
                        .map_err(|_| ConnectError::Disconnected)?,
                ),
                None => None,
            };

            if let Some(c) = inner.checkout_idle(&key) {
                log::trace!("reusing idle connection to {key}");
                return Ok(Acquired::new(key, inner, permit, c.id, c.io, c.created));
            }

            log::trace!("opening new connection to {key}");

            // the permit goes out with this future if connecting fails
            let io = connector.call(key.clone()).await?;
            inner.register(&key);

            Ok(Acquired::new(key, inner, permit, 0, io, Instant::now()))
        })
    }
}

impl<S, Io> Service<EndpointKey> for ConnectionPool<S, Io>
where
    S: Service<EndpointKey, Response = Io, Error = ConnectError> + 'static,
    Io: ConnectionIo,
{
    type Response = Acquired<Io>;
    type Error = ConnectError;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    actix_service::forward_ready!(connector);

    fn call(&self, key: EndpointKey) -> Self::Future {
        self.acquire(key)
    }
}

enum Liveness {
    Live,
    Tainted,
    Skip,
}

struct ConnectionCheckFuture<'a, Io> {
    io: &'a mut Io,
}

impl<Io> Future for ConnectionCheckFuture<'_, Io>
where
    Io: AsyncRead + Unpin,
{
    type Output = Liveness;

    // this future is only used to get access to Context.
    // It should never return Poll::Pending.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut buf = [0; 2];
        let mut read_buf = ReadBuf::new(&mut buf);

        let state = match Pin::new(&mut this.io).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) if !read_buf.filled().is_empty() => Liveness::Tainted,

            Poll::Pending => Liveness::Live,
            _ => Liveness::Skip,
        };

        Poll::Ready(state)
    }
}

pin_project! {
    #[project = CloseConnectionProj]
    struct CloseConnection<Io> {
        io: Io,
        #[pin]
        timeout: Sleep,
    }
}

impl<Io> CloseConnection<Io>
where
    Io: AsyncWrite + Unpin,
{
    fn new(io: Io, timeout: Duration) -> Self {
        CloseConnection {
            io,
            timeout: sleep(timeout),
        }
    }
}

impl<Io> Future for CloseConnection<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();

        match this.timeout.poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Pin::new(this.io).poll_shutdown(cx).map(|_| ()),
        }
    }
}

/// A connection checked out of the pool.
///
/// [`release`](Self::release) hands the transport back for reuse and
/// [`invalidate`](Self::invalidate) closes it. A released connection can still be invalidated
/// while it sits in the idle set. Dropping a connection that is still checked out invalidates
/// it.
pub struct Acquired<Io>
where
    Io: ConnectionIo,
{
    key: EndpointKey,
    inner: ConnectionPoolInner<Io>,
    /// capacity slot, held until the verdict. `None` for unbounded pools.
    permit: Option<OwnedSemaphorePermit>,
    /// id of the idle entry this handle released last
    id: u64,
    io: Option<Io>,
    created: Instant,
    state: ConnectionState,
}

impl<Io> Acquired<Io>
where
    Io: ConnectionIo,
{
    fn new(
        key: EndpointKey,
        inner: ConnectionPoolInner<Io>,
        permit: Option<OwnedSemaphorePermit>,
        id: u64,
        io: Io,
        created: Instant,
    ) -> Self {
        Acquired {
            key,
            inner,
            permit,
            id,
            io: Some(io),
            created,
            state: ConnectionState::CheckedOut,
        }
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Time the transport was opened.
    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn io_mut(&mut self) -> Option<&mut Io> {
        self.io.as_mut()
    }

    /// Takes the transport out to hand it to a driver.
    pub fn take_io(&mut self) -> Option<Io> {
        self.io.take()
    }

    /// Returns the transport to the idle set.
    ///
    /// Under [`PoolConfig::Disabled`] this invalidates instead. Releasing a connection that is
    /// no longer checked out only closes `io`.
    pub fn release(&mut self, io: Io) {
        if self.state != ConnectionState::CheckedOut {
            self.inner.close(io);
            return;
        }

        if !self.inner.config.pool.keep_alive() {
            self.io = Some(io);
            self.invalidate();
            return;
        }

        // a fresh id per release, so this handle can only ever evict its own idle entry
        self.id = self.inner.next_id();
        self.inner.release(&self.key, self.id, io, self.created);
        self.state = ConnectionState::Idle;

        // idle set first, then the slot: the next waiter picks this connection up
        self.permit.take();
    }

    /// Closes the transport and frees its slot.
    ///
    /// Idempotent. A released connection is removed from the idle set and closed; if another
    /// acquirer already took it, only this handle is marked invalid.
    pub fn invalidate(&mut self) {
        match self.state {
            ConnectionState::Invalid => return,
            ConnectionState::Idle => {
                self.state = ConnectionState::Invalid;

                if let Some(io) = self.inner.evict(&self.key, self.id) {
                    log::trace!("closing released connection to {}", self.key);
                    self.inner.close(io);
                }

                return;
            }
            ConnectionState::CheckedOut => {}
        }

        self.state = ConnectionState::Invalid;

        if let Some(io) = self.io.take() {
            self.inner.close(io);
        }

        // slot first, so an endpoint left without connections or waiters can be dropped
        self.permit.take();
        self.inner.discard(&self.key);
    }
}

impl<Io> Drop for Acquired<Io>
where
    Io: ConnectionIo,
{
    fn drop(&mut self) {
        if self.state == ConnectionState::CheckedOut {
            log::debug!("connection to {} dropped while checked out", self.key);
            self.invalidate();
        }
    }
}
