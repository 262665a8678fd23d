//! Request dispatch over pooled connections.
//!
//! A dispatch checks a connection out of the pool, hands it to the [`Driver`] and then waits
//! for two things independently: the response becoming ready and the exchange completing.
//! The caller gets the response as soon as it is ready. A background task waits for completion
//! and decides whether the connection goes back to the pool.
//!
//! Dropping a dispatch future that has not resolved yet interrupts the exchange and invalidates
//! the connection before the drop returns. A connection is never reused after a cancelled
//! exchange.

use std::{
    cell::{Cell, RefCell},
    future::ready,
    io,
    rc::Rc,
};

use actix_http::ResponseHead;
use actix_service::Service;
use futures_core::future::LocalBoxFuture;
use futures_util::future::{select, Either};
use tokio::sync::oneshot;

use crate::{
    channel::{reset_channel, Channel, ChannelState, Completion, Exchange},
    config::{ChannelOptions, EndpointConfig},
    connection::{ConnectionIo, Tunnel},
    driver::Driver,
    endpoint::EndpointKey,
    error::{ConnectError, InvalidUrl, SendRequestError},
    pool::{Acquired, ConnectionPool, ConnectionState},
    request::ClientRequest,
    response::ClientResponse,
};

/// Sends requests and produces responses.
///
/// Implemented by [`PooledDispatcher`] and by the decorators in
/// [`middleware`](crate::middleware), which wrap one dispatcher into another.
pub trait Dispatcher {
    fn dispatch(&self, req: ClientRequest)
        -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>>;

    /// Sends an upgrade request. The exchange lives on in the returned [`Tunnel`].
    fn dispatch_streaming(
        &self,
        req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<(ResponseHead, Tunnel), SendRequestError>>;
}

impl<D> Dispatcher for Rc<D>
where
    D: Dispatcher + ?Sized,
{
    fn dispatch(
        &self,
        req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        (**self).dispatch(req)
    }

    fn dispatch_streaming(
        &self,
        req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<(ResponseHead, Tunnel), SendRequestError>> {
        (**self).dispatch_streaming(req)
    }
}

/// [`Dispatcher`] that runs exchanges on connections from a [`ConnectionPool`].
pub struct PooledDispatcher<S, Io, D>
where
    Io: ConnectionIo,
{
    pool: ConnectionPool<S, Io>,
    driver: Rc<D>,
    endpoint: Rc<EndpointConfig>,
    aggregate: bool,
}

impl<S, Io, D> Clone for PooledDispatcher<S, Io, D>
where
    Io: ConnectionIo,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            driver: self.driver.clone(),
            endpoint: self.endpoint.clone(),
            aggregate: self.aggregate,
        }
    }
}

impl<S, Io, D> PooledDispatcher<S, Io, D>
where
    S: Service<EndpointKey, Response = Io, Error = ConnectError> + 'static,
    Io: ConnectionIo,
    D: Driver<Io>,
{
    pub fn new(pool: ConnectionPool<S, Io>, driver: D, endpoint: EndpointConfig) -> Self {
        PooledDispatcher {
            pool,
            driver: Rc::new(driver),
            endpoint: Rc::new(endpoint),
            aggregate: true,
        }
    }

    /// Ask the driver to buffer whole response bodies before resolving. Enabled by default.
    pub fn aggregate(mut self, aggregate: bool) -> Self {
        self.aggregate = aggregate;
        self
    }

    pub fn pool(&self) -> &ConnectionPool<S, Io> {
        &self.pool
    }

    /// Endpoint a request is sent to.
    pub fn endpoint(&self, req: &ClientRequest) -> Result<EndpointKey, InvalidUrl> {
        EndpointKey::from_uri(req.uri(), &self.endpoint)
    }

    /// Sends `req` over a connection to `key`.
    pub fn dispatch_to(
        &self,
        req: ClientRequest,
        key: EndpointKey,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        let driver = self.driver.clone();

        self.run(key, false, move |io, key, exchange, opts| {
            driver.send_request(io, key, req, exchange, opts)
        })
    }

    /// Sends the upgrade request `req` over a connection to `key`.
    pub fn dispatch_streaming_to(
        &self,
        req: ClientRequest,
        key: EndpointKey,
    ) -> LocalBoxFuture<'static, Result<(ResponseHead, Tunnel), SendRequestError>> {
        let driver = self.driver.clone();

        self.run(key, true, move |io, key, exchange, opts| {
            driver.open_tunnel(io, key, req, exchange, opts)
        })
    }

    fn run<T, F>(
        &self,
        key: EndpointKey,
        upgrade: bool,
        hand_off: F,
    ) -> LocalBoxFuture<'static, Result<T, SendRequestError>>
    where
        T: 'static,
        F: FnOnce(
                Io,
                &EndpointKey,
                Exchange<T>,
                ChannelOptions,
            ) -> LocalBoxFuture<'static, Result<D::Channel, SendRequestError>>
            + 'static,
    {
        let pool = self.pool.clone();
        let opts = ChannelOptions {
            aggregate: self.aggregate,
            keep_alive: pool.enable_keep_alive(),
        };

        Box::pin(async move {
            let (exchange, ready_rx, complete_rx) = Exchange::new();

            // until the finalizer owns the connection, dropping `acquired` invalidates it
            let mut acquired = pool.acquire(key).await?;

            let io = match acquired.take_io() {
                Some(io) => io,
                None => {
                    acquired.invalidate();
                    return Err(ConnectError::Disconnected.into());
                }
            };

            let channel = match hand_off(io, acquired.key(), exchange, opts).await {
                Ok(channel) => channel,
                Err(err) => {
                    log::debug!("failed to hand request to {}: {err}", acquired.key());
                    acquired.invalidate();
                    return Err(err);
                }
            };

            let (finalizer, interrupt_rx) = Finalizer::new(InFlight {
                channel,
                acquired,
                reuse: opts.keep_alive && !upgrade,
            });

            let handle = actix_rt::spawn(finalize(finalizer.clone(), complete_rx, interrupt_rx));
            let mut guard = InterruptOnDrop(Some(finalizer));

            match ready_rx.await {
                Ok(Ok(res)) => {
                    guard.disarm();
                    Ok(res)
                }

                Ok(Err(err)) => {
                    guard.interrupt();
                    let _ = handle.await;
                    Err(err)
                }

                Err(_) => {
                    guard.interrupt();
                    let _ = handle.await;
                    Err(SendRequestError::Send(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "driver dropped the exchange without a response",
                    )))
                }
            }
        })
    }
}

impl<S, Io, D> Dispatcher for PooledDispatcher<S, Io, D>
where
    S: Service<EndpointKey, Response = Io, Error = ConnectError> + 'static,
    Io: ConnectionIo,
    D: Driver<Io>,
{
    fn dispatch(
        &self,
        req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        match self.endpoint(&req) {
            Ok(key) => self.dispatch_to(req, key),
            Err(e) => Box::pin(ready(Err(SendRequestError::from(e)))),
        }
    }

    fn dispatch_streaming(
        &self,
        req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<(ResponseHead, Tunnel), SendRequestError>> {
        match self.endpoint(&req) {
            Ok(key) => self.dispatch_streaming_to(req, key),
            Err(e) => Box::pin(ready(Err(SendRequestError::from(e)))),
        }
    }
}

/// Channel and connection of an exchange whose verdict is pending.
struct InFlight<C: Channel> {
    channel: C,
    acquired: Acquired<C::Io>,
    reuse: bool,
}

impl<C: Channel> InFlight<C> {
    fn abort(mut self) {
        self.channel.interrupt();
        self.acquired.invalidate();
    }

    /// Hands a reusable transport back, or closes the connection.
    async fn settle(mut self, interrupted: &Cell<bool>) {
        match reset_channel(&mut self.channel).await {
            ChannelState::Reusable(io) if !interrupted.get() => {
                log::trace!("returning connection to {} to the pool", self.acquired.key());
                self.acquired.release(io);
            }
            ChannelState::Reusable(io) => {
                drop(io);
                self.abort();
            }
            ChannelState::Invalid => self.abort(),
        }
    }
}

impl<C: Channel> Drop for InFlight<C> {
    fn drop(&mut self) {
        if self.acquired.state() == ConnectionState::CheckedOut {
            self.channel.interrupt();
            self.acquired.invalidate();
        }
    }
}

/// State shared by the caller and the finalize task.
///
/// Whoever takes `in_flight` first owns the verdict.
struct Finalizer<C: Channel> {
    in_flight: RefCell<Option<InFlight<C>>>,
    interrupted: Cell<bool>,
    interrupt_tx: RefCell<Option<oneshot::Sender<()>>>,
}

impl<C: Channel> Finalizer<C> {
    fn new(in_flight: InFlight<C>) -> (Rc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();

        let finalizer = Rc::new(Finalizer {
            in_flight: RefCell::new(Some(in_flight)),
            interrupted: Cell::new(false),
            interrupt_tx: RefCell::new(Some(tx)),
        });

        (finalizer, rx)
    }

    fn take(&self) -> Option<InFlight<C>> {
        self.in_flight.borrow_mut().take()
    }

    /// Aborts the exchange now unless the finalize task already owns it, and wakes the task.
    fn interrupt(&self) {
        self.interrupted.set(true);

        let in_flight = self.take();
        if let Some(in_flight) = in_flight {
            in_flight.abort();
        }

        let tx = self.interrupt_tx.borrow_mut().take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

async fn finalize<C: Channel>(
    finalizer: Rc<Finalizer<C>>,
    complete_rx: oneshot::Receiver<Completion>,
    interrupt_rx: oneshot::Receiver<()>,
) {
    let completion = match select(complete_rx, interrupt_rx).await {
        Either::Left((Ok(completion), _)) => Some(completion),
        Either::Left((Err(_), _)) => None,
        Either::Right(_) => None,
    };

    let Some(in_flight) = finalizer.take() else {
        // interrupted, verdict already given
        return;
    };

    match completion {
        Some(Completion::Done) if in_flight.reuse => in_flight.settle(&finalizer.interrupted).await,
        Some(Completion::Done) => in_flight.abort(),
        Some(Completion::Failed(err)) => {
            log::debug!("exchange with {} failed: {err}", in_flight.acquired.key());
            in_flight.abort();
        }
        None => {
            log::debug!("exchange with {} abandoned", in_flight.acquired.key());
            in_flight.abort();
        }
    }
}

/// Interrupts the exchange when the dispatch future is dropped before the response is ready.
struct InterruptOnDrop<C: Channel>(Option<Rc<Finalizer<C>>>);

impl<C: Channel> InterruptOnDrop<C> {
    fn disarm(&mut self) {
        self.0.take();
    }

    fn interrupt(&mut self) {
        if let Some(finalizer) = self.0.take() {
            finalizer.interrupt();
        }
    }
}

impl<C: Channel> Drop for InterruptOnDrop<C> {
    fn drop(&mut self) {
        if let Some(finalizer) = self.0.take() {
            log::debug!("dispatch cancelled before the response was ready");
            finalizer.interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use actix_http::{Method, StatusCode, Uri};

    use super::*;
    use crate::{
        config::{ConnectorConfig, PoolConfig},
        pool::PoolStats,
        test::{dispatcher, Reset, Respond, TestConnector, TestDispatcher, TestDriver},
    };

    fn get() -> ClientRequest {
        ClientRequest::new(Method::GET, Uri::from_static("http://localhost/"))
    }

    fn stats(dispatcher: &TestDispatcher) -> PoolStats {
        let key = dispatcher.endpoint(&get()).unwrap();
        dispatcher.pool().stats(&key)
    }

    async fn settle() {
        for _ in 0..4 {
            actix_rt::task::yield_now().await;
        }
    }

    #[actix_rt::test]
    async fn drained_response_releases_connection() {
        let (dispatcher, connector, driver) = dispatcher(PoolConfig::Fixed(1));
        driver.body("hello");

        let mut res = dispatcher.dispatch(get()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.body().await.unwrap(), "hello");
        settle().await;

        assert_eq!(
            stats(&dispatcher),
            PoolStats {
                idle: 1,
                live: 1,
                checked_out: 0
            }
        );

        let mut res = dispatcher.dispatch(get()).await.unwrap();
        res.body().await.unwrap();
        settle().await;

        assert_eq!(connector.created(), 1);
        assert_eq!(driver.resets(), 2);
        assert_eq!(driver.interrupts(), 0);
    }

    #[actix_rt::test]
    async fn invalid_reset_discards_connection() {
        let (dispatcher, connector, driver) = dispatcher(PoolConfig::Fixed(4));
        driver.reset_with(Reset::Invalid);

        for _ in 0..3 {
            let mut res = dispatcher.dispatch(get()).await.unwrap();
            res.body().await.unwrap();
            settle().await;
            assert_eq!(stats(&dispatcher).idle, 0);
        }

        assert_eq!(connector.created(), 3);
    }

    #[actix_rt::test]
    async fn failed_reset_discards_connection() {
        let (dispatcher, connector, driver) = dispatcher(PoolConfig::Fixed(4));
        driver.reset_with(Reset::Error);

        let mut res = dispatcher.dispatch(get()).await.unwrap();
        res.body().await.unwrap();
        settle().await;

        assert_eq!(stats(&dispatcher), PoolStats::default());
        assert_eq!(connector.alive(), 0);
    }

    #[actix_rt::test]
    async fn abandoned_body_invalidates() {
        let (dispatcher, _connector, driver) = dispatcher(PoolConfig::Fixed(1));
        driver.respond(Respond::Stall);

        let res = dispatcher.dispatch(get()).await.unwrap();
        assert_eq!(stats(&dispatcher).checked_out, 1);

        drop(res);
        settle().await;

        assert_eq!(stats(&dispatcher), PoolStats::default());
        assert_eq!(driver.interrupts(), 1);
        assert_eq!(driver.resets(), 0);
    }

    #[actix_rt::test]
    async fn cancelled_dispatch_invalidates_before_returning() {
        let (dispatcher, connector, driver) = dispatcher(PoolConfig::Fixed(1));
        driver.respond(Respond::Hang);

        let res =
            actix_rt::time::timeout(Duration::from_millis(20), dispatcher.dispatch(get())).await;
        assert!(res.is_err());

        // no yield: invalidation happened while the dispatch future was dropped
        assert_eq!(driver.interrupts(), 1);
        assert_eq!(stats(&dispatcher), PoolStats::default());

        // the slot is free again
        driver.respond(Respond::Complete);
        let mut res = dispatcher.dispatch(get()).await.unwrap();
        res.body().await.unwrap();
        assert_eq!(connector.created(), 2);
    }

    #[actix_rt::test]
    async fn write_failure_invalidates() {
        let (dispatcher, connector, driver) = dispatcher(PoolConfig::Fixed(1));
        driver.respond(Respond::WriteError);

        let res = dispatcher.dispatch(get()).await;
        assert!(matches!(res, Err(SendRequestError::Send(_))));
        assert_eq!(stats(&dispatcher), PoolStats::default());
        assert_eq!(connector.alive(), 0);
    }

    #[actix_rt::test]
    async fn response_error_interrupts_and_invalidates() {
        let (dispatcher, _connector, driver) = dispatcher(PoolConfig::Fixed(1));
        driver.respond(Respond::ResponseError);

        let res = dispatcher.dispatch(get()).await;
        assert!(matches!(res, Err(SendRequestError::Send(_))));

        assert_eq!(driver.interrupts(), 1);
        assert_eq!(stats(&dispatcher), PoolStats::default());
    }

    #[actix_rt::test]
    async fn connect_failure_is_reported() {
        let (dispatcher, connector, driver) = dispatcher(PoolConfig::Fixed(1));
        connector.set_failing(true);

        let res = dispatcher.dispatch(get()).await;
        assert!(matches!(res, Err(SendRequestError::Connect(_))));
        assert!(res.unwrap_err().is_retryable());
        assert_eq!(driver.requests(), 0);
    }

    #[actix_rt::test]
    async fn relative_uri_is_rejected() {
        let (dispatcher, _connector, driver) = dispatcher(PoolConfig::Fixed(1));

        let req = ClientRequest::new(Method::GET, Uri::from_static("/relative"));
        let res = dispatcher.dispatch(req).await;

        assert!(matches!(res, Err(SendRequestError::Url(_))));
        assert_eq!(driver.requests(), 0);
    }

    #[actix_rt::test]
    async fn disabled_pool_disables_keep_alive() {
        let (dispatcher, connector, driver) = dispatcher(PoolConfig::Disabled);

        for _ in 0..2 {
            let mut res = dispatcher.dispatch(get()).await.unwrap();
            res.body().await.unwrap();
            settle().await;
        }

        assert_eq!(
            driver.last_options(),
            Some(ChannelOptions {
                aggregate: true,
                keep_alive: false
            })
        );
        assert_eq!(connector.created(), 2);
        assert_eq!(driver.resets(), 0);
        assert_eq!(stats(&dispatcher), PoolStats::default());
    }

    #[actix_rt::test]
    async fn tunnel_is_never_pooled() {
        let (dispatcher, _connector, driver) = dispatcher(PoolConfig::Fixed(1));

        let (head, tunnel) = dispatcher.dispatch_streaming(get()).await.unwrap();
        assert_eq!(head.status, StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(stats(&dispatcher).checked_out, 1);

        drop(tunnel);
        settle().await;

        assert_eq!(stats(&dispatcher), PoolStats::default());
        assert_eq!(driver.resets(), 0);
    }

    #[test]
    fn runtime_shutdown_while_body_streams_invalidates() {
        let connector = TestConnector::new();
        let driver = TestDriver::new();
        driver.respond(Respond::Stall);

        let pool = ConnectionPool::new(
            connector.clone(),
            ConnectorConfig::default()
                .pool(PoolConfig::Fixed(1))
                .no_disconnect_timeout(),
        );
        let dispatcher: TestDispatcher =
            PooledDispatcher::new(pool, driver.clone(), EndpointConfig::default());

        let rt = actix_rt::Runtime::new().unwrap();
        let res = rt.block_on(dispatcher.dispatch(get())).unwrap();
        assert_eq!(stats(&dispatcher).checked_out, 1);
        assert_eq!(driver.interrupts(), 0);

        // tears down the finalize task while it waits for the body to end
        drop(rt);

        assert_eq!(driver.interrupts(), 1);
        assert_eq!(driver.resets(), 0);
        assert_eq!(stats(&dispatcher), PoolStats::default());
        assert_eq!(connector.alive(), 0);

        drop(res);
    }
}
