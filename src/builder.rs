use std::{net::IpAddr, rc::Rc, time::Duration};

use actix_service::Service;

use crate::{
    client::Client,
    config::{ConnectorConfig, EndpointConfig, PoolConfig},
    connection::ConnectionIo,
    connector::{DefaultConnector, TcpConnector},
    dispatch::{Dispatcher, PooledDispatcher},
    driver::Driver,
    endpoint::{Decompression, EndpointKey, Proxy, TlsConfig},
    error::ConnectError,
    middleware::{NestTransform, Transform},
    pool::ConnectionPool,
};

/// An HTTP Client builder
///
/// This type can be used to construct an instance of [`Client`] through a
/// builder-like pattern. The wire [`Driver`] is supplied last, to
/// [`finish`](Self::finish).
pub struct ClientBuilder<S = DefaultConnector, M = ()> {
    connector: S,
    config: ConnectorConfig,
    endpoint: EndpointConfig,
    aggregate: bool,
    middleware: M,
}

impl ClientBuilder {
    pub fn new() -> ClientBuilder<DefaultConnector, ()> {
        let config = ConnectorConfig::default();

        ClientBuilder {
            connector: TcpConnector::new(&config),
            config,
            endpoint: EndpointConfig::default(),
            aggregate: true,
            middleware: (),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ClientBuilder<DefaultConnector, M> {
    /// Set TCP connection timeout.
    ///
    /// This is the max time allowed to connect to remote host, including DNS name resolution.
    ///
    /// By default, the timeout is 5 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.timeout(timeout);
        self.connector = TcpConnector::new(&self.config);
        self
    }

    /// Set local IP Address the connector would use for establishing connection.
    pub fn local_address(mut self, addr: IpAddr) -> Self {
        self.config = self.config.local_address(addr);
        self.connector = TcpConnector::new(&self.config);
        self
    }
}

impl<S, M> ClientBuilder<S, M> {
    /// Use custom connector service.
    pub fn connector<S1>(self, connector: S1) -> ClientBuilder<S1, M> {
        ClientBuilder {
            connector,
            config: self.config,
            endpoint: self.endpoint,
            aggregate: self.aggregate,
            middleware: self.middleware,
        }
    }

    /// Set connection pool sizing policy.
    ///
    /// By default a fixed pool of 100 connections per endpoint is used.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config = self.config.pool(pool);
        self
    }

    /// Set keep-alive period for opened connection.
    ///
    /// Default keep-alive period is 15 seconds.
    pub fn conn_keep_alive(mut self, dur: Duration) -> Self {
        self.config = self.config.conn_keep_alive(dur);
        self
    }

    /// Set max lifetime period for connection.
    ///
    /// Default lifetime period is 75 seconds.
    pub fn conn_lifetime(mut self, dur: Duration) -> Self {
        self.config = self.config.conn_lifetime(dur);
        self
    }

    /// Set connection disconnect timeout.
    ///
    /// By default disconnect timeout is set to 3000 milliseconds.
    pub fn disconnect_timeout(mut self, dur: Duration) -> Self {
        self.config = self.config.disconnect_timeout(dur);
        self
    }

    /// Maximum response header size the driver accepts. Default is 8 KiB.
    pub fn max_header_size(mut self, size: usize) -> Self {
        self.endpoint.max_header_size = size;
        self
    }

    pub fn decompression(mut self, decompression: Decompression) -> Self {
        self.endpoint.decompression = decompression;
        self
    }

    /// Route every connection through `proxy`.
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.endpoint.proxy = Some(proxy);
        self
    }

    /// TLS parameters for secure endpoints.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.endpoint.tls = Some(tls);
        self
    }

    /// Have the driver stream response bodies instead of buffering them first.
    pub fn no_aggregate(mut self) -> Self {
        self.aggregate = false;
        self
    }

    /// Add a decorator to the dispatcher. Decorators added later wrap earlier ones.
    pub fn wrap<M1>(
        self,
        mw: M1,
    ) -> ClientBuilder<S, NestTransform<M, M1, Rc<dyn Dispatcher>>>
    where
        M: Transform<Rc<dyn Dispatcher>>,
        M1: Transform<M::Transform>,
    {
        ClientBuilder {
            connector: self.connector,
            config: self.config,
            endpoint: self.endpoint,
            aggregate: self.aggregate,
            middleware: NestTransform::new(self.middleware, mw),
        }
    }

    /// Build the pooled dispatcher without the decorators added through [`wrap`](Self::wrap).
    pub fn dispatcher<Io, D>(self, driver: D) -> PooledDispatcher<S, Io, D>
    where
        S: Service<EndpointKey, Response = Io, Error = ConnectError> + 'static,
        Io: ConnectionIo,
        D: Driver<Io>,
    {
        let pool = ConnectionPool::new(self.connector, self.config);
        PooledDispatcher::new(pool, driver, self.endpoint).aggregate(self.aggregate)
    }

    /// Finish build process and create `Client` instance.
    pub fn finish<Io, D>(self, driver: D) -> Client
    where
        S: Service<EndpointKey, Response = Io, Error = ConnectError> + 'static,
        Io: ConnectionIo,
        D: Driver<Io>,
        M: Transform<Rc<dyn Dispatcher>>,
        M::Transform: 'static,
    {
        let ClientBuilder {
            connector,
            config,
            endpoint,
            aggregate,
            middleware,
        } = self;

        let pool = ConnectionPool::new(connector, config);
        let dispatcher: Rc<dyn Dispatcher> =
            Rc::new(PooledDispatcher::new(pool, driver, endpoint).aggregate(aggregate));

        Client::new(middleware.new_transform(dispatcher))
    }
}
