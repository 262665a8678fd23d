use std::{
    future::Future,
    io,
    net::IpAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use actix_rt::{
    net::TcpStream,
    time::{sleep, Sleep},
};
use actix_service::Service;
use actix_tls::connect::{
    ConnectError as TcpConnectError, ConnectInfo, Connection as TcpConnection,
    ConnectorService as TcpConnectService, Resolver,
};
use futures_core::future::LocalBoxFuture;
use http::Uri;
use pin_project_lite::pin_project;

use crate::{
    config::ConnectorConfig, connection::ConnectionIo, endpoint::EndpointKey,
    error::ConnectError,
};

/// Opens plain TCP transports to an [`EndpointKey`].
///
/// When the key carries a proxy the socket is opened to the proxy. Secure schemes are refused
/// with [`ConnectError::SslIsNotSupported`].
#[derive(Clone)]
pub struct TcpConnector<S = TcpConnectService> {
    service: S,
    timeout: Duration,
    local_address: Option<IpAddr>,
}

impl TcpConnector {
    /// Connector using the default system resolver.
    pub fn new(config: &ConnectorConfig) -> Self {
        let service = actix_tls::connect::Connector::new(Resolver::default()).service();
        Self::with_service(service, config)
    }
}

impl<S> TcpConnector<S> {
    /// Use custom connect service.
    ///
    /// Takes the connect timeout and local address from `config`.
    pub fn with_service(service: S, config: &ConnectorConfig) -> Self {
        TcpConnector {
            service,
            timeout: config.timeout,
            local_address: config.local_address,
        }
    }
}

impl<S, Io> Service<EndpointKey> for TcpConnector<S>
where
    S: Service<ConnectInfo<Uri>, Response = TcpConnection<Uri, Io>, Error = TcpConnectError>
        + 'static,
    S::Future: 'static,
    Io: ConnectionIo,
{
    type Response = Io;
    type Error = ConnectError;
    type Future = LocalBoxFuture<'static, Result<Io, ConnectError>>;

    actix_service::forward_ready!(service);

    fn call(&self, key: EndpointKey) -> Self::Future {
        if key.scheme().is_secure() {
            return Box::pin(async { Err(ConnectError::SslIsNotSupported) });
        }

        let uri = match key.connect_uri() {
            Ok(uri) => uri,
            Err(err) => {
                return Box::pin(async move {
                    Err(ConnectError::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        err,
                    )))
                })
            }
        };

        log::trace!("connecting to {key} via {uri}");

        let mut req = ConnectInfo::new(uri);

        if let Some(local_addr) = self.local_address {
            req = req.set_local_addr(local_addr);
        }

        Box::pin(TcpConnectorFuture {
            fut: self.service.call(req),
            timeout: sleep(self.timeout),
        })
    }
}

pin_project! {
    /// Connect attempt canceled when the timeout limit is reached.
    #[project = TcpConnectorFutureProj]
    pub struct TcpConnectorFuture<Fut> {
        #[pin]
        fut: Fut,
        #[pin]
        timeout: Sleep,
    }
}

impl<Fut, Io> Future for TcpConnectorFuture<Fut>
where
    Fut: Future<Output = Result<TcpConnection<Uri, Io>, TcpConnectError>>,
{
    type Output = Result<Io, ConnectError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.fut.poll(cx) {
            Poll::Ready(res) => Poll::Ready(
                res.map(|conn| conn.into_parts().0)
                    .map_err(ConnectError::from),
            ),
            Poll::Pending => this.timeout.poll(cx).map(|_| Err(ConnectError::Timeout)),
        }
    }
}

/// Plain TCP connector as produced by [`TcpConnector::new`].
pub type DefaultConnector = TcpConnector<TcpConnectService>;

/// Transport produced by [`DefaultConnector`].
pub type DefaultIo = TcpStream;

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use futures_util::future::{pending, Pending};

    use super::*;
    use crate::config::EndpointConfig;

    #[derive(Clone)]
    struct NeverConnects;

    impl Service<ConnectInfo<Uri>> for NeverConnects {
        type Response = TcpConnection<Uri, TcpStream>;
        type Error = TcpConnectError;
        type Future = Pending<Result<Self::Response, Self::Error>>;

        actix_service::always_ready!();

        fn call(&self, _: ConnectInfo<Uri>) -> Self::Future {
            pending()
        }
    }

    fn key(uri: &str) -> EndpointKey {
        EndpointKey::from_uri(&uri.parse().unwrap(), &EndpointConfig::default()).unwrap()
    }

    #[actix_rt::test]
    async fn connect_timeout() {
        let config = ConnectorConfig::default().timeout(Duration::from_millis(20));
        let connector = TcpConnector::with_service(NeverConnects, &config);

        let res = connector.call(key("http://localhost:8080")).await;
        assert!(matches!(res, Err(ConnectError::Timeout)));
    }

    #[actix_rt::test]
    async fn secure_scheme_refused() {
        let connector = TcpConnector::with_service(NeverConnects, &ConnectorConfig::default());

        let res = connector.call(key("https://localhost")).await;
        assert!(matches!(res, Err(ConnectError::SslIsNotSupported)));
    }

    #[actix_rt::test]
    async fn connects_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = TcpConnector::new(&ConnectorConfig::default());
        let stream = connector
            .call(key(&format!("http://127.0.0.1:{}", addr.port())))
            .await
            .unwrap();

        assert_eq!(stream.peer_addr().unwrap(), addr);
    }
}
