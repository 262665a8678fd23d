use std::{fmt, future::ready, rc::Rc, time::Duration};

use actix_http::{
    error::HttpError,
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, ResponseHead, Uri,
};
use bytes::Bytes;
use futures_core::future::LocalBoxFuture;

use crate::{
    builder::ClientBuilder,
    connection::Tunnel,
    dispatch::Dispatcher,
    endpoint::Scheme,
    error::{InvalidUrl, SendRequestError},
    request::ClientRequest,
    response::ClientResponse,
};

/// Request defaults of a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    scheme: Scheme,
    host: Option<String>,
    port: Option<u16>,
    base_path: String,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            scheme: Scheme::Http,
            host: None,
            port: None,
            base_path: String::new(),
            headers: HeaderMap::new(),
            timeout: None,
        }
    }
}

impl ClientConfig {
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Resolves `path` against the configured scheme, host, port and base path.
    ///
    /// Absolute URLs are taken as they are.
    pub fn url(&self, path: &str) -> Result<Uri, InvalidUrl> {
        if let Ok(uri) = path.parse::<Uri>() {
            if uri.scheme().is_some() {
                return Ok(uri);
            }
        }

        let host = self.host.as_deref().ok_or(InvalidUrl::MissingHost)?;

        let mut url = format!("{}://{}", self.scheme, host);
        if let Some(port) = self.port {
            url.push_str(&format!(":{port}"));
        }

        url.push_str(self.base_path.trim_end_matches('/'));
        if !path.starts_with('/') {
            url.push('/');
        }
        url.push_str(path);

        url.parse::<Uri>()
            .map_err(|e| InvalidUrl::HttpError(HttpError::from(e)))
    }
}

/// An asynchronous HTTP client.
///
/// `Client` is an immutable set of request defaults in front of a [`Dispatcher`]. Every
/// configuration method returns a new client sharing the same dispatcher, so connection pools
/// are shared too.
///
/// ```no_run
/// # use courier::{test::{TestConnector, TestDriver}, Client};
/// # async fn run() -> Result<(), courier::error::SendRequestError> {
/// let client = Client::builder()
///     .connector(TestConnector::new())
///     .finish(TestDriver::new())
///     .host("www.rust-lang.org");
///
/// let mut res = client.get("/").await?;
/// println!("Response: {:?}", res.body().await);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    dispatcher: Rc<dyn Dispatcher>,
    config: Rc<ClientConfig>,
}

impl Client {
    /// Client sending through `dispatcher` with default request settings.
    pub fn new(dispatcher: impl Dispatcher + 'static) -> Self {
        Client {
            dispatcher: Rc::new(dispatcher),
            config: Rc::new(ClientConfig::default()),
        }
    }

    /// Create `Client` builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn with(&self, f: impl FnOnce(&mut ClientConfig)) -> Self {
        let mut config = ClientConfig::clone(&self.config);
        f(&mut config);

        Client {
            dispatcher: self.dispatcher.clone(),
            config: Rc::new(config),
        }
    }

    pub fn scheme(&self, scheme: Scheme) -> Self {
        self.with(|config| config.scheme = scheme)
    }

    pub fn host(&self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.with(|config| config.host = Some(host))
    }

    pub fn port(&self, port: u16) -> Self {
        self.with(|config| config.port = Some(port))
    }

    /// Path prefix for relative request paths.
    pub fn base_path(&self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.with(|config| config.base_path = path)
    }

    /// Add default header.
    ///
    /// Headers added by this method get added to every request that does not set them itself.
    /// Invalid names or values are logged and ignored.
    pub fn header<K, V>(&self, key: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: fmt::Debug,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: fmt::Debug,
    {
        match HeaderName::try_from(key) {
            Ok(key) => match HeaderValue::try_from(value) {
                Ok(value) => self.with(|config| config.headers.append(key, value)),
                Err(e) => {
                    log::error!("Header value error: {:?}", e);
                    self.clone()
                }
            },
            Err(e) => {
                log::error!("Header name error: {:?}", e);
                self.clone()
            }
        }
    }

    /// Deadline for the response of every request. A request that misses it is cancelled
    /// and fails with [`SendRequestError::Timeout`].
    pub fn timeout(&self, dur: Duration) -> Self {
        self.with(|config| config.timeout = Some(dur))
    }

    /// Removes the response deadline.
    pub fn no_timeout(&self) -> Self {
        self.with(|config| config.timeout = None)
    }

    /// Builds a request for `path` carrying the default headers.
    pub fn request(&self, method: Method, path: &str) -> Result<ClientRequest, InvalidUrl> {
        let mut req = ClientRequest::new(method, self.config.url(path)?);
        req.set_default_headers(&self.config.headers);

        Ok(req)
    }

    /// Sends `req`, honoring the configured timeout.
    pub fn send(
        &self,
        req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        let fut = self.dispatcher.dispatch(req);

        match self.config.timeout {
            Some(dur) => Box::pin(async move {
                actix_rt::time::timeout(dur, fut)
                    .await
                    .map_err(|_| SendRequestError::Timeout)?
            }),
            None => fut,
        }
    }

    fn send_to(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        match self.request(method, path) {
            Ok(req) => self.send(req.with_body(body)),
            Err(e) => Box::pin(ready(Err(SendRequestError::from(e)))),
        }
    }

    /// Sends a GET request to `path`.
    pub fn get(
        &self,
        path: &str,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        self.send_to(Method::GET, path, Bytes::new())
    }

    /// Sends a DELETE request to `path`.
    pub fn delete(
        &self,
        path: &str,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        self.send_to(Method::DELETE, path, Bytes::new())
    }

    /// Sends a POST request with `body` to `path`.
    pub fn post(
        &self,
        path: &str,
        body: impl Into<Bytes>,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        self.send_to(Method::POST, path, body.into())
    }

    /// Sends a PUT request with `body` to `path`.
    pub fn put(
        &self,
        path: &str,
        body: impl Into<Bytes>,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        self.send_to(Method::PUT, path, body.into())
    }

    /// Sends an upgrade request to `path` and returns the upgraded stream.
    ///
    /// The connection is used by the tunnel only and is closed when the tunnel is dropped.
    pub fn upgrade(
        &self,
        path: &str,
    ) -> LocalBoxFuture<'static, Result<(ResponseHead, Tunnel), SendRequestError>> {
        let req = match self.request(Method::GET, path) {
            Ok(req) => req,
            Err(e) => return Box::pin(ready(Err(SendRequestError::from(e)))),
        };

        let fut = self.dispatcher.dispatch_streaming(req);

        match self.config.timeout {
            Some(dur) => Box::pin(async move {
                actix_rt::time::timeout(dur, fut)
                    .await
                    .map_err(|_| SendRequestError::Timeout)?
            }),
            None => fut,
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
