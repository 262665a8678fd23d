//! Decorator for setting default request headers
use std::rc::Rc;

use actix_http::{
    header::{HeaderMap, HeaderName, HeaderValue},
    ResponseHead,
};
use futures_core::future::LocalBoxFuture;

use super::Transform;
use crate::{
    connection::Tunnel, dispatch::Dispatcher, error::SendRequestError, request::ClientRequest,
    response::ClientResponse,
};

/// Decorator for setting default request headers.
///
/// A header is only set if the request does not contain it already.
///
/// ```
/// use courier::http::header::{HeaderName, HeaderValue};
/// use courier::middleware::DefaultHeaders;
///
/// let headers = DefaultHeaders::new().header(
///     HeaderName::from_static("x-version"),
///     HeaderValue::from_static("0.2"),
/// );
/// ```
#[derive(Clone, Default)]
pub struct DefaultHeaders {
    headers: Rc<HeaderMap>,
}

impl DefaultHeaders {
    /// Construct `DefaultHeaders` decorator.
    pub fn new() -> DefaultHeaders {
        DefaultHeaders::default()
    }

    /// Appends a header.
    pub fn header(mut self, key: HeaderName, value: HeaderValue) -> Self {
        Rc::make_mut(&mut self.headers).append(key, value);
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

}

impl From<HeaderMap> for DefaultHeaders {
    fn from(headers: HeaderMap) -> Self {
        DefaultHeaders {
            headers: Rc::new(headers),
        }
    }
}

impl<D> Transform<D> for DefaultHeaders
where
    D: Dispatcher,
{
    type Transform = DefaultHeadersDispatcher<D>;

    fn new_transform(self, dispatcher: D) -> Self::Transform {
        DefaultHeadersDispatcher {
            dispatcher,
            headers: self,
        }
    }
}

pub struct DefaultHeadersDispatcher<D> {
    dispatcher: D,
    headers: DefaultHeaders,
}

impl<D> Dispatcher for DefaultHeadersDispatcher<D>
where
    D: Dispatcher,
{
    fn dispatch(
        &self,
        mut req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        req.set_default_headers(&self.headers.headers);
        self.dispatcher.dispatch(req)
    }

    fn dispatch_streaming(
        &self,
        mut req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<(ResponseHead, Tunnel), SendRequestError>> {
        req.set_default_headers(&self.headers.headers);
        self.dispatcher.dispatch_streaming(req)
    }
}
