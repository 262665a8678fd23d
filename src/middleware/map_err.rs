use std::rc::Rc;

use actix_http::ResponseHead;
use futures_core::future::LocalBoxFuture;

use super::Transform;
use crate::{
    connection::Tunnel, dispatch::Dispatcher, error::SendRequestError, request::ClientRequest,
    response::ClientResponse,
};

/// Error mapping decorator.
pub struct MapErr<F>(F);

impl<F> MapErr<F>
where
    F: Fn(SendRequestError) -> SendRequestError + 'static,
{
    pub fn new(f: F) -> Self {
        MapErr(f)
    }
}

impl<D, F> Transform<D> for MapErr<F>
where
    D: Dispatcher,
    F: Fn(SendRequestError) -> SendRequestError + 'static,
{
    type Transform = MapErrDispatcher<D, F>;

    fn new_transform(self, dispatcher: D) -> Self::Transform {
        MapErrDispatcher {
            dispatcher,
            f: Rc::new(self.0),
        }
    }
}

pub struct MapErrDispatcher<D, F> {
    dispatcher: D,
    f: Rc<F>,
}

impl<D, F> Dispatcher for MapErrDispatcher<D, F>
where
    D: Dispatcher,
    F: Fn(SendRequestError) -> SendRequestError + 'static,
{
    fn dispatch(
        &self,
        req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<ClientResponse, SendRequestError>> {
        let fut = self.dispatcher.dispatch(req);
        let f = self.f.clone();

        Box::pin(async move { fut.await.map_err(|err| f(err)) })
    }

    fn dispatch_streaming(
        &self,
        req: ClientRequest,
    ) -> LocalBoxFuture<'static, Result<(ResponseHead, Tunnel), SendRequestError>> {
        let fut = self.dispatcher.dispatch_streaming(req);
        let f = self.f.clone();

        Box::pin(async move { fut.await.map_err(|err| f(err)) })
    }
}

#[cfg(test)]
mod tests {
    use actix_http::{Method, Uri};

    use super::*;
    use crate::{config::PoolConfig, middleware::map_err, test::dispatcher};

    #[actix_rt::test]
    async fn maps_errors() {
        let (inner, connector, _) = dispatcher(PoolConfig::Fixed(1));
        connector.set_failing(true);

        let client = map_err(inner, |err| match err {
            SendRequestError::Connect(_) => SendRequestError::Timeout,
            err => err,
        });

        let req = ClientRequest::new(Method::GET, Uri::from_static("http://localhost/"));
        let res = client.dispatch(req).await;
        assert!(matches!(res, Err(SendRequestError::Timeout)));
    }

    #[actix_rt::test]
    async fn passes_responses_through() {
        let (inner, _, _) = dispatcher(PoolConfig::Fixed(1));
        let client = map_err(inner, |_| SendRequestError::Timeout);

        let req = ClientRequest::new(Method::GET, Uri::from_static("http://localhost/"));
        assert!(client.dispatch(req).await.is_ok());
    }
}
