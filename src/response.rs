use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use actix_http::{error::PayloadError, header::HeaderMap, ResponseHead, StatusCode};
use actix_utils::future::poll_fn;
use bytes::{Bytes, BytesMut};
use futures_core::{ready, Stream};
use pin_project_lite::pin_project;

use crate::channel::ExchangeComplete;

/// Type-erased response body stream.
pub type BoxedPayloadStream = Pin<Box<dyn Stream<Item = Result<Bytes, PayloadError>>>>;

pin_project! {
    /// Response body that ends the exchange once it has been read to completion.
    ///
    /// A read error fails the exchange. Dropping the body before its end abandons the exchange;
    /// either way the connection is not reused.
    pub struct TrackedPayload<S> {
        #[pin]
        stream: S,
        complete: Option<ExchangeComplete>,
    }
}

impl<S> TrackedPayload<S> {
    pub fn new(stream: S, complete: ExchangeComplete) -> Self {
        TrackedPayload {
            stream,
            complete: Some(complete),
        }
    }
}

impl<S> Stream for TrackedPayload<S>
where
    S: Stream<Item = Result<Bytes, PayloadError>>,
{
    type Item = Result<Bytes, PayloadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let item = ready!(this.stream.poll_next(cx));

        match item {
            None => {
                if let Some(complete) = this.complete.take() {
                    complete.done();
                }
            }
            Some(Err(ref err)) => {
                if let Some(complete) = this.complete.take() {
                    complete.fail(err.to_string());
                }
            }
            Some(Ok(_)) => {}
        }

        Poll::Ready(item)
    }
}

/// Response head plus a possibly still streaming body.
pub struct ClientResponse {
    head: ResponseHead,
    payload: Option<BoxedPayloadStream>,
}

impl ClientResponse {
    pub fn new(head: ResponseHead, payload: BoxedPayloadStream) -> Self {
        ClientResponse {
            head,
            payload: Some(payload),
        }
    }

    /// Response without a body. The driver completes the exchange itself.
    pub fn empty(head: ResponseHead) -> Self {
        ClientResponse {
            head,
            payload: None,
        }
    }

    /// Response whose body completes the exchange when drained.
    pub fn streaming<S>(head: ResponseHead, stream: S, complete: ExchangeComplete) -> Self
    where
        S: Stream<Item = Result<Bytes, PayloadError>> + 'static,
    {
        Self::new(head, Box::pin(TrackedPayload::new(stream, complete)))
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Takes the body stream out of the response.
    pub fn take_payload(&mut self) -> Option<BoxedPayloadStream> {
        self.payload.take()
    }

    /// Reads the remaining body into memory.
    pub async fn body(&mut self) -> Result<Bytes, PayloadError> {
        let mut buf = BytesMut::new();

        if let Some(mut payload) = self.payload.take() {
            while let Some(chunk) = poll_fn(|cx| payload.as_mut().poll_next(cx)).await {
                buf.extend_from_slice(&chunk?);
            }
        }

        Ok(buf.freeze())
    }
}

impl fmt::Debug for ClientResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nClientResponse {:?} {}", self.head.version, self.head.status)?;
        writeln!(f, "  headers:")?;
        for (key, val) in self.head.headers.iter() {
            writeln!(f, "    {:?}: {:?}", key, val)?;
        }
        Ok(())
    }
}
