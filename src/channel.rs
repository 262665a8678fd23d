//! Per-exchange contract between the dispatcher and the wire driver.
//!
//! A dispatch hands the driver two signals. [`ResponseReady`] resolves as soon as the response
//! head (or upgrade) is available. [`ExchangeComplete`] resolves once every byte belonging to
//! the exchange has been read, which for a streamed body can be much later. Only the second
//! one decides whether the connection may go back to the pool.

use std::{fmt, io};

use futures_core::future::LocalBoxFuture;
use tokio::sync::oneshot;

use crate::{connection::ConnectionIo, error::SendRequestError, BoxError};

/// Verdict on whether a connection's wire state permits another request.
pub enum ChannelState<Io> {
    /// Transport is clean and handed back for pooling.
    Reusable(Io),

    /// Protocol forbids reuse, or the transport could not be reset.
    Invalid,
}

impl<Io> ChannelState<Io> {
    pub fn is_reusable(&self) -> bool {
        matches!(self, ChannelState::Reusable(_))
    }
}

impl<Io> fmt::Debug for ChannelState<Io> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Reusable(_) => f.write_str("Reusable"),
            ChannelState::Invalid => f.write_str("Invalid"),
        }
    }
}

/// Handle to an exchange in flight on one connection.
///
/// Returned by a [`Driver`](crate::Driver) once the request has been handed to the wire.
pub trait Channel: 'static {
    type Io: ConnectionIo;

    /// Aborts the in-flight exchange.
    ///
    /// May be called after the exchange already finished and must be idempotent.
    fn interrupt(&mut self);

    /// Attempts to return the transport to a state where a new request may be written.
    ///
    /// Errors are routine (unread trailing bytes, peer closed the socket). They mark the
    /// connection invalid and never fail the request that used it.
    fn reset(&mut self) -> LocalBoxFuture<'_, io::Result<ChannelState<Self::Io>>>;
}

/// Resets the channel, folding reset failures into [`ChannelState::Invalid`].
pub(crate) async fn reset_channel<C: Channel>(channel: &mut C) -> ChannelState<C::Io> {
    match channel.reset().await {
        Ok(state) => state,
        Err(err) => {
            log::debug!("channel reset failed, connection will not be reused: {err}");
            ChannelState::Invalid
        }
    }
}

/// How an exchange ended, as reported by the driver.
#[derive(Debug)]
pub enum Completion {
    /// Every byte of the exchange has been read.
    Done,

    /// The exchange broke after the response was delivered.
    Failed(BoxError),
}

/// Resolves the response of an exchange.
pub struct ResponseReady<T> {
    tx: oneshot::Sender<Result<T, SendRequestError>>,
}

impl<T> ResponseReady<T> {
    /// Delivers the response. Returns false when the caller has gone away, in which case the
    /// response is dropped.
    pub fn send(self, res: T) -> bool {
        self.tx.send(Ok(res)).is_ok()
    }

    /// Fails the exchange before a response was produced.
    pub fn fail(self, err: SendRequestError) -> bool {
        self.tx.send(Err(err)).is_ok()
    }

    /// Returns true when nobody is waiting for the response anymore.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Signals the end of an exchange.
///
/// Dropping it without calling [`done`](Self::done) or [`fail`](Self::fail) abandons the
/// exchange and the connection is invalidated.
pub struct ExchangeComplete {
    tx: oneshot::Sender<Completion>,
}

impl ExchangeComplete {
    pub fn done(self) {
        let _ = self.tx.send(Completion::Done);
    }

    pub fn fail(self, err: impl Into<BoxError>) {
        let _ = self.tx.send(Completion::Failed(err.into()));
    }
}

impl fmt::Debug for ExchangeComplete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeComplete")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Both signals of one exchange, handed to the driver.
pub struct Exchange<T> {
    pub ready: ResponseReady<T>,
    pub complete: ExchangeComplete,
}

pub(crate) type ReadyRx<T> = oneshot::Receiver<Result<T, SendRequestError>>;

impl<T> Exchange<T> {
    pub(crate) fn new() -> (Self, ReadyRx<T>, oneshot::Receiver<Completion>) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (complete_tx, complete_rx) = oneshot::channel();

        let exchange = Exchange {
            ready: ResponseReady { tx: ready_tx },
            complete: ExchangeComplete { tx: complete_tx },
        };

        (exchange, ready_rx, complete_rx)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use actix_codec::{AsyncRead, AsyncWrite, ReadBuf};

    use super::*;

    struct NullIo;

    impl AsyncRead for NullIo {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            _: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for NullIo {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct FailingReset;

    impl Channel for FailingReset {
        type Io = NullIo;

        fn interrupt(&mut self) {}

        fn reset(&mut self) -> LocalBoxFuture<'_, io::Result<ChannelState<NullIo>>> {
            Box::pin(async {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unread trailing bytes",
                ))
            })
        }
    }

    #[actix_rt::test]
    async fn reset_failure_is_invalid() {
        let state = reset_channel(&mut FailingReset).await;
        assert!(!state.is_reusable());
    }

    #[actix_rt::test]
    async fn dropped_completion_is_observable() {
        let (exchange, ready_rx, complete_rx) = Exchange::<()>::new();
        drop(exchange);

        assert!(ready_rx.await.is_err());
        assert!(complete_rx.await.is_err());
    }

    #[actix_rt::test]
    async fn ready_reports_departed_caller() {
        let (exchange, ready_rx, _complete_rx) = Exchange::<u8>::new();
        drop(ready_rx);

        assert!(exchange.ready.is_closed());
        assert!(!exchange.ready.send(1));
    }
}
