use actix_http::ResponseHead;
use futures_core::future::LocalBoxFuture;

use crate::{
    channel::{Channel, Exchange},
    config::ChannelOptions,
    connection::{ConnectionIo, Tunnel},
    endpoint::EndpointKey,
    error::SendRequestError,
    request::ClientRequest,
    response::ClientResponse,
};

/// Wire-level driver that frames requests and responses on a transport.
///
/// The driver takes ownership of the transport for the duration of an exchange. It resolves
/// `exchange.ready` once a response (or upgrade) is available and `exchange.complete` once the
/// exchange has been fully read; the returned [`Channel`] hands the transport back through
/// [`Channel::reset`].
pub trait Driver<Io: ConnectionIo>: 'static {
    type Channel: Channel<Io = Io>;

    /// Writes `req` to `io`.
    ///
    /// Fails when the request could not be written. The connection is then invalidated.
    fn send_request(
        &self,
        io: Io,
        endpoint: &EndpointKey,
        req: ClientRequest,
        exchange: Exchange<ClientResponse>,
        opts: ChannelOptions,
    ) -> LocalBoxFuture<'static, Result<Self::Channel, SendRequestError>>;

    /// Writes an upgrade request to `io`. The upgraded stream is delivered as a [`Tunnel`].
    fn open_tunnel(
        &self,
        io: Io,
        endpoint: &EndpointKey,
        req: ClientRequest,
        exchange: Exchange<(ResponseHead, Tunnel)>,
        opts: ChannelOptions,
    ) -> LocalBoxFuture<'static, Result<Self::Channel, SendRequestError>> {
        let _ = (io, endpoint, req, exchange, opts);
        Box::pin(async { Err(SendRequestError::TunnelNotSupported) })
    }
}
