//! Client transport errors.

use std::{fmt, io};

use actix_http::error::{HttpError, ParseError};
use derive_more::{Display, From};

use crate::BoxError;

/// A set of errors that can occur while acquiring a connection to an endpoint.
///
/// Acquisition errors leave no trace in the pool other than the released reservation slot, so
/// they are safe to retry from a higher layer.
#[derive(Debug, Display, From)]
#[non_exhaustive]
pub enum ConnectError {
    /// SSL feature is not enabled
    #[display("SSL is not supported")]
    SslIsNotSupported,

    /// Failed to resolve the hostname
    #[display("Failed resolving hostname: {}", _0)]
    Resolver(Box<dyn std::error::Error>),

    /// No dns records
    #[display("No DNS records found for the input")]
    NoRecords,

    /// Connecting took too long
    #[display("Timeout while establishing connection")]
    Timeout,

    /// Connection pool has been shut down
    #[display("Internal error: connection pool has been disconnected")]
    Disconnected,

    /// Unresolved host name
    #[display("Connector received endpoint with unresolved host")]
    Unresolved,

    /// Connection io error
    #[display("{}", _0)]
    Io(io::Error),
}

impl std::error::Error for ConnectError {}

impl From<actix_tls::connect::ConnectError> for ConnectError {
    fn from(err: actix_tls::connect::ConnectError) -> ConnectError {
        match err {
            actix_tls::connect::ConnectError::Resolver(err) => ConnectError::Resolver(err),
            actix_tls::connect::ConnectError::NoRecords => ConnectError::NoRecords,
            actix_tls::connect::ConnectError::InvalidInput => ConnectError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid connect input",
            )),
            actix_tls::connect::ConnectError::Unresolved => ConnectError::Unresolved,
            actix_tls::connect::ConnectError::Io(err) => ConnectError::Io(err),
        }
    }
}

/// Request target could not be turned into an absolute endpoint.
#[derive(Debug, Display, From)]
#[non_exhaustive]
pub enum InvalidUrl {
    #[display("Missing URL scheme")]
    MissingScheme,

    #[display("Unknown URL scheme")]
    UnknownScheme,

    #[display("Missing host name")]
    MissingHost,

    #[display("URL parse error: {}", _0)]
    HttpError(http::Error),
}

impl std::error::Error for InvalidUrl {}

/// A set of errors that can occur during request dispatch and response reading.
#[derive(Debug, Display, From)]
#[non_exhaustive]
pub enum SendRequestError {
    /// Invalid URL
    #[display("Invalid URL: {}", _0)]
    Url(InvalidUrl),

    /// Failed to connect to host
    #[display("Failed to connect to host: {}", _0)]
    Connect(ConnectError),

    /// Error sending request
    Send(io::Error),

    /// Error parsing response
    Response(ParseError),

    /// Http error
    #[display("{}", _0)]
    Http(HttpError),

    /// Response took too long
    #[display("Timeout while waiting for response")]
    Timeout,

    /// Driver can not upgrade connections for this endpoint
    #[display("Tunnels are not supported for this connection")]
    TunnelNotSupported,

    /// Error sending request body
    Body(BoxError),

    /// Other errors that can occur after submitting a request.
    #[display("{:?}: {}", _1, _0)]
    Custom(BoxError, Box<dyn fmt::Debug>),
}

impl std::error::Error for SendRequestError {}

impl SendRequestError {
    /// Returns true when the failure happened before any byte of the request was written.
    ///
    /// Only acquisition failures qualify. Argument errors never succeed on retry and protocol
    /// errors may have reached the peer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SendRequestError::Connect(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SendRequestError::Connect(ConnectError::Timeout).is_retryable());
        assert!(SendRequestError::Connect(ConnectError::NoRecords).is_retryable());
        assert!(!SendRequestError::Url(InvalidUrl::MissingHost).is_retryable());
        assert!(!SendRequestError::Timeout.is_retryable());
        assert!(!SendRequestError::Send(io::Error::from(io::ErrorKind::BrokenPipe)).is_retryable());
    }

    #[test]
    fn display() {
        let err = SendRequestError::from(ConnectError::Timeout);
        assert_eq!(
            err.to_string(),
            "Failed to connect to host: Timeout while establishing connection"
        );

        let err = SendRequestError::from(InvalidUrl::MissingScheme);
        assert_eq!(err.to_string(), "Invalid URL: Missing URL scheme");
    }
}
