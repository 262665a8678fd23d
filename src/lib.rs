//! Client-side HTTP transport core.
//!
//! `courier` owns the lifecycle of pooled connections and runs individual request/response
//! exchanges over them, including streamed bodies and upgraded connections, under
//! cancellation and partial failure. Framing bytes on the wire is left to a [`Driver`].
//!
//! # Overview
//! - [`ConnectionPool`] keeps connections per [`EndpointKey`], sized by a [`PoolConfig`].
//! - [`PooledDispatcher`] acquires a connection, hands the request to the driver and decides
//!   whether the connection may be reused once the exchange is over.
//! - [`Client`] is an immutable set of request defaults in front of any [`Dispatcher`].
//! - [`middleware`] holds dispatcher decorators: retry, default headers and error mapping.
//!
//! ```no_run
//! use courier::{test::TestDriver, Client, PoolConfig};
//!
//! # async fn run() -> Result<(), courier::error::SendRequestError> {
//! let client = Client::builder()
//!     .pool(PoolConfig::fixed(10))
//!     .finish(TestDriver::new())
//!     .host("localhost")
//!     .port(8080);
//!
//! let mut res = client.get("/").await?;
//! let body = res.body().await;
//! # Ok(())
//! # }
//! ```
//!
//! All types are `!Send` and meant to live on a single actix runtime thread.

#![deny(rust_2018_idioms, nonstandard_style)]
#![warn(future_incompatible)]
#![allow(clippy::type_complexity)]

mod builder;
mod channel;
mod client;
mod config;
mod connection;
mod connector;
mod dispatch;
mod driver;
mod endpoint;
pub mod error;
pub mod middleware;
mod pool;
mod request;
mod response;

pub use self::builder::ClientBuilder;
pub use self::channel::{
    Channel, ChannelState, Completion, Exchange, ExchangeComplete, ResponseReady,
};
pub use self::client::{Client, ClientConfig};
pub use self::config::{ChannelOptions, ConnectorConfig, EndpointConfig, PoolConfig};
pub use self::connection::{BoxedSocket, ConnectionIo, Tunnel};
pub use self::connector::{DefaultConnector, DefaultIo, TcpConnector, TcpConnectorFuture};
pub use self::dispatch::{Dispatcher, PooledDispatcher};
pub use self::driver::Driver;
pub use self::endpoint::{Decompression, EndpointKey, Proxy, Scheme, TlsConfig};
pub use self::pool::{Acquired, ConnectionPool, ConnectionState, PoolStats};
pub use self::request::ClientRequest;
pub use self::response::{BoxedPayloadStream, ClientResponse, TrackedPayload};

pub mod http {
    //! Various HTTP related types.

    pub use actix_http::{header, uri, Method, StatusCode, Uri, Version};
}

pub(crate) type BoxError = Box<dyn std::error::Error>;
