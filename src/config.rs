use std::{net::IpAddr, time::Duration};

use crate::endpoint::{Decompression, Proxy, TlsConfig};

const DEFAULT_POOL_SIZE: usize = 100;
const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;

/// Connection pool sizing policy.
///
/// Sizing applies per [`EndpointKey`](crate::EndpointKey); changing policy requires building a
/// new pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolConfig {
    /// Connections are never reused. Every request opens a fresh connection that is closed
    /// once the exchange is done.
    Disabled,

    /// At most `size` live connections per endpoint. Requests beyond capacity wait in FIFO
    /// order for a connection to be released.
    Fixed(usize),

    /// Connections are created on demand up to `maximum`. Idle connections beyond `minimum`
    /// are closed once they have been idle for `ttl`.
    Dynamic {
        minimum: usize,
        maximum: usize,
        ttl: Duration,
    },
}

impl PoolConfig {
    /// Fixed size pool.
    ///
    /// A size of 0 would make every request wait forever, so it is treated as
    /// [`PoolConfig::Disabled`].
    pub fn fixed(size: usize) -> Self {
        PoolConfig::Fixed(size).normalize()
    }

    /// Dynamically sized pool. Returns `None` when `minimum > maximum` or `maximum` is 0.
    pub fn dynamic(minimum: usize, maximum: usize, ttl: Duration) -> Option<Self> {
        if minimum > maximum || maximum == 0 {
            return None;
        }

        Some(PoolConfig::Dynamic {
            minimum,
            maximum,
            ttl,
        })
    }

    /// Connections may be returned to the pool after an exchange.
    pub fn keep_alive(&self) -> bool {
        !matches!(self, PoolConfig::Disabled)
    }

    /// Maps policies that could never hand out a connection onto ones that can.
    ///
    /// `Fixed(0)` and a dynamic pool with a `maximum` of 0 become `Disabled`. A dynamic
    /// `minimum` above `maximum` is lowered to `maximum`.
    pub(crate) fn normalize(self) -> Self {
        match self {
            PoolConfig::Fixed(0) => {
                log::warn!("fixed connection pool of size 0 requested; pooling disabled");
                PoolConfig::Disabled
            }
            PoolConfig::Dynamic { maximum: 0, .. } => {
                log::warn!("dynamic connection pool with maximum 0 requested; pooling disabled");
                PoolConfig::Disabled
            }
            PoolConfig::Dynamic {
                minimum,
                maximum,
                ttl,
            } if minimum > maximum => {
                log::warn!(
                    "dynamic pool minimum {minimum} exceeds maximum {maximum}; using {maximum}"
                );
                PoolConfig::Dynamic {
                    minimum: maximum,
                    maximum,
                    ttl,
                }
            }
            pool => pool,
        }
    }

    /// Maximum number of live connections per endpoint. `None` means unbounded.
    pub(crate) fn capacity(&self) -> Option<usize> {
        match *self {
            PoolConfig::Disabled => None,
            PoolConfig::Fixed(size) => Some(size),
            PoolConfig::Dynamic { maximum, .. } => Some(maximum),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig::Fixed(DEFAULT_POOL_SIZE)
    }
}

/// Connector and pool configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub(crate) pool: PoolConfig,
    pub(crate) timeout: Duration,
    pub(crate) conn_lifetime: Duration,
    pub(crate) conn_keep_alive: Duration,
    pub(crate) disconnect_timeout: Option<Duration>,
    pub(crate) local_address: Option<IpAddr>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            timeout: Duration::from_secs(5),
            conn_lifetime: Duration::from_secs(75),
            conn_keep_alive: Duration::from_secs(15),
            disconnect_timeout: Some(Duration::from_millis(3000)),
            local_address: None,
        }
    }
}

impl ConnectorConfig {
    /// Sets connection pool sizing policy.
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets TCP connection timeout.
    ///
    /// This is the max time allowed to connect to remote host, including DNS name resolution.
    ///
    /// By default, the timeout is 5 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set keep-alive period for opened connection.
    ///
    /// Keep-alive period is the period between connection usage. If the delay between repeated
    /// usages of the same connection exceeds this period, the connection is closed.
    /// Default keep-alive period is 15 seconds.
    pub fn conn_keep_alive(mut self, dur: Duration) -> Self {
        self.conn_keep_alive = dur;
        self
    }

    /// Set max lifetime period for connection.
    ///
    /// Connection lifetime is max lifetime of any opened connection until it is closed
    /// regardless of keep-alive period.
    /// Default lifetime period is 75 seconds.
    pub fn conn_lifetime(mut self, dur: Duration) -> Self {
        self.conn_lifetime = dur;
        self
    }

    /// Set connection disconnect timeout.
    ///
    /// Defines a timeout for the graceful shutdown of a closed connection. If the shutdown
    /// does not complete within this time, the socket is dropped.
    ///
    /// By default disconnect timeout is set to 3000 milliseconds.
    pub fn disconnect_timeout(mut self, dur: Duration) -> Self {
        self.disconnect_timeout = Some(dur);
        self
    }

    /// Drop closed connections immediately instead of shutting them down gracefully.
    pub fn no_disconnect_timeout(mut self) -> Self {
        self.disconnect_timeout = None;
        self
    }

    /// Set local IP Address the connector would use for establishing connection.
    pub fn local_address(mut self, addr: IpAddr) -> Self {
        self.local_address = Some(addr);
        self
    }
}

/// Per-endpoint parameters that become part of every [`EndpointKey`](crate::EndpointKey).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub max_header_size: usize,
    pub decompression: Decompression,
    pub proxy: Option<Proxy>,
    pub tls: Option<TlsConfig>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            decompression: Decompression::default(),
            proxy: None,
            tls: None,
        }
    }
}

/// Options passed to the driver for a single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Buffer the full response body before resolving the response.
    pub aggregate: bool,

    /// The connection may be reused after this exchange.
    pub keep_alive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_constructors() {
        assert_eq!(PoolConfig::fixed(0), PoolConfig::Disabled);
        assert_eq!(PoolConfig::fixed(4), PoolConfig::Fixed(4));

        let ttl = Duration::from_secs(1);
        assert!(PoolConfig::dynamic(2, 1, ttl).is_none());
        assert!(PoolConfig::dynamic(0, 0, ttl).is_none());
        assert_eq!(
            PoolConfig::dynamic(1, 3, ttl),
            Some(PoolConfig::Dynamic {
                minimum: 1,
                maximum: 3,
                ttl
            })
        );
    }

    #[test]
    fn normalize_unusable_policies() {
        let ttl = Duration::from_secs(1);

        assert_eq!(PoolConfig::Fixed(0).normalize(), PoolConfig::Disabled);
        assert_eq!(PoolConfig::Fixed(2).normalize(), PoolConfig::Fixed(2));
        assert_eq!(
            PoolConfig::Dynamic {
                minimum: 0,
                maximum: 0,
                ttl
            }
            .normalize(),
            PoolConfig::Disabled
        );
        assert_eq!(
            PoolConfig::Dynamic {
                minimum: 5,
                maximum: 2,
                ttl
            }
            .normalize(),
            PoolConfig::Dynamic {
                minimum: 2,
                maximum: 2,
                ttl
            }
        );
    }

    #[test]
    fn keep_alive_capability() {
        assert!(!PoolConfig::Disabled.keep_alive());
        assert!(PoolConfig::Fixed(1).keep_alive());
        assert!(PoolConfig::dynamic(0, 1, Duration::from_secs(1))
            .unwrap()
            .keep_alive());
    }

    #[test]
    fn capacity() {
        assert_eq!(PoolConfig::Disabled.capacity(), None);
        assert_eq!(PoolConfig::Fixed(7).capacity(), Some(7));
        assert_eq!(
            PoolConfig::dynamic(1, 3, Duration::from_secs(1))
                .unwrap()
                .capacity(),
            Some(3)
        );
    }
}
