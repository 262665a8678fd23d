//! Endpoint identity used to partition the connection pool.

use std::fmt;

use http::{uri::Authority, Uri};

use crate::{config::EndpointConfig, error::InvalidUrl};

/// URI scheme of a pooled endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    fn parse(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(Scheme::Http),
            "https" => Some(Scheme::Https),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            _ => None,
        }
    }

    /// Port used when the URI does not carry one.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http | Scheme::Ws => 80,
            Scheme::Https | Scheme::Wss => 443,
        }
    }

    /// Returns true for schemes that require a TLS session.
    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forward proxy that connections for an endpoint are routed through.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    authority: Authority,
}

impl Proxy {
    pub fn new(authority: Authority) -> Self {
        Self { authority }
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }
}

/// Opaque TLS parameters.
///
/// The transport core never interprets these; they only partition the pool so that
/// connections negotiated under different parameters are never shared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TlsConfig {
    pub server_name: Option<String>,
    pub alpn: Vec<Vec<u8>>,
    pub verify_certificates: bool,
}

/// Response body decompression policy handed to the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Decompression {
    #[default]
    Disabled,

    /// Decode known encodings, pass unknown ones through.
    NonStrict,

    /// Decode known encodings, fail on unknown ones.
    Strict,
}

/// Identity of a pooled connection target.
///
/// Two requests with equal keys may share a connection; requests whose keys differ in any
/// field never do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    scheme: Scheme,
    host: String,
    port: u16,
    proxy: Option<Proxy>,
    tls: Option<TlsConfig>,
    max_header_size: usize,
    decompression: Decompression,
}

impl EndpointKey {
    /// Builds a key for an absolute URI.
    ///
    /// Relative targets are rejected; there is no implicit default host.
    pub fn from_uri(uri: &Uri, config: &EndpointConfig) -> Result<Self, InvalidUrl> {
        let scheme = uri.scheme_str().ok_or(InvalidUrl::MissingScheme)?;
        let scheme = Scheme::parse(scheme).ok_or(InvalidUrl::UnknownScheme)?;

        let host = match uri.host() {
            Some(host) if !host.is_empty() => host.to_ascii_lowercase(),
            _ => return Err(InvalidUrl::MissingHost),
        };

        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        Ok(EndpointKey {
            scheme,
            host,
            port,
            proxy: config.proxy.clone(),
            tls: if scheme.is_secure() {
                config.tls.clone()
            } else {
                None
            },
            max_header_size: config.max_header_size,
            decompression: config.decompression,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size
    }

    pub fn decompression(&self) -> Decompression {
        self.decompression
    }

    /// Authority the transport must connect to: the proxy when one is set, the endpoint
    /// otherwise.
    pub(crate) fn connect_uri(&self) -> Result<Uri, http::Error> {
        let builder = Uri::builder().path_and_query("/");

        match self.proxy {
            Some(ref proxy) => builder
                .scheme("http")
                .authority(proxy.authority().clone())
                .build(),
            None => {
                let authority = format!("{}:{}", self.host, self.port);
                builder
                    .scheme(self.scheme.as_str())
                    .authority(authority.as_str())
                    .build()
            }
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;

        if let Some(ref proxy) = self.proxy {
            write!(f, " via {}", proxy.authority())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(uri: &'static str) -> Result<EndpointKey, InvalidUrl> {
        EndpointKey::from_uri(&Uri::from_static(uri), &EndpointConfig::default())
    }

    #[test]
    fn default_ports() {
        assert_eq!(key("http://localhost/a").unwrap().port(), 80);
        assert_eq!(key("https://localhost").unwrap().port(), 443);
        assert_eq!(key("ws://localhost:9000").unwrap().port(), 9000);
    }

    #[test]
    fn explicit_default_port_shares_key() {
        assert_eq!(key("http://example.com:80/x").unwrap(), key("http://example.com/y").unwrap());
        assert_eq!(key("http://EXAMPLE.com").unwrap(), key("http://example.com").unwrap());
    }

    #[test]
    fn distinct_fields_partition() {
        assert_ne!(key("http://example.com").unwrap(), key("https://example.com").unwrap());
        assert_ne!(key("http://example.com").unwrap(), key("http://example.com:8080").unwrap());

        let uri = Uri::from_static("http://example.com");
        let small = EndpointConfig {
            max_header_size: 1024,
            ..EndpointConfig::default()
        };
        assert_ne!(
            EndpointKey::from_uri(&uri, &small).unwrap(),
            EndpointKey::from_uri(&uri, &EndpointConfig::default()).unwrap()
        );

        let proxied = EndpointConfig {
            proxy: Some(Proxy::new(Authority::from_static("proxy:3128"))),
            ..EndpointConfig::default()
        };
        assert_ne!(
            EndpointKey::from_uri(&uri, &proxied).unwrap(),
            EndpointKey::from_uri(&uri, &EndpointConfig::default()).unwrap()
        );
    }

    #[test]
    fn tls_config_only_partitions_secure_schemes() {
        let tls = EndpointConfig {
            tls: Some(TlsConfig {
                server_name: Some("internal".to_owned()),
                ..TlsConfig::default()
            }),
            ..EndpointConfig::default()
        };

        let plain = Uri::from_static("http://example.com");
        assert_eq!(
            EndpointKey::from_uri(&plain, &tls).unwrap(),
            EndpointKey::from_uri(&plain, &EndpointConfig::default()).unwrap()
        );

        let secure = Uri::from_static("https://example.com");
        assert!(EndpointKey::from_uri(&secure, &tls).unwrap().tls().is_some());
    }

    #[test]
    fn relative_targets_are_rejected() {
        assert!(matches!(key("/users"), Err(InvalidUrl::MissingScheme)));
        assert!(matches!(key("ftp://example.com"), Err(InvalidUrl::UnknownScheme)));
    }

    #[test]
    fn connect_uri_targets_proxy() {
        let uri = Uri::from_static("https://example.com/path");
        let config = EndpointConfig {
            proxy: Some(Proxy::new(Authority::from_static("proxy:3128"))),
            ..EndpointConfig::default()
        };
        let key = EndpointKey::from_uri(&uri, &config).unwrap();
        assert_eq!(key.connect_uri().unwrap(), "http://proxy:3128/");

        let key = EndpointKey::from_uri(&uri, &EndpointConfig::default()).unwrap();
        assert_eq!(key.connect_uri().unwrap(), "https://example.com:443/");
    }
}
