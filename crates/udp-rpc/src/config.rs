//! Endpoint configuration.

use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::transport::DatagramSocket;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Default maximum encoded size of a single datagram.
pub const DEFAULT_MAX_TRANSMIT_SIZE: usize = 1024;

/// Default length of generated session identifiers.
pub const DEFAULT_SESSION_ID_LEN: usize = 16;

/// Shortest session identifier an endpoint will generate.
pub const MIN_SESSION_ID_LEN: usize = 8;

/// Configuration for an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// UDP port bound on all interfaces. Zero picks an ephemeral port.
    pub port: u16,
    /// Sessions idle for this long are evicted.
    pub max_idle_lifetime: Duration,
    /// Timeout for calls that do not specify one.
    pub default_timeout: Duration,
    /// Length of generated session identifiers, raised to at least
    /// [`MIN_SESSION_ID_LEN`].
    pub session_id_len: usize,
    /// Maximum encoded size of a datagram, in bytes.
    pub max_transmit_size: usize,
    /// How many identifiers to draw before giving up on a new session.
    pub max_session_id_attempts: usize,
}

impl EndpointConfig {
    /// Address the endpoint listens on.
    #[must_use]
    pub const fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            port: 0,
            max_idle_lifetime: Duration::from_secs(60),
            default_timeout: Duration::from_secs(5),
            session_id_len: DEFAULT_SESSION_ID_LEN,
            max_transmit_size: DEFAULT_MAX_TRANSMIT_SIZE,
            max_session_id_attempts: 16,
        }
    }
}

/// Builder for creating endpoints.
#[derive(Debug, Clone, Default)]
pub struct EndpointBuilder {
    config: EndpointConfig,
}

impl EndpointBuilder {
    /// Create a new endpoint builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the UDP port to listen on.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the idle lifetime after which sessions are evicted.
    #[must_use]
    pub const fn max_idle_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_idle_lifetime = lifetime;
        self
    }

    /// Set the idle lifetime in microseconds.
    #[must_use]
    pub const fn max_idle_lifetime_micros(self, micros: u64) -> Self {
        self.max_idle_lifetime(Duration::from_micros(micros))
    }

    /// Set the default call timeout.
    #[must_use]
    pub const fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    /// Set the length of generated session identifiers.
    ///
    /// Lengths below [`MIN_SESSION_ID_LEN`] are raised to it.
    #[must_use]
    pub const fn session_id_len(mut self, len: usize) -> Self {
        self.config.session_id_len = if len < MIN_SESSION_ID_LEN {
            MIN_SESSION_ID_LEN
        } else {
            len
        };
        self
    }

    /// Set how many identifiers to draw before refusing a new session.
    #[must_use]
    pub const fn max_session_id_attempts(mut self, attempts: usize) -> Self {
        self.config.max_session_id_attempts = attempts;
        self
    }

    /// Set the maximum encoded datagram size.
    #[must_use]
    pub const fn max_transmit_size(mut self, size: usize) -> Self {
        self.config.max_transmit_size = size;
        self
    }

    /// The configuration built so far.
    #[must_use]
    pub const fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Bind a UDP socket and build the endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Bind`] if the port cannot be bound.
    pub async fn bind(self) -> Result<Endpoint<UdpSocket>> {
        Endpoint::bind(self.config).await
    }

    /// Build the endpoint over an existing socket.
    pub fn build_with_socket<S: DatagramSocket>(self, socket: S) -> Endpoint<S> {
        Endpoint::with_socket(socket, self.config)
    }
}
