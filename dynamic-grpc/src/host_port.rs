use std::fmt;

/// A `host:port` pair identifying one network endpoint of a service.
///
/// A [`HostPort`] can only be obtained through a validating constructor, so the
/// host is never empty and the port is always in `1..=65535`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPort {
    /// The hostname or IPv4 address.
    host: String,
    /// The port, never zero.
    port: u16,
}

impl HostPort {
    /// Parse a `host:port` string.
    ///
    /// Surrounding whitespace is ignored. Returns `None` when the separator is
    /// missing, the host is empty, or the port is not a number in `1..=65535`.
    ///
    /// ```
    /// use dynamic_grpc::HostPort;
    ///
    /// let endpoint = HostPort::parse("  wiremock:8080  ").unwrap();
    /// assert_eq!(endpoint.host(), "wiremock");
    /// assert_eq!(endpoint.port(), 8080);
    ///
    /// assert!(HostPort::parse("host:99999").is_none());
    /// ```
    pub fn parse(raw: &str) -> Option<Self> {
        let (host, port) = raw.trim().split_once(':')?;

        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        // Leading zeros can make an in-range port arbitrarily long.
        let port = port.trim_start_matches('0');
        if port.len() > 5 {
            return None;
        }
        let port: u32 = port.parse().unwrap_or(0);

        Self::from_parts(host, u16::try_from(port).ok()?)
    }

    /// Build a [`HostPort`] from an already split `host` and `port`.
    ///
    /// Returns `None` for an empty host or port `0`.
    pub fn from_parts<T: Into<String>>(host: T, port: u16) -> Option<Self> {
        let host = host.into();
        if host.is_empty() || port == 0 {
            return None;
        }
        Some(Self { host, port })
    }

    /// Get the `host` part of a `HostPort`.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the `port` part of a `HostPort`.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
