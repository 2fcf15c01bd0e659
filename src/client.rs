use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("resolveTargetAddr ('{0}') is not in the expected format 'hostname:ip:port'")]
    ResolveFormat(String),

    #[error("resolveTargetAddr: {part} part cannot be empty. Format: 'hostname:ip:port'")]
    ResolveEmptyPart { part: &'static str },

    #[error("resolveTargetAddr: failed to parse '{value}' as an address: {message}")]
    ResolveAddress { value: String, message: String },

    #[error("Failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

/// Connection reuse settings for the shared client.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionPoolConfig {
    /// Maximum idle connections to keep per host
    pub max_idle_per_host: usize,

    /// How long idle connections stay in the pool before cleanup
    pub idle_timeout: Duration,

    /// TCP keepalive duration
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 32,
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl ConnectionPoolConfig {
    /// Apply this configuration to a reqwest ClientBuilder.
    pub fn apply_to_builder(&self, builder: reqwest::ClientBuilder) -> reqwest::ClientBuilder {
        let mut builder = builder
            .pool_max_idle_per_host(self.max_idle_per_host)
            .pool_idle_timeout(self.idle_timeout);

        if let Some(keepalive) = self.tcp_keepalive {
            builder = builder.tcp_keepalive(keepalive);
        }

        builder
    }
}

/// Configuration for building the HTTP client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Per-request bound; expiry is recorded as a timeout failure.
    pub request_timeout: Duration,
    pub skip_tls_verify: bool,
    /// `hostname:ip:port`
    pub resolve_target_addr: Option<String>,
    pub pool: ConnectionPoolConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            skip_tls_verify: false,
            resolve_target_addr: None,
            pool: ConnectionPoolConfig::default(),
        }
    }
}

/// Builds the one client shared by every worker for the run.
pub fn build_client(config: &ClientConfig) -> Result<reqwest::Client, ClientError> {
    let mut client_builder = reqwest::Client::builder().timeout(config.request_timeout);

    // DNS Override Configuration
    if let Some(ref resolve_str) = config.resolve_target_addr {
        if !resolve_str.is_empty() {
            let (hostname, socket_addr) = parse_resolve_override(resolve_str)?;
            client_builder = client_builder.resolve(&hostname, socket_addr);
            info!(
                hostname = %hostname,
                addr = %socket_addr,
                "Configured DNS override"
            );
        } else {
            warn!("resolveTargetAddr is set but empty, no DNS override will be applied");
        }
    }

    client_builder = config.pool.apply_to_builder(client_builder);
    info!(
        max_idle_per_host = config.pool.max_idle_per_host,
        idle_timeout_secs = config.pool.idle_timeout.as_secs(),
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        "Connection pool configured"
    );

    let client = if config.skip_tls_verify {
        warn!("Skipping TLS certificate verification");
        client_builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?
    } else {
        client_builder.build()?
    };

    Ok(client)
}

/// Parses `hostname:ip:port` into the hostname to override and where it resolves.
pub fn parse_resolve_override(resolve_str: &str) -> Result<(String, SocketAddr), ClientError> {
    let parts: Vec<&str> = resolve_str.split(':').collect();
    if parts.len() != 3 {
        return Err(ClientError::ResolveFormat(resolve_str.to_string()));
    }

    let hostname = parts[0].trim();
    let ip = parts[1].trim();
    let port = parts[2].trim();

    if hostname.is_empty() {
        return Err(ClientError::ResolveEmptyPart { part: "hostname" });
    }
    if ip.is_empty() {
        return Err(ClientError::ResolveEmptyPart { part: "IP address" });
    }
    if port.is_empty() {
        return Err(ClientError::ResolveEmptyPart { part: "port" });
    }

    let port: u16 = port.parse().map_err(|e: std::num::ParseIntError| {
        ClientError::ResolveAddress {
            value: port.to_string(),
            message: e.to_string(),
        }
    })?;

    let socket_addr_str = format!("{}:{}", ip, port);
    let socket_addr: SocketAddr =
        socket_addr_str
            .parse()
            .map_err(|e: std::net::AddrParseError| ClientError::ResolveAddress {
                value: socket_addr_str.clone(),
                message: e.to_string(),
            })?;

    Ok((hostname.to_string(), socket_addr))
}
