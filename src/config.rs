//! Server and security configuration (spec.md §4.4, §6).

/// Streaming server configuration (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Human-readable server name, echoed in `serverInfo` and `/health`.
    pub name: String,
    /// Address to bind, e.g. `"127.0.0.1:8080"`.
    pub address: String,
    /// Maximum simultaneously accepted connections. `0` means unlimited.
    pub max_concurrent_connections: usize,
    /// Maximum requests served on a single kept-alive connection before it
    /// is forced closed. `0` means unlimited.
    pub max_requests_per_connection: u64,
    /// Maximum request body size, in bytes.
    pub max_request_body_size: u64,
    /// Maximum request-target length, in bytes.
    pub max_request_uri_length: usize,
    /// Whether to enable TCP keep-alive probes on accepted sockets.
    pub tcp_keep_alive: bool,
    /// Buffer size used when reading header blocks and body chunks.
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "mcp-streaming".to_string(),
            address: "127.0.0.1:8080".to_string(),
            max_concurrent_connections: 0,
            max_requests_per_connection: 0,
            max_request_body_size: 10 * 1024 * 1024,
            max_request_uri_length: 8192,
            tcp_keep_alive: true,
            read_buffer_size: 8192,
        }
    }
}

impl ServerConfig {
    /// Start a builder seeded with the defaults.
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for [`ServerConfig`], mirroring the fluent configuration style
/// the rest of the stack uses for its config structs.
#[derive(Debug, Clone, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.config.address = address.into();
        self
    }

    pub fn max_concurrent_connections(mut self, n: usize) -> Self {
        self.config.max_concurrent_connections = n;
        self
    }

    pub fn max_requests_per_connection(mut self, n: u64) -> Self {
        self.config.max_requests_per_connection = n;
        self
    }

    pub fn max_request_body_size(mut self, n: u64) -> Self {
        self.config.max_request_body_size = n;
        self
    }

    pub fn max_request_uri_length(mut self, n: usize) -> Self {
        self.config.max_request_uri_length = n;
        self
    }

    pub fn tcp_keep_alive(mut self, enabled: bool) -> Self {
        self.config.tcp_keep_alive = enabled;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

/// Origin-validation policy (spec.md §6; the only authentication surface
/// this transport implements — a declared Non-goal excludes the rest).
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    /// Whether `Origin` is checked at all.
    pub validate_origin: bool,
    /// Explicit allow-list. Empty means "use the default localhost set".
    pub allowed_origins: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            validate_origin: true,
            allowed_origins: Vec::new(),
        }
    }
}

impl SecurityConfig {
    /// Default origins accepted when no explicit allow-list is configured.
    pub fn default_allowed_origins() -> &'static [&'static str] {
        &["http://localhost", "https://localhost", "http://127.0.0.1", "https://127.0.0.1"]
    }

    /// `true` iff `origin` is acceptable under this policy.
    pub fn allows(&self, origin: &str) -> bool {
        if !self.validate_origin {
            return true;
        }
        if self.allowed_origins.is_empty() {
            return Self::default_allowed_origins()
                .iter()
                .any(|allowed| origin.starts_with(allowed));
        }
        self.allowed_origins.iter().any(|allowed| allowed == origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_origin_policy_allows_localhost_variants() {
        let sec = SecurityConfig::default();
        assert!(sec.allows("http://localhost:3000"));
        assert!(sec.allows("https://127.0.0.1"));
        assert!(!sec.allows("https://evil.example"));
    }

    #[test]
    fn explicit_allow_list_overrides_defaults() {
        let sec = SecurityConfig {
            validate_origin: true,
            allowed_origins: vec!["https://app.example".to_string()],
        };
        assert!(sec.allows("https://app.example"));
        assert!(!sec.allows("http://localhost"));
    }

    #[test]
    fn disabled_validation_allows_everything() {
        let sec = SecurityConfig {
            validate_origin: false,
            allowed_origins: Vec::new(),
        };
        assert!(sec.allows("https://anything.example"));
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = ServerConfig::builder()
            .name("custom")
            .address("0.0.0.0:9090")
            .max_concurrent_connections(100)
            .build();
        assert_eq!(config.name, "custom");
        assert_eq!(config.address, "0.0.0.0:9090");
        assert_eq!(config.max_concurrent_connections, 100);
    }
}
