use serde::Serialize;
use std::time::Duration;

/// Configuration of one network endpoint. Immutable once the group is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerDescriptor {
    /// Name used in logs, metrics and errors (`main`, `metrics`, `diagnostics`)
    pub name: String,
    pub bind: String,
    /// Port to listen on; 0 lets the OS pick one
    pub port: u16,
    pub enabled: bool,
    /// Time allowed for a client to send request headers
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// Time allowed for a handler to produce a response
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl ListenerDescriptor {
    /// Enabled descriptor with the default five second timeouts.
    pub fn new(name: impl Into<String>, bind: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            bind: bind.into(),
            port,
            enabled: true,
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_timeouts(mut self, read_timeout: Duration, write_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self.write_timeout = write_timeout;
        self
    }

    /// `bind:port`, as passed to the socket layer.
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
