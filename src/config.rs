//! Server configuration.
//!
//! Every field has a default; a TOML file only needs the values it changes:
//!
//! ```toml
//! addr = "0.0.0.0:8080"
//! request_timeout = 2.5   # seconds
//! worker_threads = 4
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::Error;
use crate::parser::Limits;

const MAX_CONNECTIONS_CEILING: usize = 1_000_000;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub addr: SocketAddr,

    pub max_header_size: usize,
    pub max_body_size: usize,

    /// Deadline for the middleware chain and handler of one request.
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
    /// How long the rest of a partially received request may take.
    #[serde(deserialize_with = "deserialize_duration")]
    pub read_timeout: Duration,
    /// Deadline for writing one response, streamed bodies included. The
    /// connection is dropped when it passes.
    #[serde(deserialize_with = "deserialize_duration")]
    pub write_timeout: Duration,
    /// How long an idle keep-alive connection is kept open.
    #[serde(deserialize_with = "deserialize_duration")]
    pub keep_alive_timeout: Duration,
    /// How long [`ServerHandle::stop`](crate::ServerHandle::stop) waits for
    /// in-flight requests before dropping them.
    #[serde(deserialize_with = "deserialize_duration")]
    pub drain_timeout: Duration,

    /// Worker threads, each with its own single-threaded runtime. `0` serves
    /// every connection on the runtime that called `start`.
    pub worker_threads: usize,
    /// Connections served at once. The listener stops accepting at the
    /// ceiling and resumes when a connection ends.
    pub max_connections: usize,
    pub read_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 9000)),

            max_header_size: 8192,
            max_body_size: 1024 * 1024, // 1 MiB

            request_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),

            worker_threads: 1,
            max_connections: 1024,
            read_buffer_size: 8192,
        }
    }
}

impl Config {
    /// Reads a TOML file; missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let sizes = [
            ("max_header_size", self.max_header_size),
            ("max_body_size", self.max_body_size),
            ("max_connections", self.max_connections),
            ("read_buffer_size", self.read_buffer_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(Error::InvalidConfig(format!("{name} must be greater than zero")));
        }
        if self.max_connections > MAX_CONNECTIONS_CEILING {
            return Err(Error::InvalidConfig(format!(
                "max_connections must be at most {MAX_CONNECTIONS_CEILING}"
            )));
        }

        let timeouts = [
            ("request_timeout", self.request_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("keep_alive_timeout", self.keep_alive_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::InvalidConfig(format!("{name} must be greater than zero")));
        }
        Ok(())
    }

    pub(crate) fn limits(&self) -> Limits {
        Limits { max_header_size: self.max_header_size, max_body_size: self.max_body_size }
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}
