use nix::sys::socket::Backlog;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;

/// How a response is written back when the socket does not take it all at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WritePolicy {
    /// Keep the unsent remainder and flush it when the socket becomes writable
    #[default]
    Retry,
    /// Issue one write per response and drop whatever did not fit
    Single,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// IPv4 bind address
    pub bind_addr: String,

    /// Port to listen on (0 lets the OS pick one)
    pub port: u16,

    /// Maximum readiness events fetched per wait
    pub max_events: usize,

    /// Per-read buffer capacity; one read of up to this many bytes is one request
    pub buffer_size: usize,

    /// Pending-connection backlog for the listening socket
    pub backlog: u32,

    /// Number of independent dispatch loops
    pub threads: usize,

    /// Worker threads running the command processor (0 = inline on the dispatch thread)
    pub processor_threads: usize,

    /// Short-write handling
    pub write_policy: WritePolicy,

    /// Queued response bytes at which a connection stops being read
    pub write_high_watermark: usize,

    /// Queued response bytes at which reading resumes
    pub write_low_watermark: usize,

    /// TCP nodelay
    pub tcp_nodelay: bool,

    /// Memory cap for the key/value store backing the default processor
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<usize>,

    /// Log level
    pub log_level: String,

    /// Append log output to this file as well as the console
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8888,
            max_events: 8,
            buffer_size: 512,
            backlog: 16,
            threads: 1,
            processor_threads: 0,
            write_policy: WritePolicy::Retry,
            write_high_watermark: 256 * 1024,
            write_low_watermark: 128 * 1024,
            tcp_nodelay: true,
            max_memory: None,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Keys missing from the file keep their defaults.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use kvfront::Config;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = Config::from_file("kvfront.toml")?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_events == 0 {
            anyhow::bail!("max_events must be > 0");
        }

        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size must be > 0");
        }

        // Same bound listen(2) is given, so an out-of-range backlog fails here
        let in_range = i32::try_from(self.backlog)
            .ok()
            .is_some_and(|backlog| backlog > 0 && Backlog::new(backlog).is_ok());
        if !in_range {
            anyhow::bail!(
                "backlog {} is outside the range accepted by listen",
                self.backlog
            );
        }

        if self.write_high_watermark == 0 {
            anyhow::bail!("write_high_watermark must be > 0");
        }

        if self.write_low_watermark >= self.write_high_watermark {
            anyhow::bail!("write_low_watermark must be below write_high_watermark");
        }

        if self.threads == 0 {
            anyhow::bail!("threads must be > 0");
        }

        self.listen_addr()?;

        Ok(())
    }

    /// Socket address the acceptor binds to
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddrV4> {
        let ip: Ipv4Addr = self
            .bind_addr
            .parse()
            .map_err(|_| anyhow::anyhow!("bind_addr '{}' is not an IPv4 address", self.bind_addr))?;
        Ok(SocketAddrV4::new(ip, self.port))
    }

    /// Whether requests are handed to a worker pool instead of run inline
    pub fn offloads_processor(&self) -> bool {
        self.processor_threads > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.port, 8888);
        assert_eq!(config.max_events, 8);
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.backlog, 16);
        assert_eq!(config.write_policy, WritePolicy::Retry);
        assert!(!config.offloads_processor());
        assert!(config.validate().is_ok());
    }

    #[rstest]
    #[case::max_events(Config { max_events: 0, ..Default::default() }, "max_events")]
    #[case::buffer_size(Config { buffer_size: 0, ..Default::default() }, "buffer_size")]
    #[case::backlog_zero(Config { backlog: 0, ..Default::default() }, "backlog")]
    #[case::backlog_overflow(Config { backlog: u32::MAX, ..Default::default() }, "backlog")]
    #[case::backlog_above_listen_max(Config { backlog: 5000, ..Default::default() }, "backlog")]
    #[case::high_watermark(
        Config { write_high_watermark: 0, ..Default::default() },
        "write_high_watermark"
    )]
    #[case::watermark_order(
        Config { write_high_watermark: 1024, write_low_watermark: 1024, ..Default::default() },
        "write_low_watermark"
    )]
    #[case::threads(Config { threads: 0, ..Default::default() }, "threads")]
    #[case::ipv6(Config { bind_addr: "::1".to_string(), ..Default::default() }, "IPv4")]
    fn validate_rejects(#[case] config: Config, #[case] needle: &str) {
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains(needle), "{err}");
    }

    #[test]
    fn common_backlogs_are_accepted() {
        for backlog in [1, 128, 1024] {
            let config = Config {
                backlog,
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "backlog {backlog}");
        }
    }

    #[test]
    fn listen_addr_uses_bind_addr_and_port() {
        let config = Config {
            bind_addr: "127.0.0.1".to_string(),
            port: 9000,
            ..Default::default()
        };
        assert_eq!(
            config.listen_addr().unwrap(),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000)
        );
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvfront.toml");
        fs::write(&path, "port = 7000\nwrite_policy = \"single\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.write_policy, WritePolicy::Single);
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.bind_addr, "0.0.0.0");
    }

    #[test]
    fn saved_file_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvfront.toml");
        let config = Config {
            processor_threads: 4,
            log_file: Some("server.log".to_string()),
            ..Default::default()
        };
        config.to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.processor_threads, 4);
        assert_eq!(loaded.log_file.as_deref(), Some("server.log"));
        assert_eq!(loaded.max_memory, None);
    }
}
