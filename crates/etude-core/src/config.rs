// src/config.rs
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EtudeError, EtudeResult};

/// Seconds between two SIGALRM ticks driving idle-connection eviction.
pub const ALARM_INTERVAL_SECS: u32 = 5;

/// A connection with no traffic for this long is closed on the next tick.
pub const IDLE_TIMEOUT_SECS: u64 = 3 * ALARM_INTERVAL_SECS as u64;

/// Upper bound on events pulled out of one `epoll_wait` call.
pub const MAX_EVENTS: usize = 10_000;

/// Hard ceiling on worker processes in the process-pool back-end.
pub const MAX_PROCESSES: usize = 16;

/// Readiness notification mode used for client sockets and the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    /// Notify once per state change; handlers drain until would-block.
    #[default]
    Edge,
    /// Notify while data remains; handlers do one bounded step per event.
    Level,
}

/// Which concurrency back-end dispatches parsed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    /// One reactor thread feeding a fixed pool of worker threads.
    #[default]
    Threads,
    /// Pre-forked worker processes, each running its own reactor.
    Processes,
}

/// Server configuration, parsed once at startup and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address to bind (default: 0.0.0.0)
    pub host: String,

    /// Port to bind (default: 8080)
    pub port: u16,

    /// Directory scanned at startup and served read-only.
    pub doc_root: PathBuf,

    pub model: Model,

    /// Worker threads for the thread-pool back-end (default: all cores)
    pub threads: usize,

    /// Worker processes for the process-pool back-end.
    pub processes: usize,

    /// Bound on queued jobs before new work is rejected as "server busy".
    pub max_jobs: usize,

    /// Capacity of the descriptor-indexed connection table.
    pub max_connections: usize,

    pub trigger: TriggerMode,

    /// Pin worker threads to CPU cores.
    pub pin_workers: bool,

    /// JSON file holding the user table. `None` keeps accounts in memory only.
    pub db_path: Option<PathBuf>,

    /// Number of pooled database connections.
    pub db_connections: usize,

    /// Where `run-script` posts are forwarded. `None` disables the route.
    pub script_endpoint: Option<SocketAddr>,

    pub log_file: Option<PathBuf>,
    pub log_level: String,

    /// Mirror log output to stdout.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            doc_root: PathBuf::from("./root"),
            model: Model::Threads,
            threads: num_cpus::get(),
            processes: 8,
            max_jobs: 10_000,
            max_connections: 65_535,
            trigger: TriggerMode::Edge,
            pin_workers: false,
            db_path: None,
            db_connections: 8,
            script_endpoint: None,
            log_file: None,
            log_level: "info".to_string(),
            verbose: true,
        }
    }
}

impl Config {
    /// Load a JSON configuration file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> EtudeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            EtudeError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| EtudeError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn listen_addr(&self) -> EtudeResult<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .or_else(|_| format!("[{}]:{}", self.host, self.port).parse())
            .map_err(|_| EtudeError::Config(format!("bad listen address {}:{}", self.host, self.port)))
    }

    pub fn validate(&self) -> EtudeResult<()> {
        if self.threads == 0 {
            return Err(EtudeError::Config("threads must be at least 1".into()));
        }
        if self.max_jobs == 0 {
            return Err(EtudeError::Config("max_jobs must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(EtudeError::Config("max_connections must be at least 1".into()));
        }
        if self.processes == 0 || self.processes > MAX_PROCESSES {
            return Err(EtudeError::Config(format!(
                "processes must be within 1..={}",
                MAX_PROCESSES
            )));
        }
        if self.db_connections == 0 {
            return Err(EtudeError::Config("db_connections must be at least 1".into()));
        }
        self.listen_addr()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.trigger, TriggerMode::Edge);
        assert_eq!(config.listen_addr().unwrap().port(), 8080);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "port": 9000, "trigger": "level", "model": "processes" }"#)
                .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.trigger, TriggerMode::Level);
        assert_eq!(config.model, Model::Processes);
        assert_eq!(config.max_connections, 65_535);
    }

    #[test]
    fn rejects_out_of_range_processes() {
        let config = Config {
            processes: MAX_PROCESSES + 1,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(EtudeError::Config(_))));
    }

    #[test]
    fn accepts_ipv6_hosts() {
        let config = Config {
            host: "::1".into(),
            port: 80,
            ..Config::default()
        };
        assert!(config.listen_addr().unwrap().is_ipv6());
    }
}
