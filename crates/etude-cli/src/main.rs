use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use etude_core::{Config, Model, Role, Server, TriggerMode};
use tracing::{debug, error, info};

mod logging;
mod stress;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Epoll HTTP/1.1 static file server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a document root
    Serve(ServeArgs),
    /// Open keep-alive connections against a running server and count answers
    Stress {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
        /// Concurrent connections, one thread each
        #[arg(short, long, default_value_t = 100)]
        connections: usize,
        /// Requests per connection
        #[arg(short, long, default_value_t = 100)]
        requests: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TriggerArg {
    Edge,
    Level,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelArg {
    Threads,
    Processes,
}

/// Flags overlay the `--config` file, which overlays the defaults.
#[derive(Args, Default)]
struct ServeArgs {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    /// Document root
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long, value_enum)]
    model: Option<ModelArg>,
    /// Worker threads
    #[arg(short, long)]
    threads: Option<usize>,
    /// Worker processes (process model)
    #[arg(long)]
    processes: Option<usize>,
    #[arg(short = 'm', long, value_enum)]
    trigger: Option<TriggerArg>,
    #[arg(long)]
    max_jobs: Option<usize>,
    #[arg(long)]
    max_connections: Option<usize>,
    /// Pin worker threads to CPU cores
    #[arg(long)]
    pin: bool,
    /// User table file
    #[arg(long)]
    db_path: Option<PathBuf>,
    #[arg(long)]
    db_connections: Option<usize>,
    /// Endpoint that executes `run-script` payloads
    #[arg(long)]
    script: Option<SocketAddr>,
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[arg(long)]
    log_level: Option<String>,
    /// Do not log to stdout
    #[arg(short, long)]
    quiet: bool,
}

impl ServeArgs {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(host) = self.host {
            cfg.host = host;
        }
        if let Some(port) = self.port {
            cfg.port = port;
        }
        if let Some(root) = self.root {
            cfg.doc_root = root;
        }
        if let Some(model) = self.model {
            cfg.model = match model {
                ModelArg::Threads => Model::Threads,
                ModelArg::Processes => Model::Processes,
            };
        }
        if let Some(trigger) = self.trigger {
            cfg.trigger = match trigger {
                TriggerArg::Edge => TriggerMode::Edge,
                TriggerArg::Level => TriggerMode::Level,
            };
        }
        cfg.threads = self.threads.unwrap_or(cfg.threads);
        cfg.processes = self.processes.unwrap_or(cfg.processes);
        cfg.max_jobs = self.max_jobs.unwrap_or(cfg.max_jobs);
        cfg.max_connections = self.max_connections.unwrap_or(cfg.max_connections);
        cfg.db_connections = self.db_connections.unwrap_or(cfg.db_connections);
        cfg.pin_workers |= self.pin;
        cfg.db_path = self.db_path.or(cfg.db_path);
        cfg.script_endpoint = self.script.or(cfg.script_endpoint);
        cfg.log_file = self.log_file.or(cfg.log_file);
        if let Some(level) = self.log_level {
            cfg.log_level = level;
        }
        if self.quiet {
            cfg.verbose = false;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = args.into_config()?;
    logging::init(&config.log_level, config.verbose, config.log_file.as_deref())?;

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to bind");
            return Err(e).context("server setup failed");
        }
    };
    match server.serve() {
        Ok(Role::Parent) => info!("shut down cleanly"),
        Ok(Role::Worker(index)) => debug!(worker = index, "worker exiting"),
        Err(e) => {
            error!(error = %e, "server failed");
            return Err(e.into());
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args),
        Commands::Stress {
            addr,
            connections,
            requests,
        } => {
            logging::init("warn", true, None)?;
            println!(
                "Stressing {} with {} connections x {} requests",
                addr, connections, requests
            );
            let report = stress::run(addr, connections, requests);
            println!(
                "ok: {} | failed: {} | {:.2?} | {:.0} req/s",
                report.ok,
                report.failed,
                report.elapsed,
                report.requests_per_sec()
            );
            if report.failed > 0 {
                anyhow::bail!("{} requests failed", report.failed);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn serve_args(argv: &[&str]) -> ServeArgs {
        let mut full = vec!["etude", "serve"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).unwrap().command {
            Commands::Serve(args) => args,
            Commands::Stress { .. } => unreachable!(),
        }
    }

    #[test]
    fn flags_override_defaults() {
        let cfg = serve_args(&["-p", "9000", "-m", "level", "--threads", "3", "-q"])
            .into_config()
            .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.trigger, TriggerMode::Level);
        assert_eq!(cfg.threads, 3);
        assert!(!cfg.verbose);
        assert_eq!(cfg.host, "0.0.0.0");
    }

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 7000, "model": "processes", "processes": 4}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cfg = serve_args(&["--config", &path, "--processes", "2"])
            .into_config()
            .unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.model, Model::Processes);
        assert_eq!(cfg.processes, 2);
    }

    #[test]
    fn invalid_overlay_is_rejected() {
        assert!(serve_args(&["--threads", "0"]).into_config().is_err());
        assert!(ServeArgs::default().into_config().is_ok());
    }
}
