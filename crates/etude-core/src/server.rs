// src/server.rs
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::accounts::Accounts;
use crate::config::{Config, Model};
use crate::conn::Shared;
use crate::error::EtudeResult;
use crate::metrics::ServerMetrics;
use crate::pool::ThreadPool;
use crate::process_pool::{PoolRole, ProcessPool};
use crate::reactor::{AcceptSource, Dispatch, Reactor};
use crate::resource::StaticResources;
use crate::routes::Services;
use crate::script::ScriptClient;
use crate::syscalls;

/// How `serve` returned: the process that owns the listener, or a forked worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Parent,
    Worker(usize),
}

/// Cloneable handle that asks a running server to stop.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct Server {
    config: Config,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<ServerMetrics>,
}

impl Server {
    /// Validate the configuration and open the listening socket.
    pub fn bind(config: Config) -> EtudeResult<Self> {
        config.validate()?;
        let addr = config.listen_addr()?;
        let listener = syscalls::create_listen_socket(addr)?;
        Ok(Self {
            config,
            listener,
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(ServerMetrics::new()),
        })
    }

    pub fn local_addr(&self) -> EtudeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Serve until shut down. In the process model this returns once in the
    /// parent and once in every worker.
    pub fn serve(self) -> EtudeResult<Role> {
        syscalls::ignore_sigpipe();
        let cfg = &self.config;

        let resources = Arc::new(StaticResources::scan(&cfg.doc_root)?);
        let accounts = Accounts::open(cfg.db_path.as_deref(), cfg.db_connections)?;
        let script = cfg.script_endpoint.map(ScriptClient::new);
        let services = Arc::new(Services::new(accounts, script));
        let addr = self.local_addr()?;
        info!(
            %addr,
            root = %resources.root().display(),
            files = resources.len(),
            model = ?cfg.model,
            "server starting"
        );

        let listen_fd = self.listener.as_raw_fd();
        let role = match cfg.model {
            Model::Threads => {
                let shared = Shared::new(
                    cfg.trigger,
                    Arc::clone(&self.metrics),
                    resources,
                    services,
                )?;
                let pool = ThreadPool::new(cfg.threads, cfg.max_jobs, cfg.pin_workers)?;
                Reactor::new(
                    shared,
                    AcceptSource::Listener(listen_fd),
                    Dispatch::Pool(pool),
                    cfg.max_connections,
                    Arc::clone(&self.shutdown),
                )?
                .run()?;
                Role::Parent
            }
            Model::Processes => match ProcessPool::create(listen_fd, cfg.processes)? {
                PoolRole::Parent(pool) => {
                    pool.run_parent(Arc::clone(&self.shutdown))?;
                    Role::Parent
                }
                PoolRole::Child { index, pipe } => {
                    let shared = Shared::new(
                        cfg.trigger,
                        Arc::new(ServerMetrics::new()),
                        resources,
                        services,
                    )?;
                    let result = Reactor::new(
                        shared,
                        AcceptSource::ControlPipe {
                            pipe,
                            listener: listen_fd,
                        },
                        Dispatch::Inline,
                        cfg.max_connections,
                        Arc::clone(&self.shutdown),
                    )
                    .and_then(Reactor::run);
                    syscalls::close_fd(pipe);
                    result?;
                    Role::Worker(index)
                }
            },
        };

        info!(?role, stats = ?self.metrics.snapshot(), "server stopped");
        Ok(role)
    }
}
