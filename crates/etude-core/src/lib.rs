// src/lib.rs
pub mod accounts;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod db;
pub mod error;
pub mod http;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod process_pool;
pub mod reactor;
pub mod resource;
pub mod routes;
pub mod script;
pub mod server;
pub mod signals;
pub mod syscalls;
pub mod table;
pub mod timer;
pub mod urlcode;

mod sync;

// Re-exports for users
pub use config::{Config, Model, TriggerMode};
pub use error::{EtudeError, EtudeResult};
pub use server::{Role, Server, ShutdownHandle};
pub use sync::Semaphore;
