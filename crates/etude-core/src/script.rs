// src/script.rs
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use tracing::debug;

use crate::error::{EtudeError, EtudeResult};

/// Most bytes accepted back from the script endpoint.
pub const SCRIPT_OUTPUT_LIMIT: usize = 64 * 1024;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for the local script-execution endpoint.
///
/// The wire format is `<decimal length>\r\n<payload>`; the endpoint answers with raw
/// output and closes the connection.
#[derive(Debug, Clone)]
pub struct ScriptClient {
    endpoint: SocketAddr,
    timeout: Duration,
}

impl ScriptClient {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            timeout: IO_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Blocks the calling worker thread until the endpoint replies.
    pub fn run(&self, payload: &[u8]) -> EtudeResult<Vec<u8>> {
        let script_err = |e: std::io::Error| EtudeError::Script(format!("{}: {}", self.endpoint, e));

        let mut stream =
            TcpStream::connect_timeout(&self.endpoint, self.timeout).map_err(script_err)?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(script_err)?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(script_err)?;

        let mut request = format!("{}\r\n", payload.len()).into_bytes();
        request.extend_from_slice(payload);
        stream.write_all(&request).map_err(script_err)?;

        let mut output = Vec::new();
        stream
            .take(SCRIPT_OUTPUT_LIMIT as u64)
            .read_to_end(&mut output)
            .map_err(script_err)?;
        debug!(endpoint = %self.endpoint, bytes = output.len(), "script finished");
        Ok(output)
    }
}
