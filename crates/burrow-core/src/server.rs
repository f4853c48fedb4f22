use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::BurrowConfig;
use crate::error::{BurrowError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Line-protocol client for the server's host mutex: `lock <host>` /
/// `unlock <host>`, answered with `ok` or `busy`.
pub struct ServerClient {
    host: String,
    port: u16,
}

impl ServerClient {
    pub fn from_config(config: &BurrowConfig) -> Self {
        Self {
            host: config.server_host.clone(),
            port: config.server_port,
        }
    }

    fn connect(&self) -> std::io::Result<TcpStream> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no address for server")
            })?;
        TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
    }

    /// True when the server answers on its port. Migration refuses to run
    /// in that case.
    pub fn is_running(&self) -> bool {
        self.connect().is_ok()
    }

    /// Acquire the host-scoped mutex. The lock is released when the guard
    /// drops (or by the server noticing the connection close).
    pub fn lock_host(&self, host: &str) -> Result<HostLock> {
        let stream = self.connect().map_err(|e| {
            BurrowError::Other(format!(
                "cannot reach server at {}:{}: {e}; pass the mutex override if it is down",
                self.host, self.port
            ))
        })?;
        let mut lock = HostLock {
            stream,
            host: host.to_string(),
        };
        lock.send(&format!("lock {host}"))?;
        let reply = lock.recv()?;
        if reply.trim() == "ok" {
            debug!(host, "acquired host mutex");
            Ok(lock)
        } else {
            Err(BurrowError::Locked(host.to_string()))
        }
    }
}

/// Held host mutex; best-effort unlock on drop.
pub struct HostLock {
    stream: TcpStream,
    host: String,
}

impl HostLock {
    fn send(&mut self, line: &str) -> Result<()> {
        writeln!(self.stream, "{line}")?;
        Ok(())
    }

    fn recv(&mut self) -> Result<String> {
        let mut reader = BufReader::new(self.stream.try_clone()?);
        let mut line = String::new();
        reader.read_line(&mut line)?;
        Ok(line)
    }
}

impl Drop for HostLock {
    fn drop(&mut self) {
        let host = self.host.clone();
        if let Err(e) = self.send(&format!("unlock {host}")) {
            warn!(host, error = %e, "failed to release host mutex");
        }
    }
}
