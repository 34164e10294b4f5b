//! Accept loop and command handling.

use shmlink::config::TransportConfig;
use shmlink::consts::SHM_OPEN_COMMAND;
use shmlink_transport::{Connection, Reply, Role, TransportError};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Pause between two accept attempts while idle.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Errors of the echo peer.
#[derive(Debug, Error)]
pub enum EchoError {
    /// The listening socket could not be set up
    #[error("Can't listen on {path}: {source}")]
    Bind {
        /// Socket path
        path: PathBuf,
        /// Source IO error
        source: std::io::Error,
    },

    /// Accepting a connection failed
    #[error("Accept failed: {0}")]
    Accept(#[from] std::io::Error),

    /// A connection failed
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Unix socket server handing each client its own thread.
pub struct EchoServer {
    listener: UnixListener,
    path: PathBuf,
    transport: TransportConfig,
    running: Arc<AtomicBool>,
}

impl EchoServer {
    /// Listen on `path`, replacing a stale socket file.
    ///
    /// Accepted connections always block: the server has nothing else to do
    /// while waiting for the next command.
    pub fn bind(path: &Path, transport: TransportConfig) -> Result<Self, EchoError> {
        let bind_err = |source| EchoError::Bind {
            path: path.to_path_buf(),
            source,
        };

        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }
        let listener = UnixListener::bind(path).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;

        info!(path = %path.display(), "listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            transport: TransportConfig {
                blocking: true,
                ..transport
            },
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the running flag for signal handlers.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Accept connections until the running flag is cleared.
    pub fn run(&self) -> Result<(), EchoError> {
        let mut accepted = 0u64;
        while self.running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    accepted += 1;
                    self.spawn_client(stream, accepted);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(accepted, "accept loop stopped");
        Ok(())
    }

    fn spawn_client(&self, stream: UnixStream, id: u64) {
        let config = self.transport;
        std::thread::spawn(move || {
            let result = Connection::new(stream, Role::Server, config)
                .and_then(|mut conn| serve_connection(&mut conn));
            match result {
                Ok(commands) => info!(client = id, commands, "client disconnected"),
                Err(e) => error!(client = id, error = %e, "client failed"),
            }
        });
        debug!(client = id, "client accepted");
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Answer commands until the client goes away. Returns the command count.
pub fn serve_connection<S: Read + Write + AsFd>(
    conn: &mut Connection<S>,
) -> Result<u64, TransportError> {
    let mut commands = 0u64;
    while let Some(args) = conn.read_command()? {
        commands += 1;
        handle_command(conn, &args)?;
    }
    Ok(commands)
}

fn handle_command<S: Read + Write + AsFd>(
    conn: &mut Connection<S>,
    args: &[Vec<u8>],
) -> Result<(), TransportError> {
    let Some((name, rest)) = args.split_first() else {
        return conn.send_reply(&Reply::Error("ERR empty command".to_string()));
    };

    if name.eq_ignore_ascii_case(SHM_OPEN_COMMAND.as_bytes()) {
        if !conn.accept_upgrade(rest)? {
            warn!("shared memory upgrade refused");
        }
        return Ok(());
    }

    let reply = match (name.to_ascii_uppercase().as_slice(), rest) {
        (b"PING", []) => Reply::Status("PONG".to_string()),
        (b"PING", [message]) | (b"ECHO", [message]) => Reply::Bulk(Some(message.clone())),
        (b"PING", _) | (b"ECHO", _) => Reply::Error(format!(
            "ERR wrong number of arguments for '{}' command",
            String::from_utf8_lossy(name).to_lowercase()
        )),
        (b"TRANSPORT", []) => Reply::Status(
            if conn.is_established() { "shm" } else { "socket" }.to_string(),
        ),
        _ => Reply::Error(format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(name)
        )),
    };
    conn.send_reply(&reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Connection<UnixStream>, Connection<UnixStream>) {
        let (a, b) = UnixStream::pair().unwrap();
        let config = TransportConfig::default();
        (
            Connection::new(a, Role::Client, config).unwrap(),
            Connection::new(b, Role::Server, config).unwrap(),
        )
    }

    fn exchange(
        client: &mut Connection<UnixStream>,
        server: &mut Connection<UnixStream>,
        args: &[&[u8]],
    ) -> Reply {
        client.send_command(args).unwrap();
        let received = server.read_command().unwrap().unwrap();
        handle_command(server, &received).unwrap();
        client.read_reply().unwrap()
    }

    #[test]
    fn test_ping_and_echo() {
        let (mut client, mut server) = pair();
        assert_eq!(
            exchange(&mut client, &mut server, &[b"PING"]),
            Reply::Status("PONG".into())
        );
        assert_eq!(
            exchange(&mut client, &mut server, &[b"ping", b"hi"]),
            Reply::Bulk(Some(b"hi".to_vec()))
        );
        assert_eq!(
            exchange(&mut client, &mut server, &[b"ECHO", b"x"]),
            Reply::Bulk(Some(b"x".to_vec()))
        );
    }

    #[test]
    fn test_errors() {
        let (mut client, mut server) = pair();
        assert!(matches!(
            exchange(&mut client, &mut server, &[b"ECHO"]),
            Reply::Error(e) if e.contains("wrong number")
        ));
        assert!(matches!(
            exchange(&mut client, &mut server, &[b"FLUSHALL"]),
            Reply::Error(e) if e.contains("unknown command")
        ));
    }

    #[test]
    fn test_transport_reports_socket() {
        let (mut client, mut server) = pair();
        assert_eq!(
            exchange(&mut client, &mut server, &[b"TRANSPORT"]),
            Reply::Status("socket".into())
        );
    }
}
