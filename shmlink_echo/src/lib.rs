//! # shmlink Echo Peer
//!
//! Server end of the shared memory handshake. Listens on a Unix socket,
//! accepts `SHM.OPEN` upgrades and answers a handful of commands over
//! whichever transport the connection currently uses.
//!
//! # Module Structure
//!
//! - [`config`] - `echo.toml` layout
//! - [`server`] - accept loop and per-connection command handling
//!
//! # Commands
//!
//! | Command                          | Reply                     |
//! |----------------------------------|---------------------------|
//! | `PING [message]`                 | `+PONG` or bulk `message` |
//! | `ECHO message`                   | bulk `message`            |
//! | `SHM.OPEN <version> <name>`      | `:1` or an error          |
//! | `TRANSPORT`                      | `+socket` / `+shm`        |
//! | anything else                    | `-ERR unknown command`    |

#![deny(missing_docs)]

pub mod config;
pub mod server;

pub use config::EchoConfig;
pub use server::{EchoError, EchoServer, serve_connection};
