//! Multi-process tests.
//!
//! Uses `fork()` so the two ends of the segment live in different address
//! spaces, and so the peer can die without running any destructor.

use shmlink::config::TransportConfig;
use shmlink::consts::{SHM_BUFFER_SIZE, SHM_OPEN_COMMAND};
use shmlink_transport::{Connection, Reply, Role, TransportMode, UpgradeOutcome};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;

fn config() -> TransportConfig {
    TransportConfig {
        liveness_interval: 1_000,
        ..TransportConfig::default()
    }
}

/// Child side: accept the upgrade, answer one PING, then die abruptly.
fn run_child_server(stream: UnixStream) -> i32 {
    let Ok(mut conn) = Connection::new(stream, Role::Server, config()) else {
        return 1;
    };
    let Ok(Some(open)) = conn.read_command() else {
        return 2;
    };
    if open[0] != SHM_OPEN_COMMAND.as_bytes() || !matches!(conn.accept_upgrade(&open[1..]), Ok(true)) {
        return 3;
    }
    let Ok(Some(ping)) = conn.read_command() else {
        return 4;
    };
    if ping[0] != b"PING" || conn.send_reply(&Reply::Status("PONG".into())).is_err() {
        return 5;
    }
    0
}

fn wait_child(pid: libc::pid_t) -> i32 {
    let mut status: libc::c_int = 0;
    unsafe {
        libc::waitpid(pid, &mut status, 0);
    }
    assert!(libc::WIFEXITED(status), "child did not exit normally");
    libc::WEXITSTATUS(status)
}

/// Test: peer process exits without teardown.
///
/// 1. Child accepts the upgrade and answers PING over shared memory.
/// 2. Child leaves through `_exit`, skipping every destructor.
/// 3. Parent sees BrokenPipe on write and end of stream on read.
#[test]
fn abrupt_peer_exit_is_detected() {
    let (client_end, server_end) = UnixStream::pair().unwrap();

    // Safety: fork() is unsafe but this is a controlled test environment.
    let pid = unsafe { libc::fork() };

    if pid == 0 {
        // ── CHILD PROCESS (server) ──
        drop(client_end);
        let code = run_child_server(server_end);
        unsafe { libc::_exit(code) };
    }

    // ── PARENT PROCESS (client) ──
    assert!(pid > 0, "fork failed");
    drop(server_end);

    let mut conn = Connection::new(client_end, Role::Client, config()).unwrap();
    assert_eq!(
        conn.upgrade(0o600).unwrap(),
        UpgradeOutcome::Established(Reply::Integer(1))
    );
    conn.send_command(&[b"PING"]).unwrap();
    assert_eq!(conn.read_reply().unwrap(), Reply::Status("PONG".into()));

    assert_eq!(wait_child(pid), 0);

    // Iteration 0 never probes: a write that fits still lands.
    let filler = vec![0x5Au8; SHM_BUFFER_SIZE];
    assert_eq!(conn.write(&filler).unwrap(), SHM_BUFFER_SIZE);

    let err = conn.write(b"PING").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokenPipe);

    let mut buf = [0u8; 64];
    assert_eq!(conn.read(&mut buf).unwrap(), 0);
    assert_eq!(conn.mode(), TransportMode::SharedMemory);

    conn.teardown();
    conn.teardown();
    assert_eq!(conn.mode(), TransportMode::SocketOnly);
}

/// Test: segment data crosses the process boundary in both directions.
#[test]
fn cross_process_echo() {
    const TOTAL: usize = 50_000;
    let (client_end, server_end) = UnixStream::pair().unwrap();

    // Safety: fork() is unsafe but this is a controlled test environment.
    let pid = unsafe { libc::fork() };

    if pid == 0 {
        // ── CHILD PROCESS (raw echo server) ──
        drop(client_end);
        let code = (|| {
            let mut conn = Connection::new(server_end, Role::Server, config()).ok()?;
            let open = conn.read_command().ok()??;
            conn.accept_upgrade(&open[1..]).ok()?.then_some(())?;
            let mut chunk = [0u8; 1000];
            loop {
                let n = conn.read(&mut chunk).ok()?;
                if n == 0 {
                    return Some(0);
                }
                conn.write_all(&chunk[..n]).ok()?;
            }
        })()
        .unwrap_or(1);
        unsafe { libc::_exit(code) };
    }

    assert!(pid > 0, "fork failed");
    drop(server_end);

    let mut conn = Connection::new(client_end, Role::Client, config()).unwrap();
    conn.upgrade(0o600).unwrap();

    let data: Vec<u8> = (0..TOTAL).map(|i| (i * 7 % 256) as u8).collect();
    let mut echoed = Vec::with_capacity(TOTAL);
    let mut buf = [0u8; 4096];
    for chunk in data.chunks(3000) {
        conn.write_all(chunk).unwrap();
        let mut pending = chunk.len();
        while pending > 0 {
            let n = conn.read(&mut buf).unwrap();
            assert!(n > 0);
            echoed.extend_from_slice(&buf[..n]);
            pending -= n;
        }
    }
    assert_eq!(echoed, data);

    // Closing our end lets the child see end of stream.
    drop(conn);
    assert_eq!(wait_child(pid), 0);
}
