//! Helpers for backends that drive the testbed through a Unix control
//! socket (VM monitors, serial consoles).

use std::{
    io::{ErrorKind, Read},
    os::unix::net::UnixStream,
    path::Path,
    time::Duration,
};

use anyhow::Context;
use tracing::debug;

use crate::{ControlError, ControlResult, Deadline, WAIT_POLL_SLICE};

pub const SOCKET_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to the socket at `path`, retrying until `timeout` elapses.
pub fn connect_unix_socket(path: &Path, timeout: Duration) -> ControlResult<UnixStream> {
    let deadline = Deadline::after(timeout);
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(error) => debug!("connecting to {}: {error}", path.display()),
        }
        match deadline.sleep(WAIT_POLL_SLICE) {
            Err(ControlError::Timeout) => {
                return Err(ControlError::fatal(format!(
                    "Timed out waiting for {} socket",
                    path.display()
                )))
            }
            other => other?,
        }
    }
}

/// Read from `socket` until `needle` shows up, returning everything read.
///
/// An empty `needle` matches the first data received. On expiry the result
/// is a fatal condition naming `description` when one is given, otherwise a
/// bare [`ControlError::Timeout`] for the caller to handle.
pub fn expect(
    socket: &mut UnixStream,
    needle: &[u8],
    timeout: Duration,
    description: Option<&str>,
) -> ControlResult<Vec<u8>> {
    debug!("expect: {:?}", String::from_utf8_lossy(needle));
    let deadline = Deadline::after(timeout);
    let result = read_until_match(socket, needle, deadline);
    match (result, description) {
        (Err(ControlError::Timeout), Some(description)) => Err(ControlError::fatal(format!(
            "timed out waiting for \"{description}\""
        ))),
        (result, _) => result,
    }
}

fn read_until_match(
    socket: &mut UnixStream,
    needle: &[u8],
    deadline: Deadline,
) -> ControlResult<Vec<u8>> {
    socket
        .set_read_timeout(Some(WAIT_POLL_SLICE))
        .context("failed to set socket read timeout")?;
    let mut received = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        deadline.check()?;
        match socket.read(&mut chunk) {
            Ok(0) => deadline.sleep(WAIT_POLL_SLICE)?,
            Ok(read) => received.extend_from_slice(&chunk[..read]),
            Err(error)
                if matches!(
                    error.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(error) => {
                return Err(anyhow::Error::new(error)
                    .context("failed to read from control socket")
                    .into())
            }
        }
        if !received.is_empty() && contains(&received, needle) {
            debug!("expect: found {:?}", String::from_utf8_lossy(needle));
            return Ok(received);
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|window| window == needle)
}
