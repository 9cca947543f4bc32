//! Copying files and directory trees between host and testbed.
//!
//! `copyup` moves data from the testbed to the host, `copydown` from the
//! host into the testbed. A trailing `/` on both paths selects a directory
//! transfer. When the backend advertises a host-side mirror of the testbed
//! working directory the shared-directory strategy is used, otherwise data
//! is streamed through a pipe between an in-testbed and a host process.

mod piped;
mod shared_dir;

use std::path::{Component, Path};

use tracing::debug;

use crate::{run_with_deadline, Capabilities, ControlError, ControlResult, Executor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Testbed to host.
    Up,
    /// Host to testbed.
    Down,
}

impl Direction {
    pub fn verb(&self) -> &'static str {
        match self {
            Self::Up => "copyup",
            Self::Down => "copydown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub direction: Direction,
    pub source: String,
    pub destination: String,
    pub is_dir: bool,
}

impl TransferRequest {
    /// Validate a copy request before anything is spawned.
    pub fn new(
        direction: Direction,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> ControlResult<Self> {
        let source = source.into();
        let destination = destination.into();
        let verb = direction.verb();
        if source.is_empty() || destination.is_empty() {
            return Err(ControlError::protocol(format!(
                "{verb} paths must be nonempty"
            )));
        }
        let is_dir = source.ends_with('/');
        if is_dir != destination.ends_with('/') {
            return Err(ControlError::protocol(format!(
                "{verb} paths must agree about directoryness (presence or absence of trailing /)"
            )));
        }
        Ok(Self {
            direction,
            source,
            destination,
            is_dir,
        })
    }

    pub fn testbed_path(&self) -> &str {
        match self.direction {
            Direction::Up => &self.source,
            Direction::Down => &self.destination,
        }
    }

    pub fn host_path(&self) -> &str {
        match self.direction {
            Direction::Up => &self.destination,
            Direction::Down => &self.source,
        }
    }
}

/// What a transfer needs from the open session.
#[derive(Debug, Clone, Copy)]
pub struct TransferContext<'a> {
    pub downtmp: &'a str,
    pub executor: &'a Executor,
    pub copy_timeout_secs: u64,
}

/// Carry out `request` under the copy deadline.
///
/// Expiry is reported as a `timeout` failed command so the driver can decide
/// how to go on; every child process has been killed and reaped by then.
pub fn transfer(
    ctx: &TransferContext<'_>,
    capabilities: &Capabilities,
    request: &TransferRequest,
) -> ControlResult<()> {
    let result = run_with_deadline(ctx.copy_timeout_secs, |deadline| {
        match capabilities.downtmp_host() {
            Some(downtmp_host) => {
                debug!(
                    "{}: shared directory strategy via {downtmp_host}",
                    request.direction.verb()
                );
                shared_dir::copy(ctx, request, downtmp_host, deadline)
            }
            None => {
                debug!("{}: piped strategy", request.direction.verb());
                piped::copy(ctx, request, deadline)
            }
        }
    });
    result.map_err(|error| {
        if error.is_timeout() {
            ControlError::timed_out_command()
        } else {
            error
        }
    })
}

/// Lexical path normalization: collapses separators, `.` and `..` without
/// touching the filesystem.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => match parts.last() {
                Some(last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push("..".to_string()),
            },
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Path of `path` below `base`, if it lies inside it (`""` for `base` itself).
fn relative_to<'a>(path: &'a str, base: &str) -> Option<&'a str> {
    Path::new(path)
        .strip_prefix(base)
        .ok()
        .and_then(Path::to_str)
}

fn join_relative(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        base.to_string()
    } else {
        Path::new(base).join(relative).to_string_lossy().into_owned()
    }
}

fn final_component<'a>(path: &'a str, verb: &str) -> ControlResult<&'a str> {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ControlError::protocol(format!("{verb} path {path} has no final component")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_transfer_request_derives_directory_flag() {
        let request = TransferRequest::new(Direction::Down, "/src/tree/", "/dst/tree/")
            .expect("valid request");
        assert!(request.is_dir);
        assert_eq!(request.host_path(), "/src/tree/");
        assert_eq!(request.testbed_path(), "/dst/tree/");

        let file = TransferRequest::new(Direction::Up, "/tb/file", "/host/file").expect("valid");
        assert!(!file.is_dir);
        assert_eq!(file.testbed_path(), "/tb/file");
        assert_eq!(file.host_path(), "/host/file");
    }

    #[test]
    fn regression_transfer_request_rejects_mismatched_directoryness() {
        let error = TransferRequest::new(Direction::Up, "/tb/dir/", "/host/dir")
            .expect_err("mismatch rejected");
        assert!(matches!(error, ControlError::Protocol(ref message) if message.contains("directoryness")));
    }

    #[test]
    fn regression_transfer_request_rejects_empty_paths() {
        let error = TransferRequest::new(Direction::Down, "", "/tb/x").expect_err("empty");
        assert!(matches!(error, ControlError::Protocol(ref message) if message == "copydown paths must be nonempty"));
    }

    #[test]
    fn unit_normalize_path_matches_lexical_semantics() {
        assert_eq!(normalize_path("/tmp//a/./b/"), "/tmp/a/b");
        assert_eq!(normalize_path("/tmp/a/../b"), "/tmp/b");
        assert_eq!(normalize_path("/.."), "/");
        assert_eq!(normalize_path("a/.."), ".");
        assert_eq!(normalize_path("../x"), "../x");
        assert_eq!(normalize_path(""), ".");
    }

    #[test]
    fn unit_relative_to_respects_component_boundaries() {
        assert_eq!(relative_to("/tmp/tb.1/out", "/tmp/tb.1"), Some("out"));
        assert_eq!(relative_to("/tmp/tb.1", "/tmp/tb.1"), Some(""));
        assert_eq!(relative_to("/tmp/tb.12/out", "/tmp/tb.1"), None);
    }

    #[test]
    fn unit_final_component_rejects_root() {
        assert_eq!(final_component("/a/b", "copyup").expect("name"), "b");
        assert!(final_component("/", "copyup").is_err());
    }
}
