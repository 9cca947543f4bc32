//! Transfers streamed through a pipe between an in-testbed and a host process.

use std::{
    fs::{self, File},
    io::ErrorKind,
    os::unix::{fs::PermissionsExt, process::ExitStatusExt},
    process::{Child, Stdio},
};

use anyhow::{anyhow, Context};
use tracing::debug;

use crate::{
    exit_status_code, kill_and_reap, ControlError, ControlResult, Deadline, Direction,
    TransferContext, TransferRequest,
};

const TAR_CREATE: &str = "-c .";
const TAR_EXTRACT: &str = "--preserve-permissions --extract --no-same-owner";

/// Both halves of a piped copy, oriented so data flows source to destination.
struct PipedPlan {
    source_argv: Vec<String>,
    destination_argv: Vec<String>,
    source_stdin: Stdio,
    destination_stdout: Stdio,
}

pub(super) fn copy(
    ctx: &TransferContext<'_>,
    request: &TransferRequest,
    deadline: Deadline,
) -> ControlResult<()> {
    let plan = plan(ctx, request)?;
    let verb = request.direction.verb();

    debug!(" +< {}", plan.source_argv.join(" "));
    let mut source = {
        let mut command = ctx.executor.command(&plan.source_argv)?;
        command.stdin(plan.source_stdin).stdout(Stdio::piped());
        command
            .spawn()
            .with_context(|| format!("{verb}: failed to spawn source {}", plan.source_argv[0]))?
    };
    let Some(pipe) = source.stdout.take() else {
        kill_and_reap(&mut source);
        return Err(anyhow!("{verb}: source process has no stdout pipe").into());
    };

    debug!(" +> {}", plan.destination_argv.join(" "));
    // The command (and with it the parent's copy of the pipe) is dropped
    // right after spawning, so the destination sees EOF when the source ends.
    let spawned = ctx.executor.command(&plan.destination_argv).and_then(|mut command| {
        command
            .stdin(Stdio::from(pipe))
            .stdout(plan.destination_stdout);
        command
            .spawn()
            .with_context(|| {
                format!(
                    "{verb}: failed to spawn destination {}",
                    plan.destination_argv[0]
                )
            })
            .map_err(ControlError::from)
    });
    let mut destination = match spawned {
        Ok(child) => child,
        Err(error) => {
            kill_and_reap(&mut source);
            return Err(error);
        }
    };

    if let Err(error) = wait_pair(&mut source, &mut destination, verb, deadline) {
        kill_and_reap(&mut destination);
        kill_and_reap(&mut source);
        return Err(error);
    }
    if request.direction == Direction::Up && !request.is_dir {
        copy_mode_up(ctx, request, deadline)?;
    }
    Ok(())
}

/// Give the host copy of a single file the permission bits it has in the
/// testbed.
fn copy_mode_up(
    ctx: &TransferContext<'_>,
    request: &TransferRequest,
    deadline: Deadline,
) -> ControlResult<()> {
    let tb = request.testbed_path();
    let reported = ctx
        .executor
        .run_required(&["stat", "--format=%a", "--", tb], true, true, deadline)?
        .unwrap_or_default();
    let mode = u32::from_str_radix(reported.trim(), 8).map_err(|_| {
        ControlError::fatal(format!("copyup: unexpected mode `{reported}' for {tb}"))
    })?;
    fs::set_permissions(request.host_path(), fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set mode of {}", request.host_path()))?;
    Ok(())
}

fn plan(ctx: &TransferContext<'_>, request: &TransferRequest) -> ControlResult<PipedPlan> {
    let verb = request.direction.verb();
    let remote = shell_words::quote(request.testbed_path()).into_owned();
    let local = request.host_path();
    let mut source_stdin = Stdio::null();
    let mut destination_stdout = Stdio::null();

    let (script, local_argv) = if !request.is_dir {
        let mut script = match request.direction {
            Direction::Up => format!("cat <{remote}"),
            Direction::Down => format!("cat >{remote}"),
        };
        match request.direction {
            Direction::Up => {
                let file = File::create(local).map_err(|error| {
                    ControlError::fatal(format!("{verb}: cannot create {local}: {error}"))
                })?;
                destination_stdout = Stdio::from(file);
            }
            Direction::Down => {
                let file = File::open(local).map_err(|error| {
                    ControlError::fatal(format!("{verb}: cannot open {local}: {error}"))
                })?;
                let mode = file
                    .metadata()
                    .with_context(|| format!("failed to stat {local}"))?
                    .permissions()
                    .mode();
                if mode & 0o111 != 0 {
                    script.push_str(&format!("; chmod +x -- {remote}"));
                }
                source_stdin = Stdio::from(file);
            }
        }
        (script, vec!["cat".to_string()])
    } else {
        let (remote_tar, local_tar) = match request.direction {
            Direction::Up => (TAR_CREATE, TAR_EXTRACT),
            Direction::Down => (TAR_EXTRACT, TAR_CREATE),
        };
        let mut script = format!("cd {remote}; tar {remote_tar} -f -");
        match request.direction {
            Direction::Up => match fs::create_dir(local) {
                Ok(()) => {}
                Err(error) if error.kind() == ErrorKind::AlreadyExists => {}
                Err(error) => {
                    return Err(ControlError::fatal(format!(
                        "{verb}: cannot create directory {local}: {error}"
                    )))
                }
            },
            Direction::Down => {
                script = format!("if ! test -d {remote}; then mkdir -- {remote}; fi; {script}");
            }
        }
        let mut local_argv = vec![
            "tar".to_string(),
            "--directory".to_string(),
            local.to_string(),
        ];
        local_argv.extend(local_tar.split_whitespace().map(str::to_string));
        local_argv.extend(["-f".to_string(), "-".to_string()]);
        (script, local_argv)
    };

    let remote_argv = ctx.executor.testbed_argv(&["sh", "-ec", script.as_str()]);
    let (source_argv, destination_argv) = match request.direction {
        Direction::Up => (remote_argv, local_argv),
        Direction::Down => (local_argv, remote_argv),
    };
    Ok(PipedPlan {
        source_argv,
        destination_argv,
        source_stdin,
        destination_stdout,
    })
}

/// Wait destination first, then source. The source may be killed by
/// `SIGPIPE` when the destination stops reading early; that is the only
/// non-success status tolerated.
fn wait_pair(
    source: &mut Child,
    destination: &mut Child,
    verb: &str,
    deadline: Deadline,
) -> ControlResult<()> {
    debug!(" +>?");
    let status = deadline.wait_child(destination)?;
    if !status.success() {
        return Err(ControlError::fatal(format!(
            "{verb} destination failed, status {}",
            exit_status_code(status)
        )));
    }
    debug!(" +<?");
    let status = deadline.wait_child(source)?;
    if !(status.success() || status.signal() == Some(libc::SIGPIPE)) {
        return Err(ControlError::fatal(format!(
            "{verb} source failed, status {}",
            exit_status_code(status)
        )));
    }
    Ok(())
}
