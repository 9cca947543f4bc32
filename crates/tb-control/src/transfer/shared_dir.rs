//! Transfers through a host-visible mirror of the testbed working directory.

use std::{fs, path::Path};

use anyhow::Context;
use tracing::{debug, warn};

use super::{final_component, join_relative, normalize_path, relative_to};
use crate::{ControlResult, Deadline, Direction, Executor, TransferContext, TransferRequest};

const CP_PRESERVE: &str = "--preserve=mode,timestamps,links";

pub(super) fn copy(
    ctx: &TransferContext<'_>,
    request: &TransferRequest,
    downtmp_host: &str,
    deadline: Deadline,
) -> ControlResult<()> {
    match request.direction {
        Direction::Up => copy_up(
            ctx,
            &request.source,
            &request.destination,
            request.is_dir,
            downtmp_host,
            deadline,
        ),
        Direction::Down => copy_down(
            ctx,
            &request.source,
            &request.destination,
            request.is_dir,
            downtmp_host,
            deadline,
        ),
    }
}

fn copy_up(
    ctx: &TransferContext<'_>,
    tb: &str,
    host: &str,
    is_dir: bool,
    downtmp_host: &str,
    deadline: Deadline,
) -> ControlResult<()> {
    debug!("copyup_shareddir: tb {tb} host {host} is_dir {is_dir} downtmp_host {downtmp_host}");
    let host = normalize_path(host);
    let tb = normalize_path(tb);
    let downtmp_host = normalize_path(downtmp_host);
    let downtmp = normalize_path(ctx.downtmp);

    let mut staged_in_testbed = None;
    let tb_on_host = match relative_to(&tb, &downtmp) {
        Some(rest) => join_relative(&downtmp_host, rest),
        None => {
            let name = final_component(&host, "copyup")?;
            let staged = join_relative(&downtmp, name);
            debug!("copyup_shareddir: tb path {tb} is not already in downtmp, copying to {staged}");
            ctx.executor.run_required(
                &["cp", "-r", CP_PRESERVE, tb.as_str(), staged.as_str()],
                true,
                false,
                deadline,
            )?;
            staged_in_testbed = Some(staged);
            join_relative(&downtmp_host, name)
        }
    };

    if tb_on_host == host {
        staged_in_testbed = None;
    } else {
        debug!("copyup_shareddir: tb(host) {tb_on_host} is not already at destination {host}, copying");
        deadline.check()?;
        if is_dir {
            copy_tree_merge(&tb_on_host, &host, deadline)?;
        } else {
            fs::copy(&tb_on_host, &host)
                .with_context(|| format!("failed to copy {tb_on_host} to {host}"))?;
        }
    }

    if let Some(staged) = staged_in_testbed {
        debug!("copyup_shareddir: rm intermediate copy: {staged}");
        ctx.executor
            .run_required(&["rm", "-rf", staged.as_str()], true, false, deadline)?;
    }
    Ok(())
}

fn copy_down(
    ctx: &TransferContext<'_>,
    host: &str,
    tb: &str,
    is_dir: bool,
    downtmp_host: &str,
    deadline: Deadline,
) -> ControlResult<()> {
    debug!("copydown_shareddir: host {host} tb {tb} is_dir {is_dir} downtmp_host {downtmp_host}");
    let host = normalize_path(host);
    let tb = normalize_path(tb);
    let downtmp_host = normalize_path(downtmp_host);
    let downtmp = normalize_path(ctx.downtmp);

    let mut staged_on_host = None;
    let host_in_tb = match relative_to(&host, &downtmp_host) {
        Some(rest) => join_relative(&downtmp, rest),
        None => {
            let name = final_component(&tb, "copydown")?;
            let staged = join_relative(&downtmp_host, name);
            if is_dir {
                if Path::new(&staged).exists() {
                    if let Err(error) = fs::remove_dir_all(&staged) {
                        warn!("cannot remove old {staged}, moving it instead: {error}");
                        displace(&staged)?;
                    }
                }
                host_executor().run_required(
                    &["cp", "-r", CP_PRESERVE, host.as_str(), staged.as_str()],
                    false,
                    false,
                    deadline,
                )?;
            } else {
                fs::copy(&host, &staged)
                    .with_context(|| format!("failed to copy {host} to {staged}"))?;
            }
            staged_on_host = Some(staged);
            join_relative(&downtmp, name)
        }
    };

    if host_in_tb == tb {
        staged_on_host = None;
    } else {
        deadline.check()?;
        ctx.executor
            .run_required(&["rm", "-rf", tb.as_str()], true, false, deadline)?;
        ctx.executor.run_required(
            &["cp", "-r", CP_PRESERVE, host_in_tb.as_str(), tb.as_str()],
            true,
            false,
            deadline,
        )?;
    }

    if let Some(staged) = staged_on_host {
        let removed = if is_dir {
            fs::remove_dir_all(&staged)
        } else {
            fs::remove_file(&staged)
        };
        removed.with_context(|| format!("failed to remove intermediate copy {staged}"))?;
    }
    Ok(())
}

/// Host-side commands run without the backend's child setup hook.
fn host_executor() -> Executor {
    Executor::default()
}

/// Recursive copy that merges into an existing destination directory.
fn copy_tree_merge(source: &str, destination: &str, deadline: Deadline) -> ControlResult<()> {
    let executor = host_executor();
    if !Path::new(destination).exists() {
        executor.run_required(
            &["cp", "-r", CP_PRESERVE, source, destination],
            false,
            false,
            deadline,
        )?;
        return Ok(());
    }

    let mut entries = fs::read_dir(source)
        .with_context(|| format!("failed to list {source}"))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to list {source}"))?;
    entries.sort();
    for entry in entries {
        let entry = entry.to_string_lossy();
        executor.run_required(
            &[
                "cp",
                "-r",
                CP_PRESERVE,
                "--target-directory",
                destination,
                &*entry,
            ],
            false,
            false,
            deadline,
        )?;
    }
    Ok(())
}

/// Move an undeletable directory to the first free `<path>.old<N>`.
fn displace(path: &str) -> ControlResult<()> {
    let mut counter = 0_u32;
    loop {
        let candidate = format!("{path}.old{counter}");
        if !Path::new(&candidate).exists() {
            fs::rename(path, &candidate)
                .with_context(|| format!("failed to move {path} aside to {candidate}"))?;
            return Ok(());
        }
        counter += 1;
    }
}
