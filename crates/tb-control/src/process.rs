//! Child process execution under a deadline.

use std::{
    fmt,
    io::{ErrorKind, Read, Write},
    os::unix::process::{CommandExt, ExitStatusExt},
    process::{Command, ExitStatus, Stdio},
    sync::mpsc::{self, Sender},
    thread,
};

use anyhow::{anyhow, Context};
use tracing::debug;

use crate::{kill_and_reap, signals, ChildSetup, ControlError, ControlResult, Deadline};

/// Spawns host and in-testbed commands with the backend's child setup hook.
#[derive(Clone, Default)]
pub struct Executor {
    auxverb: Vec<String>,
    child_setup: Option<ChildSetup>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("auxverb", &self.auxverb)
            .field("child_setup", &self.child_setup.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct ExecOutput {
    pub status: ExitStatus,
    pub stdout: Option<String>,
    pub stderr: String,
}

impl Executor {
    pub fn new(auxverb: Vec<String>, child_setup: Option<ChildSetup>) -> Self {
        Self {
            auxverb,
            child_setup,
        }
    }

    pub fn auxverb(&self) -> &[String] {
        &self.auxverb
    }

    /// `argv` prefixed with the in-testbed command prefix.
    pub fn testbed_argv<S: AsRef<str>>(&self, argv: &[S]) -> Vec<String> {
        self.auxverb
            .iter()
            .cloned()
            .chain(argv.iter().map(|arg| arg.as_ref().to_string()))
            .collect()
    }

    /// Build a `Command` for `argv` with the child setup hook attached.
    pub fn command(&self, argv: &[String]) -> ControlResult<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("cannot execute an empty command line"))?;
        let mut command = Command::new(program);
        command.args(args);
        if let Some(setup) = self.child_setup.clone() {
            // SAFETY: `ChildSetup` is required to be async-signal-safe.
            unsafe {
                command.pre_exec(move || setup());
            }
        }
        Ok(command)
    }

    /// Spawn `argv`, feed it `stdin_data` (or `/dev/null`), and wait under
    /// `deadline`. stderr is always captured, stdout only on request; an
    /// uncaptured stdout is discarded so it cannot leak onto the protocol
    /// stream. On expiry the child is killed and reaped before returning.
    pub fn spawn_and_wait(
        &self,
        argv: &[String],
        stdin_data: Option<&str>,
        deadline: Deadline,
        capture_stdout: bool,
    ) -> ControlResult<ExecOutput> {
        debug!("execute-timeout: {}", argv.join(" "));
        let mut command = self.command(argv)?;
        command
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", argv[0]))?;

        if let (Some(data), Some(mut stdin)) = (stdin_data, child.stdin.take()) {
            let data = data.to_string();
            thread::spawn(move || {
                signals::block_sigpipe_in_current_thread();
                if let Err(error) = stdin.write_all(data.as_bytes()) {
                    if error.kind() != ErrorKind::BrokenPipe {
                        debug!("failed to feed child stdin: {error}");
                    }
                }
            });
        }
        let (sender, receiver) = mpsc::channel();
        let mut readers = 0;
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(OutputStream::Stdout, stdout, sender.clone());
            readers += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(OutputStream::Stderr, stderr, sender.clone());
            readers += 1;
        }
        drop(sender);

        let status = match deadline.wait_child(&mut child) {
            Ok(status) => status,
            Err(error) => {
                kill_and_reap(&mut child);
                return Err(error);
            }
        };

        // A descendant that inherited the pipes can hold them open after the
        // child exits; the deadline covers draining them too.
        let mut stdout = None;
        let mut stderr = String::new();
        for _ in 0..readers {
            let (stream, read) = deadline.recv(&receiver).map_err(|error| {
                if error.is_timeout() {
                    debug!("{}: output still open after exit, giving up", argv[0]);
                }
                error
            })?;
            let text = String::from_utf8_lossy(&read.context("failed to read child output")?)
                .into_owned();
            match stream {
                OutputStream::Stdout => stdout = Some(text),
                OutputStream::Stderr => stderr = text,
            }
        }
        Ok(ExecOutput {
            status,
            stdout,
            stderr,
        })
    }

    /// Run a plumbing command that must succeed silently.
    ///
    /// Fails fatally on a nonzero exit or on any stderr output. Returns the
    /// captured stdout with one trailing newline removed when
    /// `capture_stdout` is set.
    pub fn run_required<S: AsRef<str>>(
        &self,
        argv: &[S],
        in_testbed: bool,
        capture_stdout: bool,
        deadline: Deadline,
    ) -> ControlResult<Option<String>> {
        let real_argv = if in_testbed {
            self.testbed_argv(argv)
        } else {
            argv.iter().map(|arg| arg.as_ref().to_string()).collect()
        };
        let output = self.spawn_and_wait(&real_argv, None, deadline, capture_stdout)?;
        let shown = argv.iter().map(AsRef::as_ref).collect::<Vec<&str>>();
        if !output.status.success() {
            return Err(ControlError::fatal(format!(
                "{}{:?} failed (exit status {})",
                if in_testbed { "(down) " } else { "" },
                shown,
                exit_status_code(output.status)
            )));
        }
        if !output.stderr.is_empty() {
            return Err(ControlError::fatal(format!(
                "{:?} unexpectedly produced stderr output `{}'",
                shown, output.stderr
            )));
        }
        Ok(output.stdout.map(|mut stdout| {
            if stdout.ends_with('\n') {
                stdout.pop();
            }
            stdout
        }))
    }
}

/// Exit code, or the negated signal number for a signal-terminated child.
pub fn exit_status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

type ReaderMessage = (OutputStream, std::io::Result<Vec<u8>>);

fn spawn_reader<R: Read + Send + 'static>(
    stream: OutputStream,
    mut source: R,
    sender: Sender<ReaderMessage>,
) {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let read = source.read_to_end(&mut buffer).map(|_| buffer);
        let _ = sender.send((stream, read));
    });
}
