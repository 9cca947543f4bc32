//! Command dispatcher: reads driver lines, runs verbs, writes responses.

use std::{
    fs::File,
    io::{ErrorKind, Read, Write},
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use tracing::{debug, warn};

use crate::{
    kill_and_reap, parse_command_line, signals, transfer, CommandLine, ControlError,
    ControlResult, Deadline, Direction, EngineConfig, Executor, Response, Session, TestbedBackend,
    TransferContext, TransferRequest, Verb, EXIT_FAILURE, EXIT_INTERNAL,
};

const READ_RETRY_DELAY: Duration = Duration::from_millis(100);
const TTY_DEVICE: &str = "/dev/tty";

/// How a served session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Exit the process with this status.
    Exit(i32),
    /// A handled signal arrived; re-raise it after returning.
    Signal(i32),
}

/// Newline-framed reader over the driver stream.
///
/// Reads go straight to the underlying descriptor so an interrupted read
/// surfaces the pending signal instead of being retried silently.
pub struct LineReader<R> {
    inner: R,
    buffer: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    /// Next line, newline included when one was read. End of stream is the
    /// driver going away, which is fatal.
    pub fn read_line(&mut self) -> ControlResult<String> {
        loop {
            if let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let line = self.buffer.drain(..=end).collect::<Vec<_>>();
                return decode_line(line);
            }
            signals::check_pending()?;
            let mut chunk = [0u8; 4096];
            match self.inner.read(&mut chunk) {
                Ok(0) if self.buffer.is_empty() => {
                    return Err(ControlError::fatal("end of file - caller quit?"));
                }
                Ok(0) => return decode_line(std::mem::take(&mut self.buffer)),
                Ok(read) => self.buffer.extend_from_slice(&chunk[..read]),
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) if error.kind() == ErrorKind::WouldBlock => {
                    Deadline::none().sleep(READ_RETRY_DELAY)?;
                }
                Err(error) => {
                    return Err(anyhow::Error::new(error)
                        .context("failed to read command from driver")
                        .into())
                }
            }
        }
    }
}

fn decode_line(line: Vec<u8>) -> ControlResult<String> {
    String::from_utf8(line).map_err(|_| ControlError::protocol("command line is not valid UTF-8"))
}

/// The protocol engine bound to one backend.
pub struct Engine<B> {
    session: Session,
    backend: B,
    config: EngineConfig,
}

impl<B: TestbedBackend> Engine<B> {
    pub fn new(backend: B, config: EngineConfig) -> Self {
        Self {
            session: Session::new(),
            backend,
            config,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one command line and build its response.
    ///
    /// Protocol errors and failed commands become response lines; anything
    /// that must end the session is returned as an error.
    pub fn handle_line(&mut self, line: &str) -> ControlResult<Response> {
        let outcome = parse_command_line(line).and_then(|command| {
            debug!("command: {:?}", command.args);
            self.execute(&command)
        });
        match outcome {
            Ok(results) => Ok(Response::Ok(results)),
            Err(ControlError::Protocol(message)) => {
                debug!("protocol error: {message}");
                Ok(Response::ProtocolError(message))
            }
            Err(ControlError::FailedCommand {
                marker,
                diagnostics,
            }) => {
                debug!("command failed: {marker} {diagnostics:?}");
                Ok(Response::Failed {
                    marker,
                    diagnostics,
                })
            }
            Err(error) => Err(error),
        }
    }

    fn execute(&mut self, command: &CommandLine) -> ControlResult<Vec<String>> {
        match command.verb {
            Verb::Capabilities => Ok(self
                .session
                .capabilities(&mut self.backend)?
                .as_slice()
                .to_vec()),
            Verb::Open => Ok(vec![self.session.open(&mut self.backend)?]),
            Verb::Close => {
                self.session.close(&mut self.backend)?;
                Ok(Vec::new())
            }
            Verb::Revert => Ok(vec![self.session.revert(&mut self.backend)?]),
            Verb::Reboot => {
                self.session
                    .reboot(&mut self.backend, self.config.copy_timeout_secs)?;
                Ok(Vec::new())
            }
            Verb::PrintExecuteCommand => {
                self.session.require_open(command.verb.as_str())?;
                let encoded = self
                    .session
                    .auxverb()
                    .iter()
                    .map(|arg| crate::encode_token(arg))
                    .collect::<Vec<_>>();
                Ok(vec![encoded.join(",")])
            }
            Verb::Copydown => self.copy(Direction::Down, command),
            Verb::Copyup => self.copy(Direction::Up, command),
            Verb::Shell => {
                self.shell(command)?;
                Ok(Vec::new())
            }
            Verb::Quit => Err(ControlError::quit()),
        }
    }

    fn copy(&mut self, direction: Direction, command: &CommandLine) -> ControlResult<Vec<String>> {
        let downtmp = self.session.require_open(direction.verb())?.to_string();
        let operands = command.operands();
        let request = TransferRequest::new(direction, &operands[0], &operands[1])?;
        let capabilities = self.session.capabilities(&mut self.backend)?.clone();
        let executor = self.session.executor(&self.backend);
        let ctx = TransferContext {
            downtmp: &downtmp,
            executor: &executor,
            copy_timeout_secs: self.config.copy_timeout_secs,
        };
        transfer(&ctx, &capabilities, &request)?;
        Ok(Vec::new())
    }

    fn shell(&mut self, command: &CommandLine) -> ControlResult<()> {
        self.session.require_open(command.verb.as_str())?;
        let (dir, env) = command
            .operands()
            .split_first()
            .ok_or_else(|| ControlError::protocol("too few arguments to command `shell'"))?;
        let executor = self.session.executor(&self.backend);
        match self.backend.shell_hook() {
            Some(hook) => hook.shell(&executor, dir, env),
            None => default_shell(&executor, dir, env),
        }
    }

    /// Serve the protocol until `quit`, a fatal condition or a signal.
    ///
    /// Writes the ready handshake first. Whatever ends the loop, the testbed
    /// is torn down before returning; diagnostics go to `errors`.
    pub fn serve<R: Read, W: Write>(
        &mut self,
        input: R,
        mut output: W,
        errors: &mut dyn Write,
    ) -> ServeOutcome {
        let mut reader = LineReader::new(input);
        let error = match self.command_loop(&mut reader, &mut output) {
            Ok(()) => ControlError::quit(),
            Err(error) => error,
        };
        self.finish(error, errors)
    }

    fn command_loop<R: Read>(
        &mut self,
        reader: &mut LineReader<R>,
        output: &mut dyn Write,
    ) -> ControlResult<()> {
        write_response(output, &Response::Ok(Vec::new()))?;
        loop {
            let line = reader.read_line()?;
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line)?;
            write_response(output, &response)?;
        }
    }

    fn finish(&mut self, error: ControlError, errors: &mut dyn Write) -> ServeOutcome {
        // A signal wins over whatever error it caused, e.g. EPIPE on write.
        let signal = signals::take_pending_signal().or(match error {
            ControlError::Interrupted { signal } => Some(signal),
            _ => None,
        });
        if let Some(signal) = signal {
            debug!("handled signal {signal}, tearing down");
            signals::teardown_after_error(&mut self.session, &mut self.backend, errors);
            return ServeOutcome::Signal(signal);
        }

        signals::teardown_after_error(&mut self.session, &mut self.backend, errors);
        match error {
            ControlError::Quit { code, message } => {
                if !message.is_empty() {
                    let _ = writeln!(errors, "{message}");
                }
                ServeOutcome::Exit(code)
            }
            ControlError::Internal(error) => {
                let _ = writeln!(errors, "Unexpected error:\n{error:?}");
                ServeOutcome::Exit(EXIT_INTERNAL)
            }
            other => {
                let _ = writeln!(errors, "failure: {other}");
                ServeOutcome::Exit(EXIT_FAILURE)
            }
        }
    }
}

fn write_response(output: &mut dyn Write, response: &Response) -> ControlResult<()> {
    writeln!(output, "{}", response.to_line())
        .and_then(|()| output.flush())
        .context("failed to write response to driver")?;
    Ok(())
}

/// Interactive shell on the controlling terminal, inside the testbed.
fn default_shell(executor: &Executor, dir: &str, env: &[String]) -> ControlResult<()> {
    let mut script = format!("cd \"{dir}\"; ");
    for assignment in env {
        script.push_str(&format!("export \"{assignment}\"; "));
    }
    script.push_str("bash -i");
    let tty = match File::options().read(true).write(true).open(TTY_DEVICE) {
        Ok(tty) => tty,
        Err(error) => {
            warn!("cannot run shell in testbed: error opening console device: {error}");
            return Ok(());
        }
    };
    let argv = executor.testbed_argv(&["sh", "-c", script.as_str()]);
    let mut command = executor.command(&argv)?;
    command
        .stdin(Stdio::from(tty.try_clone().context("failed to duplicate tty")?))
        .stdout(Stdio::from(tty.try_clone().context("failed to duplicate tty")?))
        .stderr(Stdio::from(tty));
    let mut child = command.spawn().context("failed to start shell")?;
    match Deadline::none().wait_child(&mut child) {
        Ok(status) => {
            debug!("shell exited with {status}");
            Ok(())
        }
        Err(error) => {
            kill_and_reap(&mut child);
            Err(error)
        }
    }
}
