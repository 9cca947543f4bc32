use std::collections::VecDeque;

use crate::{ControlError, ControlResult, Executor, ShellHook, TestbedBackend};

/// One recorded backend hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HookCall {
    Capabilities,
    Open,
    Downtmp(Option<String>),
    Revert,
    Reboot,
    Cleanup(String),
}

#[derive(Debug, Default)]
pub(crate) struct RecordingShell {
    pub(crate) invocations: Vec<(String, Vec<String>)>,
}

impl ShellHook for RecordingShell {
    fn shell(&mut self, _executor: &Executor, dir: &str, env: &[String]) -> ControlResult<()> {
        self.invocations.push((dir.to_string(), env.to_vec()));
        Ok(())
    }
}

/// Backend whose answers are fixed up front and whose hook calls are logged.
#[derive(Debug, Default)]
pub(crate) struct ScriptedBackend {
    capabilities: Vec<String>,
    auxverb: Vec<String>,
    default_downtmp: String,
    scripted_downtmp: VecDeque<String>,
    cleanup_failure: Option<String>,
    pub(crate) shell: Option<RecordingShell>,
    pub(crate) calls: Vec<HookCall>,
}

impl ScriptedBackend {
    pub(crate) fn new(downtmp: impl Into<String>) -> Self {
        Self {
            default_downtmp: downtmp.into(),
            ..Self::default()
        }
    }

    pub(crate) fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|cap| cap.to_string()).collect();
        self
    }

    pub(crate) fn with_auxverb(mut self, auxverb: &[&str]) -> Self {
        self.auxverb = auxverb.iter().map(|arg| arg.to_string()).collect();
        self
    }

    /// Queue the answer for the next `downtmp` hook call.
    pub(crate) fn then_downtmp(mut self, path: impl Into<String>) -> Self {
        self.scripted_downtmp.push_back(path.into());
        self
    }

    pub(crate) fn failing_cleanup(mut self, message: impl Into<String>) -> Self {
        self.cleanup_failure = Some(message.into());
        self
    }

    pub(crate) fn with_shell_hook(mut self) -> Self {
        self.shell = Some(RecordingShell::default());
        self
    }
}

impl TestbedBackend for ScriptedBackend {
    fn capabilities(&mut self) -> ControlResult<Vec<String>> {
        self.calls.push(HookCall::Capabilities);
        Ok(self.capabilities.clone())
    }

    fn open(&mut self) -> ControlResult<Vec<String>> {
        self.calls.push(HookCall::Open);
        Ok(self.auxverb.clone())
    }

    fn downtmp(&mut self, _executor: &Executor, previous: Option<&str>) -> ControlResult<String> {
        self.calls
            .push(HookCall::Downtmp(previous.map(str::to_string)));
        Ok(self
            .scripted_downtmp
            .pop_front()
            .unwrap_or_else(|| self.default_downtmp.clone()))
    }

    fn revert(&mut self) -> ControlResult<Vec<String>> {
        self.calls.push(HookCall::Revert);
        Ok(self.auxverb.clone())
    }

    fn reboot(&mut self, _executor: &Executor) -> ControlResult<()> {
        self.calls.push(HookCall::Reboot);
        Ok(())
    }

    fn cleanup(&mut self, _executor: &Executor, downtmp: &str) -> ControlResult<()> {
        self.calls.push(HookCall::Cleanup(downtmp.to_string()));
        match &self.cleanup_failure {
            Some(message) => Err(ControlError::fatal(message)),
            None => Ok(()),
        }
    }

    fn shell_hook(&mut self) -> Option<&mut dyn ShellHook> {
        self.shell
            .as_mut()
            .map(|shell| shell as &mut dyn ShellHook)
    }
}
