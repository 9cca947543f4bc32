//! Hook contract implemented by each isolation technology.

use std::sync::Arc;

use crate::{ControlError, ControlResult, Executor};

/// Runs in every spawned child between fork and exec. Must restrict itself
/// to async-signal-safe calls (`setsid`, `setpgid`, `prctl`, ...).
pub type ChildSetup = Arc<dyn Fn() -> std::io::Result<()> + Send + Sync>;

/// Concrete actions behind the protocol verbs.
///
/// The engine calls these in a fixed order and owns all session state; the
/// backend only reports what it did. Hooks that get an [`Executor`] receive
/// one bound to the current in-testbed command prefix.
pub trait TestbedBackend {
    /// Advertised capability strings. Queried once per session.
    fn capabilities(&mut self) -> ControlResult<Vec<String>>;

    /// Prepare the testbed and return the command prefix ("auxverb") that
    /// runs a program inside it.
    fn open(&mut self) -> ControlResult<Vec<String>>;

    /// Resolve the testbed working directory. `previous` is the path chosen
    /// on the first open; a backend must recreate exactly that path.
    fn downtmp(&mut self, executor: &Executor, previous: Option<&str>) -> ControlResult<String>;

    /// Reset the testbed to its pristine snapshot and return the possibly
    /// changed command prefix. Only called when `revert` is advertised.
    fn revert(&mut self) -> ControlResult<Vec<String>> {
        Err(ControlError::fatal(
            "backend advertises `revert' without implementing it",
        ))
    }

    /// Reboot the testbed. Only called when `reboot` is advertised.
    fn reboot(&mut self, _executor: &Executor) -> ControlResult<()> {
        Err(ControlError::fatal(
            "backend advertises `reboot' without implementing it",
        ))
    }

    /// Release the testbed. Only called while a working directory is recorded.
    fn cleanup(&mut self, executor: &Executor, downtmp: &str) -> ControlResult<()>;

    fn child_setup(&self) -> Option<ChildSetup> {
        None
    }

    /// Optional replacement for the default interactive shell.
    fn shell_hook(&mut self) -> Option<&mut dyn ShellHook> {
        None
    }
}

pub trait ShellHook {
    fn shell(&mut self, executor: &Executor, dir: &str, env: &[String]) -> ControlResult<()>;
}
