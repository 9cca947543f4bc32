//! Session state and the testbed lifecycle state machine.

use tracing::debug;

use crate::{
    run_with_deadline, ControlError, ControlResult, Deadline, Executor, TestbedBackend,
};

pub const CAPABILITY_REVERT: &str = "revert";
pub const CAPABILITY_REBOOT: &str = "reboot";
pub const CAPABILITY_DOWNTMP_HOST_PREFIX: &str = "downtmp-host=";

pub const DOWNTMP_TEMPLATE: &str = "/tmp/tb-virt.XXXXXX";
pub const REBOOT_CACHE_DIR: &str = "/var/cache/tb-virt";
pub const REBOOT_CACHE_ARCHIVE: &str = "/var/cache/tb-virt/tmpdir.tar";

/// Capability strings in the order the backend advertised them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(Vec<String>);

impl Capabilities {
    pub fn new(capabilities: Vec<String>) -> Self {
        Self(capabilities)
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.0.iter().any(|entry| entry == capability)
    }

    pub fn supports_revert(&self) -> bool {
        self.contains(CAPABILITY_REVERT)
    }

    pub fn supports_reboot(&self) -> bool {
        self.contains(CAPABILITY_REBOOT)
    }

    /// Host-side mirror of the testbed working directory, if advertised.
    pub fn downtmp_host(&self) -> Option<&str> {
        self.0
            .iter()
            .find_map(|entry| entry.strip_prefix(CAPABILITY_DOWNTMP_HOST_PREFIX))
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
}

/// Per-process testbed session.
///
/// `downtmp` is set exactly while the testbed is open. `downtmp_open` is the
/// path chosen by the first successful open and is re-asserted on every
/// later open, revert and reboot.
#[derive(Debug, Default)]
pub struct Session {
    downtmp: Option<String>,
    downtmp_open: Option<String>,
    auxverb: Vec<String>,
    capabilities: Option<Capabilities>,
    cleaning: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        if self.downtmp.is_some() {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    pub fn downtmp(&self) -> Option<&str> {
        self.downtmp.as_deref()
    }

    pub fn downtmp_open(&self) -> Option<&str> {
        self.downtmp_open.as_deref()
    }

    pub fn auxverb(&self) -> &[String] {
        &self.auxverb
    }

    pub fn is_cleaning(&self) -> bool {
        self.cleaning
    }

    pub fn executor(&self, backend: &dyn TestbedBackend) -> Executor {
        Executor::new(self.auxverb.clone(), backend.child_setup())
    }

    /// Working directory of an open session, or a protocol error naming `verb`.
    pub fn require_open(&self, verb: &str) -> ControlResult<&str> {
        self.downtmp
            .as_deref()
            .ok_or_else(|| ControlError::protocol(format!("`{verb}' when not open")))
    }

    /// Capabilities cached for this session, querying the backend on first use.
    pub fn capabilities(&mut self, backend: &mut dyn TestbedBackend) -> ControlResult<&Capabilities> {
        if self.capabilities.is_none() {
            let advertised = backend.capabilities()?;
            debug!("backend capabilities: {advertised:?}");
            self.capabilities = Some(Capabilities::new(advertised));
        }
        Ok(self.capabilities.get_or_insert_with(Capabilities::default))
    }

    pub fn cached_capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    pub fn open(&mut self, backend: &mut dyn TestbedBackend) -> ControlResult<String> {
        if self.is_open() {
            return Err(ControlError::protocol("`open' when already open"));
        }
        self.auxverb = backend.open()?;
        self.resolve_downtmp(backend)?;
        self.capabilities = None;
        self.capabilities(backend)?;
        debug!("auxverb = {:?}, downtmp = {:?}", self.auxverb, self.downtmp);
        Ok(self.require_open("open")?.to_string())
    }

    pub fn revert(&mut self, backend: &mut dyn TestbedBackend) -> ControlResult<String> {
        self.require_open("revert")?;
        if !self.capabilities(backend)?.supports_revert() {
            return Err(ControlError::protocol(
                "`revert' when `revert' not advertised",
            ));
        }
        self.auxverb = backend.revert()?;
        self.resolve_downtmp(backend)?;
        debug!("auxverb = {:?}, downtmp = {:?}", self.auxverb, self.downtmp);
        Ok(self.require_open("revert")?.to_string())
    }

    /// Reboot while carrying the working directory across via an archive.
    pub fn reboot(
        &mut self,
        backend: &mut dyn TestbedBackend,
        copy_timeout_secs: u64,
    ) -> ControlResult<()> {
        let downtmp = self.require_open("reboot")?.to_string();
        if !self.capabilities(backend)?.supports_reboot() {
            return Err(ControlError::protocol(
                "`reboot' when `reboot' not advertised",
            ));
        }

        let save_script = format!(
            "rm -f {archive}\nmkdir -p {dir}/\ntar --create --absolute-names -f {archive} {downtmp}\n",
            archive = REBOOT_CACHE_ARCHIVE,
            dir = REBOOT_CACHE_DIR,
            downtmp = shell_words::quote(&downtmp),
        );
        let executor = self.executor(backend);
        run_with_deadline(copy_timeout_secs, |deadline| {
            executor.run_required(&["sh", "-ec", save_script.as_str()], true, false, deadline)
        })?;
        debug!("reboot: saved current downtmp, rebooting");

        backend.reboot(&executor)?;
        self.resolve_downtmp(backend)?;

        let restore_script = format!(
            "tar --extract --absolute-names -f {archive}\nrm -r {dir}/\n",
            archive = REBOOT_CACHE_ARCHIVE,
            dir = REBOOT_CACHE_DIR,
        );
        let executor = self.executor(backend);
        run_with_deadline(copy_timeout_secs, |deadline| {
            executor.run_required(&["sh", "-ec", restore_script.as_str()], true, false, deadline)
        })?;
        debug!("reboot: restored downtmp {downtmp}");
        Ok(())
    }

    pub fn close(&mut self, backend: &mut dyn TestbedBackend) -> ControlResult<()> {
        self.require_open("close")?;
        self.teardown(backend)
    }

    /// Release the testbed if one is open; safe to call in any state.
    ///
    /// A teardown requested while another is running returns immediately.
    /// The session is marked closed even when the cleanup hook fails.
    pub fn teardown(&mut self, backend: &mut dyn TestbedBackend) -> ControlResult<()> {
        debug!("cleanup...");
        if self.cleaning {
            return Ok(());
        }
        self.cleaning = true;
        let result = match self.downtmp.clone() {
            Some(downtmp) => {
                let executor = self.executor(backend);
                backend.cleanup(&executor, &downtmp)
            }
            None => Ok(()),
        };
        self.cleaning = false;
        self.downtmp = None;
        self.capabilities = None;
        result
    }

    fn resolve_downtmp(&mut self, backend: &mut dyn TestbedBackend) -> ControlResult<()> {
        let executor = self.executor(backend);
        let resolved = backend.downtmp(&executor, self.downtmp_open.as_deref())?;
        if resolved.is_empty() {
            return Err(ControlError::fatal(
                "testbed backend reported an empty downtmp path",
            ));
        }
        // Record the path so teardown can release what the backend created.
        self.downtmp = Some(resolved.clone());
        match &self.downtmp_open {
            Some(expected) if *expected != resolved => Err(ControlError::fatal(format!(
                "testbed backend failed to restore downtmp path {expected}, gave {resolved} instead"
            ))),
            Some(_) => Ok(()),
            None => {
                self.downtmp_open = Some(resolved);
                Ok(())
            }
        }
    }
}

/// Create the testbed working directory for a backend's `downtmp` hook.
///
/// With a `previous` path the same directory is recreated, since built trees
/// may embed absolute paths; otherwise a fresh world-writable sticky
/// directory is made from [`DOWNTMP_TEMPLATE`].
pub fn make_downtmp(executor: &Executor, previous: Option<&str>) -> ControlResult<String> {
    if let Some(path) = previous {
        executor.run_required(
            &["mkdir", "--mode=1777", "--parents", path],
            true,
            false,
            Deadline::none(),
        )?;
        return Ok(path.to_string());
    }
    let created = executor
        .run_required(
            &["mktemp", "--directory", DOWNTMP_TEMPLATE],
            true,
            true,
            Deadline::none(),
        )?
        .unwrap_or_default();
    if created.is_empty() {
        return Err(ControlError::fatal("mktemp did not report a directory"));
    }
    executor.run_required(&["chmod", "1777", created.as_str()], true, false, Deadline::none())?;
    Ok(created)
}

/// Remove the testbed working directory; a failing `rm` is logged, not raised.
pub fn remove_downtmp(executor: &Executor, downtmp: &str, deadline: Deadline) -> ControlResult<()> {
    let argv = executor.testbed_argv(&["rm", "-rf", "--", downtmp]);
    let output = executor.spawn_and_wait(&argv, None, deadline, false)?;
    if !output.status.success() {
        debug!(
            "removing downtmp {downtmp} exited with {}: {}",
            crate::exit_status_code(output.status),
            output.stderr.trim_end()
        );
    }
    Ok(())
}
