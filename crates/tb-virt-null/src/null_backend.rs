//! Backend that runs everything directly on the local host.

use tb_control::{
    make_downtmp, remove_downtmp, ControlResult, Deadline, Executor, TestbedBackend,
    CAPABILITY_DOWNTMP_HOST_PREFIX,
};
use tracing::debug;

#[derive(Debug, Default)]
pub(crate) struct NullBackend {
    extra_capabilities: Vec<String>,
    shared_mirror: bool,
    copy_timeout_secs: u64,
    downtmp: Option<String>,
}

impl NullBackend {
    pub(crate) fn new(
        extra_capabilities: Vec<String>,
        shared_mirror: bool,
        copy_timeout_secs: u64,
    ) -> Self {
        Self {
            extra_capabilities,
            shared_mirror,
            copy_timeout_secs,
            downtmp: None,
        }
    }
}

impl TestbedBackend for NullBackend {
    fn capabilities(&mut self) -> ControlResult<Vec<String>> {
        let mut capabilities = self.extra_capabilities.clone();
        // The host path equals the testbed path, so the mirror is downtmp itself.
        if let (true, Some(downtmp)) = (self.shared_mirror, &self.downtmp) {
            capabilities.push(format!("{CAPABILITY_DOWNTMP_HOST_PREFIX}{downtmp}"));
        }
        Ok(capabilities)
    }

    fn open(&mut self) -> ControlResult<Vec<String>> {
        debug!("null testbed: nothing to prepare");
        Ok(Vec::new())
    }

    fn downtmp(&mut self, executor: &Executor, previous: Option<&str>) -> ControlResult<String> {
        let downtmp = make_downtmp(executor, previous)?;
        self.downtmp = Some(downtmp.clone());
        Ok(downtmp)
    }

    fn revert(&mut self) -> ControlResult<Vec<String>> {
        debug!("null testbed: revert is a no-op");
        Ok(Vec::new())
    }

    fn reboot(&mut self, _executor: &Executor) -> ControlResult<()> {
        debug!("null testbed: reboot is a no-op");
        Ok(())
    }

    fn cleanup(&mut self, executor: &Executor, downtmp: &str) -> ControlResult<()> {
        self.downtmp = None;
        remove_downtmp(
            executor,
            downtmp,
            Deadline::after_secs(self.copy_timeout_secs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_mirror_capability_needs_an_open_testbed() {
        let mut backend = NullBackend::new(vec!["revert".to_string()], true, 30);
        assert_eq!(backend.capabilities().expect("caps"), ["revert"]);

        backend.downtmp = Some("/tmp/tb-virt.x1".to_string());
        assert_eq!(
            backend.capabilities().expect("caps"),
            ["revert", "downtmp-host=/tmp/tb-virt.x1"]
        );
    }

    #[test]
    fn functional_downtmp_is_created_recreated_and_removed() {
        let mut backend = NullBackend::new(Vec::new(), false, 30);
        let executor = Executor::default();

        let created = backend.downtmp(&executor, None).expect("mktemp");
        assert!(created.starts_with("/tmp/tb-virt."));
        let path = std::path::Path::new(&created);
        assert!(path.is_dir());

        backend.cleanup(&executor, &created).expect("cleanup");
        assert!(!path.exists());

        let again = backend
            .downtmp(&executor, Some(created.as_str()))
            .expect("recreate");
        assert_eq!(again, created);
        assert!(path.is_dir());
        backend.cleanup(&executor, &again).expect("cleanup");
    }
}
