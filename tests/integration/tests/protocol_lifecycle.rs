use std::{
    collections::VecDeque,
    fs,
    io::Cursor,
    os::unix::fs::PermissionsExt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use tb_control::{
    ChildSetup, ControlResult, Engine, EngineConfig, Executor, Response, ServeOutcome,
    TestbedBackend, EXIT_FAILURE,
};

/// Backend answering from a queue of working directories and counting the
/// hooks that would touch a real testbed.
struct QueueBackend {
    capabilities: Vec<String>,
    auxverb: Vec<String>,
    downtmps: VecDeque<String>,
    fallback: String,
    lifecycle_hooks: Arc<AtomicUsize>,
    cleanups: Vec<String>,
}

impl QueueBackend {
    fn new(fallback: &str, capabilities: &[&str]) -> Self {
        Self {
            capabilities: capabilities.iter().map(|cap| cap.to_string()).collect(),
            auxverb: Vec::new(),
            downtmps: VecDeque::new(),
            fallback: fallback.to_string(),
            lifecycle_hooks: Arc::new(AtomicUsize::new(0)),
            cleanups: Vec::new(),
        }
    }

    fn answering(mut self, downtmps: &[&str]) -> Self {
        self.downtmps = downtmps.iter().map(|path| path.to_string()).collect();
        self
    }
}

impl TestbedBackend for QueueBackend {
    fn capabilities(&mut self) -> ControlResult<Vec<String>> {
        Ok(self.capabilities.clone())
    }

    fn open(&mut self) -> ControlResult<Vec<String>> {
        self.lifecycle_hooks.fetch_add(1, Ordering::SeqCst);
        Ok(self.auxverb.clone())
    }

    fn downtmp(&mut self, _executor: &Executor, _previous: Option<&str>) -> ControlResult<String> {
        Ok(self
            .downtmps
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }

    fn revert(&mut self) -> ControlResult<Vec<String>> {
        self.lifecycle_hooks.fetch_add(1, Ordering::SeqCst);
        Ok(self.auxverb.clone())
    }

    fn reboot(&mut self, _executor: &Executor) -> ControlResult<()> {
        self.lifecycle_hooks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cleanup(&mut self, _executor: &Executor, downtmp: &str) -> ControlResult<()> {
        self.cleanups.push(downtmp.to_string());
        Ok(())
    }

    fn child_setup(&self) -> Option<ChildSetup> {
        let setup: ChildSetup = Arc::new(|| -> std::io::Result<()> { Ok(()) });
        Some(setup)
    }
}

fn serve(engine: &mut Engine<QueueBackend>, input: &str) -> (ServeOutcome, Vec<String>, String) {
    let mut output = Vec::new();
    let mut errors = Vec::new();
    let outcome = engine.serve(Cursor::new(input.to_string()), &mut output, &mut errors);
    let lines = String::from_utf8(output)
        .expect("utf8 output")
        .lines()
        .map(str::to_string)
        .collect();
    (outcome, lines, String::from_utf8(errors).expect("utf8 errors"))
}

#[test]
fn integration_open_session_verbs_require_open_in_every_state() {
    let mut engine = Engine::new(
        QueueBackend::new("/tmp/tb-virt.life", &["revert"]),
        EngineConfig::default(),
    );
    let needs_open = ["close", "revert", "print-execute-command", "shell /"];

    for verb in needs_open {
        let response = engine.handle_line(verb).expect("answered");
        assert!(
            matches!(response, Response::ProtocolError(ref message) if message.ends_with("when not open")),
            "{verb}: {response:?}"
        );
    }
    assert_eq!(engine.session().downtmp(), None);

    assert!(engine.handle_line("open").expect("open").is_ok());
    assert_eq!(engine.session().downtmp(), Some("/tmp/tb-virt.life"));
    assert_eq!(
        engine.handle_line("print-execute-command").expect("answered"),
        Response::Ok(vec![String::new()])
    );
    assert!(engine.handle_line("revert").expect("revert").is_ok());
    assert_eq!(engine.session().downtmp(), Some("/tmp/tb-virt.life"));

    assert!(engine.handle_line("close").expect("close").is_ok());
    assert_eq!(engine.session().downtmp(), None);
    for verb in needs_open {
        assert!(matches!(
            engine.handle_line(verb).expect("answered"),
            Response::ProtocolError(_)
        ));
    }
}

#[test]
fn integration_unadvertised_capabilities_never_reach_the_backend() {
    let backend = QueueBackend::new("/tmp/tb-virt.caps", &[]);
    let hooks = Arc::clone(&backend.lifecycle_hooks);
    let mut engine = Engine::new(backend, EngineConfig::default());

    let (outcome, lines, errors) = serve(&mut engine, "open\nrevert\nreboot\nrevert\nquit\n");

    assert_eq!(outcome, ServeOutcome::Exit(0));
    assert_eq!(
        lines,
        [
            "ok",
            "ok /tmp/tb-virt.caps",
            "error %60revert%27%20when%20%60revert%27%20not%20advertised",
            "error %60reboot%27%20when%20%60reboot%27%20not%20advertised",
            "error %60revert%27%20when%20%60revert%27%20not%20advertised",
        ]
    );
    assert!(errors.is_empty());
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
}

#[test]
fn integration_changed_downtmp_on_reopen_is_fatal_not_a_protocol_error() {
    let backend =
        QueueBackend::new("/tmp/unused", &[]).answering(&["/tmp/tb-virt.one", "/tmp/tb-virt.two"]);
    let mut engine = Engine::new(backend, EngineConfig::default());

    let (outcome, lines, errors) = serve(&mut engine, "open\nclose\nopen\ncapabilities\n");

    assert_eq!(outcome, ServeOutcome::Exit(EXIT_FAILURE));
    assert_eq!(lines, ["ok", "ok /tmp/tb-virt.one", "ok"]);
    assert!(errors.contains(
        "failure: testbed backend failed to restore downtmp path /tmp/tb-virt.one, gave /tmp/tb-virt.two instead"
    ));
    assert_eq!(
        engine.backend().cleanups,
        ["/tmp/tb-virt.one", "/tmp/tb-virt.two"]
    );
}

#[test]
fn integration_revert_then_changed_path_exits_with_failure_status() {
    let backend = QueueBackend::new("/tmp/unused", &["revert"]).answering(&[
        "/tmp/tb-virt.p",
        "/tmp/tb-virt.p",
        "/tmp/tb-virt.other",
    ]);
    let mut engine = Engine::new(backend, EngineConfig::default());

    let (outcome, lines, _errors) = serve(&mut engine, "open\nrevert\nrevert\nquit\n");

    assert_eq!(outcome, ServeOutcome::Exit(EXIT_FAILURE));
    assert_eq!(lines, ["ok", "ok /tmp/tb-virt.p", "ok /tmp/tb-virt.p"]);
}

#[test]
fn integration_unknown_verbs_answer_one_error_line_each() {
    let mut engine = Engine::new(
        QueueBackend::new("/tmp/tb-virt.unk", &[]),
        EngineConfig::default(),
    );

    let (outcome, lines, _errors) = serve(
        &mut engine,
        "open\nfrobulate\nfrobulate a b c\ncopyup\nprint_execute_command\nquit\n",
    );

    assert_eq!(outcome, ServeOutcome::Exit(0));
    assert_eq!(
        lines,
        [
            "ok",
            "ok /tmp/tb-virt.unk",
            "error unknown%20command%20%60frobulate%27",
            "error unknown%20command%20%60frobulate%27",
            "error too%20few%20arguments%20to%20command%20%60copyup%27",
            "ok ",
        ]
    );
    assert_eq!(engine.backend().cleanups, ["/tmp/tb-virt.unk"]);
}

#[test]
fn integration_piped_round_trip_keeps_bytes_and_mode() {
    let host = tempfile::tempdir().expect("host");
    let testbed = tempfile::tempdir().expect("testbed");
    let downtmp = tempfile::tempdir().expect("downtmp");
    let original = host.path().join("file");
    fs::write(&original, b"\x00binary\xffpayload\n").expect("write");
    fs::set_permissions(&original, fs::Permissions::from_mode(0o755)).expect("chmod");

    let mut engine = Engine::new(
        QueueBackend::new(downtmp.path().to_str().expect("utf8"), &[]),
        EngineConfig::default().with_copy_timeout_secs(30),
    );
    let script = format!(
        "open\ncopydown {host}/file {tb}/file\ncopyup {tb}/file {host}/file2\nclose\nquit\n",
        host = host.path().display(),
        tb = testbed.path().display(),
    );
    let (outcome, lines, errors) = serve(&mut engine, &script);

    assert_eq!(outcome, ServeOutcome::Exit(0), "{errors}");
    assert_eq!(lines[2..], ["ok", "ok", "ok"]);
    let copied = host.path().join("file2");
    assert_eq!(fs::read(&original).expect("read"), fs::read(&copied).expect("read copy"));
    assert_eq!(
        fs::metadata(&copied).expect("stat").permissions().mode() & 0o777,
        0o755
    );
}
