//! # Corvus Sandbox Mock
//!
//! An in-process [`SandboxRuntime`] for development and testing. Nothing is isolated: the
//! "script" is a tiny program of directives, one per line, interpreted on a tokio task.
//!
//! | directive | effect |
//! |---|---|
//! | `print <text>` | writes `<text>` and a newline to stdout |
//! | `eprint <text>` | writes `<text>` and a newline to stderr |
//! | `sleep <secs>` | waits, fractional seconds allowed |
//! | `exit <code>` | exits with `<code>` |
//! | `ignore-term` | the sandbox ignores graceful stop signals |
//!
//! Other lines are ignored, a program without `exit` exits with `0`.
//! A graceful stop exits with `143` (SIGINT: `130`), a kill with `137`.
//!
//! **DO NOT use this in production!!!**
//!
//! ## Usage
//!
//! ```rust
//! # use corvus_sandbox_mock::MockRuntime;
//! # fn main() {
//! let runtime = MockRuntime::new();
//! runtime.fail_next_create(corvus_core::error::SandboxError::Unavailable("down".into()));
//! # }
//! ```

use corvus_core::prelude::*;

use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const EXIT_TERMINATED: i64 = 143;
pub const EXIT_INTERRUPTED: i64 = 130;
pub const EXIT_KILLED: i64 = 137;

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Print(LogSource, String),
    Sleep(Duration),
    Exit(i64),
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Program {
    steps: Vec<Step>,
    ignore_term: bool,
}

impl Program {
    fn parse(script: &str) -> Self {
        let mut program = Program::default();
        for line in script.lines().map(str::trim) {
            let (directive, arg) = line.split_once(' ').unwrap_or((line, ""));
            let step = match directive {
                "print" => Step::Print(LogSource::Stdout, arg.to_string()),
                "eprint" => Step::Print(LogSource::Stderr, arg.to_string()),
                "sleep" => match arg.trim().parse::<f64>() {
                    Ok(secs) if secs.is_finite() && secs >= 0.0 => {
                        Step::Sleep(Duration::from_secs_f64(secs))
                    }
                    _ => continue,
                },
                "exit" => match arg.trim().parse() {
                    Ok(code) => Step::Exit(code),
                    Err(_) => continue,
                },
                "ignore-term" => {
                    program.ignore_term = true;
                    continue;
                }
                _ => continue,
            };
            program.steps.push(step);
        }
        program
    }
}

struct Sandbox {
    spec: SandboxSpec,
    program: Program,
    exit: Arc<watch::Sender<Option<i64>>>,
    output_tx: Option<mpsc::UnboundedSender<SandboxOutput>>,
    output_rx: Option<mpsc::UnboundedReceiver<SandboxOutput>>,
    task: Option<JoinHandle<()>>,
}

impl Sandbox {
    fn finish(&mut self, code: i64) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.output_tx = None;
        record_exit(&self.exit, code);
    }
}

fn record_exit(exit: &watch::Sender<Option<i64>>, code: i64) {
    exit.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(code);
            true
        } else {
            false
        }
    });
}

#[derive(Default)]
struct State {
    sandboxes: HashMap<String, Sandbox>,
    specs: Vec<SandboxSpec>,
    signals: Vec<(SandboxHandle, StopSignal)>,
    created: usize,
    destroyed: usize,
    kills: usize,
    create_failure: Option<SandboxError>,
    destroy_failures: Option<usize>,
    unavailable: bool,
    follow_requires_start: bool,
    calls: Vec<&'static str>,
}

/// Scripted runtime. Clones share the same sandboxes and counters.
#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<State>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The next `create` fails with `error`.
    pub fn fail_next_create(&self, error: SandboxError) {
        self.state().create_failure = Some(error);
    }

    /// The next `times` calls to `destroy` fail transiently.
    pub fn fail_destroy(&self, times: usize) {
        self.state().destroy_failures = Some(times);
    }

    /// Every call to `destroy` fails transiently.
    pub fn fail_destroy_always(&self) {
        self.state().destroy_failures = Some(usize::MAX);
    }

    /// `init` reports the runtime as unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Like Docker, attaching to the output of a sandbox that was not started yet yields an
    /// empty stream.
    pub fn set_follow_requires_start(&self, enabled: bool) {
        self.state().follow_requires_start = enabled;
    }

    /// Lifecycle calls (`create`, `start`, `output`, `destroy`) in call order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.state().calls.clone()
    }

    pub fn created(&self) -> usize {
        self.state().created
    }

    pub fn destroyed(&self) -> usize {
        self.state().destroyed
    }

    pub fn kills(&self) -> usize {
        self.state().kills
    }

    /// Sandboxes created and not yet destroyed.
    pub fn live(&self) -> usize {
        self.state().sandboxes.len()
    }

    /// Every spec passed to `create`, in call order.
    pub fn specs(&self) -> Vec<SandboxSpec> {
        self.state().specs.clone()
    }

    pub fn signals(&self) -> Vec<(SandboxHandle, StopSignal)> {
        self.state().signals.clone()
    }

    fn with_sandbox<T>(
        &self,
        handle: &SandboxHandle,
        f: impl FnOnce(&mut Sandbox) -> Result<T, SandboxError>,
    ) -> Result<T, SandboxError> {
        let mut state = self.state();
        let sandbox = state
            .sandboxes
            .get_mut(handle.as_str())
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;
        f(sandbox)
    }
}

impl SandboxRuntime for MockRuntime {
    async fn init(&self) -> Result<(), SandboxError> {
        if self.state().unavailable {
            return Err(SandboxError::Unavailable("mock runtime disabled".to_string()));
        }
        Ok(())
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let mut state = self.state();
        state.calls.push("create");
        state.specs.push(spec.clone());
        if let Some(error) = state.create_failure.take() {
            return Err(error);
        }

        let script = spec.command.last().map(String::as_str).unwrap_or_default();
        let (exit, _) = watch::channel(None);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let id = format!("mock-{}", uuid::Uuid::new_v4());

        state.sandboxes.insert(
            id.clone(),
            Sandbox {
                spec: spec.clone(),
                program: Program::parse(script),
                exit: Arc::new(exit),
                output_tx: Some(output_tx),
                output_rx: Some(output_rx),
                task: None,
            },
        );
        state.created += 1;
        tracing::debug!(sandbox = %id, name = %spec.name, "Mock sandbox created");

        Ok(SandboxHandle(id))
    }

    async fn start(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.state().calls.push("start");
        self.with_sandbox(handle, |sandbox| {
            if sandbox.task.is_some() {
                return Err(SandboxError::InvalidRequest(format!(
                    "{} already started",
                    sandbox.spec.name
                )));
            }
            let Some(out) = sandbox.output_tx.take() else {
                return Err(SandboxError::InvalidRequest(format!(
                    "{} already exited",
                    sandbox.spec.name
                )));
            };
            let steps = sandbox.program.steps.clone();
            let exit = sandbox.exit.clone();
            sandbox.task = Some(tokio::spawn(run_program(steps, out, exit)));
            Ok(())
        })
    }

    async fn output(&self, handle: &SandboxHandle) -> Result<OutputStream, SandboxError> {
        let follow_requires_start = {
            let mut state = self.state();
            state.calls.push("output");
            state.follow_requires_start
        };
        let rx = self.with_sandbox(handle, |sandbox| {
            if follow_requires_start && sandbox.task.is_none() {
                return Ok(None);
            }
            sandbox.output_rx.take().map(Some).ok_or_else(|| {
                SandboxError::InvalidRequest("output already attached".to_string())
            })
        })?;
        let Some(rx) = rx else {
            return Ok(futures::stream::empty().boxed());
        };

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|output| (Ok(output), rx))
        })
        .boxed())
    }

    async fn signal(&self, handle: &SandboxHandle, signal: StopSignal) -> Result<(), SandboxError> {
        self.state().signals.push((handle.clone(), signal));
        self.with_sandbox(handle, |sandbox| {
            if !sandbox.program.ignore_term {
                sandbox.finish(match signal {
                    StopSignal::Terminate => EXIT_TERMINATED,
                    StopSignal::Interrupt => EXIT_INTERRUPTED,
                });
            }
            Ok(())
        })
    }

    async fn kill(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.with_sandbox(handle, |sandbox| {
            sandbox.finish(EXIT_KILLED);
            Ok(())
        })?;
        self.state().kills += 1;
        Ok(())
    }

    async fn wait_exit(&self, handle: &SandboxHandle) -> Result<i64, SandboxError> {
        let mut exit = self.with_sandbox(handle, |sandbox| Ok(sandbox.exit.subscribe()))?;
        let code = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SandboxError::NotFound(handle.to_string()))?;
        code.ok_or_else(|| SandboxError::System("exit code missing".to_string()))
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        let mut state = self.state();
        state.calls.push("destroy");
        match state.destroy_failures.as_mut() {
            Some(remaining) if *remaining > 0 => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return Err(SandboxError::Transient("mock destroy failure".to_string()));
            }
            _ => {}
        }

        if let Some(mut sandbox) = state.sandboxes.remove(handle.as_str()) {
            sandbox.finish(EXIT_KILLED);
            state.destroyed += 1;
            tracing::debug!(sandbox = %handle, "Mock sandbox destroyed");
        }
        Ok(())
    }
}

async fn run_program(
    steps: Vec<Step>,
    out: mpsc::UnboundedSender<SandboxOutput>,
    exit: Arc<watch::Sender<Option<i64>>>,
) {
    let mut code = 0;
    for step in steps {
        match step {
            Step::Print(source, text) => {
                let _ = out.send(SandboxOutput {
                    source,
                    data: Bytes::from(format!("{text}\n")),
                });
            }
            Step::Sleep(duration) => tokio::time::sleep(duration).await,
            Step::Exit(c) => {
                code = c;
                break;
            }
        }
    }
    drop(out);
    record_exit(&exit, code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(script: &str) -> SandboxSpec {
        SandboxSpec {
            name: "test".to_string(),
            image: "mock".to_string(),
            command: vec!["python3".into(), "-u".into(), "-c".into(), script.into()],
            env: Vec::new(),
            cpu_share: 512,
            memory_limit_bytes: 512 * 1024 * 1024,
            gpu: None,
            network_enabled: false,
            labels: Vec::new(),
        }
    }

    #[test]
    fn parses_directives() {
        let program = Program::parse("print hi\nimport os\nsleep 0.5\nignore-term\nexit 3\n");
        assert!(program.ignore_term);
        assert_eq!(
            program.steps,
            vec![
                Step::Print(LogSource::Stdout, "hi".to_string()),
                Step::Sleep(Duration::from_millis(500)),
                Step::Exit(3),
            ]
        );
    }

    #[tokio::test]
    async fn runs_the_program() {
        let runtime = MockRuntime::new();
        let handle = runtime.create(&spec("print out\neprint err\nexit 2")).await.unwrap();
        let output = runtime.output(&handle).await.unwrap();
        runtime.start(&handle).await.unwrap();

        assert_eq!(runtime.wait_exit(&handle).await.unwrap(), 2);
        let chunks: Vec<_> = output.map(|o| o.unwrap()).collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].source, LogSource::Stderr);
        assert_eq!(chunks[1].data, Bytes::from("err\n"));

        runtime.destroy(&handle).await.unwrap();
        assert_eq!((runtime.created(), runtime.destroyed(), runtime.live()), (1, 1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn signals_stop_the_program() {
        let runtime = MockRuntime::new();
        let handle = runtime.create(&spec("sleep 60")).await.unwrap();
        runtime.start(&handle).await.unwrap();

        runtime.signal(&handle, StopSignal::Terminate).await.unwrap();
        assert_eq!(runtime.wait_exit(&handle).await.unwrap(), EXIT_TERMINATED);
    }

    #[tokio::test(start_paused = true)]
    async fn ignoring_term_needs_a_kill() {
        let runtime = MockRuntime::new();
        let handle = runtime.create(&spec("ignore-term\nsleep 60")).await.unwrap();
        runtime.start(&handle).await.unwrap();
        runtime.signal(&handle, StopSignal::Terminate).await.unwrap();

        let waited =
            tokio::time::timeout(Duration::from_secs(1), runtime.wait_exit(&handle)).await;
        assert!(waited.is_err());

        runtime.kill(&handle).await.unwrap();
        assert_eq!(runtime.wait_exit(&handle).await.unwrap(), EXIT_KILLED);
    }

    #[tokio::test]
    async fn follow_before_start_sees_nothing() {
        let runtime = MockRuntime::new();
        runtime.set_follow_requires_start(true);
        let handle = runtime.create(&spec("print out\nexit 0")).await.unwrap();

        let early: Vec<_> = runtime.output(&handle).await.unwrap().collect().await;
        assert!(early.is_empty());

        runtime.start(&handle).await.unwrap();
        let late: Vec<_> = runtime.output(&handle).await.unwrap().collect().await;
        assert_eq!(late.len(), 1);
        assert_eq!(runtime.calls(), vec!["create", "output", "start", "output"]);
    }

    #[tokio::test]
    async fn injected_failures() {
        let runtime = MockRuntime::new();
        runtime.fail_next_create(SandboxError::Unavailable("down".to_string()));
        assert!(runtime.create(&spec("")).await.is_err());
        let handle = runtime.create(&spec("")).await.unwrap();

        runtime.fail_destroy(1);
        assert!(runtime.destroy(&handle).await.unwrap_err().is_transient());
        runtime.destroy(&handle).await.unwrap();
        assert_eq!(runtime.live(), 0);

        runtime.set_unavailable(true);
        assert!(runtime.init().await.is_err());
    }
}
