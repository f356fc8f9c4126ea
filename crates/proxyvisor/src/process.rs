//! Process supervision.
//!
//! Each launched proxy gets one supervision task. The task owns the child, pumps
//! stdout and stderr into one line stream for classification, waits for exit and
//! answers stop requests with SIGTERM, a bounded wait, then SIGKILL.

use chrono::Utc;
use log::{debug, info, warn};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{OwnedSemaphorePermit, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::ServiceError;
use crate::launch::Launched;
use crate::models::RunState;
use crate::registry::{Registry, Reservation, StopRequest, Supervision};
use crate::sink::{LogLevel, LogSink};

/// Default wait between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of output lines forwarded per run.
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 10_000;

/// How long to wait for output pumps after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const LINE_CHANNEL_CAPACITY: usize = 256;

/// Tag for lifecycle records written by the supervisor itself.
const SUPERVISOR_TAG: &str = "supervisor";

/// Substring rules for classifying output lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputClassifier {
    pub success: Vec<String>,
    pub warning: Vec<String>,
    pub error: Vec<String>,
}

impl Default for OutputClassifier {
    fn default() -> Self {
        Self {
            success: vec![
                "start frpc success".into(),
                "start frps success".into(),
                "login to server success".into(),
            ],
            warning: vec!["[W]".into(), "error".into(), "failed".into()],
            error: vec!["[E]".into()],
        }
    }
}

impl OutputClassifier {
    /// Success markers win over error markers, which win over warnings.
    pub fn classify(&self, line: &str) -> LogLevel {
        let hit = |keys: &[String]| keys.iter().any(|k| !k.is_empty() && line.contains(k.as_str()));
        if hit(&self.success) {
            LogLevel::Success
        } else if hit(&self.error) {
            LogLevel::Error
        } else if hit(&self.warning) {
            LogLevel::Warn
        } else {
            LogLevel::Info
        }
    }
}

/// Starts and stops supervision tasks.
#[derive(Clone)]
pub struct ProcessSupervisor {
    registry: Arc<Registry>,
    sink: Arc<dyn LogSink>,
    classifier: Arc<OutputClassifier>,
    max_output_lines: usize,
    stop_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            registry,
            sink,
            classifier: Arc::new(OutputClassifier::default()),
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_classifier(mut self, classifier: OutputClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    pub fn with_max_output_lines(mut self, max: usize) -> Self {
        self.max_output_lines = max;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Take ownership of a launched process and return its RUNNING state.
    ///
    /// `tag` labels forwarded output lines (usually the executable name). The
    /// optional permit is held until the process is gone.
    pub fn supervise(
        &self,
        reservation: Reservation,
        launched: Launched,
        tag: &str,
        permit: Option<OwnedSemaphorePermit>,
    ) -> RunState {
        let Launched {
            mut child,
            strategy,
            ..
        } = launched;
        let config_id = reservation.config_id().to_string();
        let run_id = reservation.run_id();
        let pid = child.id();
        let started_at = Utc::now();

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, line_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, line_tx.clone())));
        }
        drop(line_tx);

        let reader = tokio::spawn(forward_lines(
            line_rx,
            self.sink.clone(),
            self.classifier.clone(),
            config_id.clone(),
            tag.to_string(),
            self.max_output_lines,
        ));

        let (control, control_rx) = mpsc::channel(1);
        reservation.commit(Supervision {
            run_id,
            pid,
            strategy,
            started_at,
            control,
        });

        let state = RunState::running(&config_id, pid, started_at, strategy);
        self.registry.set_status(state.clone());
        info!(
            "{} running via {} (pid {})",
            config_id,
            strategy,
            pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".into())
        );
        self.sink.record(
            LogLevel::Info,
            SUPERVISOR_TAG,
            &format!("process started via {strategy}"),
            Some(&config_id),
        );

        let task = SupervisionTask {
            registry: self.registry.clone(),
            sink: self.sink.clone(),
            config_id,
            run_id,
            pid,
            stop_timeout: self.stop_timeout,
        };
        tokio::spawn(task.run(child, control_rx, pumps, reader, permit));

        state
    }

    /// Ask the supervision task for `config_id` to terminate its process and
    /// wait for the final state.
    pub async fn stop(&self, config_id: &str) -> Result<RunState, ServiceError> {
        let control = self
            .registry
            .control(config_id)
            .ok_or_else(|| ServiceError::NotRunning(config_id.to_string()))?;

        let (reply, reply_rx) = oneshot::channel();
        if control.send(StopRequest { reply }).await.is_err() {
            // The task already finished on its own.
            return Ok(self.registry.status(config_id));
        }
        Ok(reply_rx
            .await
            .unwrap_or_else(|_| self.registry.status(config_id)))
    }
}

struct SupervisionTask {
    registry: Arc<Registry>,
    sink: Arc<dyn LogSink>,
    config_id: String,
    run_id: u64,
    pid: Option<u32>,
    stop_timeout: Duration,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Stop(StopRequest),
}

impl SupervisionTask {
    async fn run(
        self,
        mut child: Child,
        mut control_rx: mpsc::Receiver<StopRequest>,
        mut pumps: Vec<JoinHandle<()>>,
        mut reader: JoinHandle<()>,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            Some(request) = control_rx.recv() => Outcome::Stop(request),
        };

        let (state, reply) = match outcome {
            Outcome::Exited(Ok(status)) => (exit_state(&self.config_id, status), None),
            Outcome::Exited(Err(e)) => (
                RunState::error(&self.config_id, format!("waiting for process failed: {e}")),
                None,
            ),
            Outcome::Stop(request) => {
                info!("stopping {}", self.config_id);
                terminate(&mut child, self.pid, self.stop_timeout).await;
                (RunState::stopped(&self.config_id), Some(request.reply))
            }
        };

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            for pump in pumps.iter_mut() {
                let _ = pump.await;
            }
            let _ = (&mut reader).await;
        })
        .await;
        if drained.is_err() {
            debug!("output of {} still open after exit, abandoning", self.config_id);
            for pump in &pumps {
                pump.abort();
            }
            reader.abort();
        }

        let (level, message) = match &state.error_message {
            Some(msg) => (LogLevel::Error, format!("process ended: {msg}")),
            None => (LogLevel::Info, "process stopped".to_string()),
        };
        self.sink
            .record(level, SUPERVISOR_TAG, &message, Some(&self.config_id));
        info!("{}: {}", self.config_id, message);

        drop(permit);
        self.registry
            .finish(&self.config_id, self.run_id, state.clone());

        if let Some(reply) = reply {
            let _ = reply.send(state);
        }
        drop(control_rx);
    }
}

/// SIGTERM the process group, wait, then SIGKILL.
async fn terminate(child: &mut Child, pid: Option<u32>, timeout: Duration) {
    match pid {
        Some(pid) => signal_group(pid, libc::SIGTERM),
        None => {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("process exited after SIGTERM: {}", status);
            return;
        }
        Ok(Err(e)) => warn!("error waiting for process {:?}: {}", pid, e),
        Err(_) => warn!(
            "process {:?} did not exit within {:?}, sending SIGKILL",
            pid, timeout
        ),
    }

    if let Some(pid) = pid {
        signal_group(pid, libc::SIGKILL);
    }
    if let Err(e) = child.kill().await {
        debug!("kill after SIGKILL to group: {}", e);
    }
}

/// Signal the process group led by `pid`, or just `pid` when it leads none.
fn signal_group(pid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let group = unsafe { libc::kill(-pid, signal) };
    if group != 0 {
        let single = unsafe { libc::kill(pid, signal) };
        if single != 0 {
            debug!(
                "kill({}, {}) failed: {}",
                pid,
                signal,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Map an exit status to the final state of a run that was not asked to stop.
pub fn exit_state(config_id: &str, status: ExitStatus) -> RunState {
    match (status.code(), status.signal()) {
        (Some(0), _) => RunState::stopped(config_id),
        (Some(code), _) => {
            let mut message = format!("exited with code {code}");
            if code > 128 {
                message.push_str(&format!(" (terminated by signal {})", code - 128));
            }
            RunState {
                exit_code: Some(code),
                ..RunState::error(config_id, message)
            }
        }
        (None, Some(sig)) => RunState {
            exit_code: Some(128 + sig),
            ..RunState::error(config_id, describe_signal(sig))
        },
        (None, None) => RunState::error(config_id, "exited (unknown status)"),
    }
}

fn describe_signal(sig: i32) -> String {
    let name = match sig {
        1 => "SIGHUP",
        2 => "SIGINT",
        6 => "SIGABRT",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        15 => "SIGTERM",
        _ => "",
    };
    if name.is_empty() {
        format!("killed by signal {sig}")
    } else {
        format!("killed by {name} (signal {sig})")
    }
}

/// Copy lines from one pipe into the shared channel. Invalid UTF-8 is replaced.
async fn pump<R>(stream: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut segments = BufReader::new(stream).split(b'\n');
    loop {
        match segments.next_segment().await {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes);
                let line = line.trim_end_matches('\r').to_string();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("output pipe read failed: {}", e);
                break;
            }
        }
    }
}

/// Classify and forward up to `max_lines` lines; drain and drop the rest.
async fn forward_lines(
    mut rx: mpsc::Receiver<String>,
    sink: Arc<dyn LogSink>,
    classifier: Arc<OutputClassifier>,
    config_id: String,
    tag: String,
    max_lines: usize,
) {
    let mut seen = 0usize;
    while let Some(line) = rx.recv().await {
        if seen < max_lines {
            let level = classifier.classify(&line);
            sink.record(level, &tag, &line, Some(&config_id));
        } else if seen == max_lines {
            warn!(
                "{} produced more than {} output lines, dropping the rest",
                config_id, max_lines
            );
            sink.record(
                LogLevel::Warn,
                SUPERVISOR_TAG,
                &format!("output limit of {max_lines} lines reached, dropping further output"),
                Some(&config_id),
            );
        }
        seen = seen.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch::{LaunchPlan, LaunchStrategy};
    use crate::models::Phase;
    use crate::sink::MemorySink;
    use std::path::PathBuf;
    use std::process::Stdio;
    use tokio::process::Command;
    use tokio::sync::broadcast;

    fn launched(script: &str) -> Launched {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        Launched {
            child,
            strategy: LaunchStrategy::Direct,
            plan: LaunchPlan {
                strategy: LaunchStrategy::Direct,
                program: PathBuf::from("sh"),
                args: vec!["-c".into(), script.into()],
                cwd: PathBuf::from("."),
                env: Vec::new(),
                pre_launch: None,
            },
        }
    }

    fn setup() -> (Arc<Registry>, Arc<MemorySink>, ProcessSupervisor) {
        let registry = Arc::new(Registry::new());
        let sink = Arc::new(MemorySink::new());
        let supervisor = ProcessSupervisor::new(registry.clone(), sink.clone())
            .with_stop_timeout(Duration::from_millis(500));
        (registry, sink, supervisor)
    }

    async fn wait_terminal(rx: &mut broadcast::Receiver<RunState>) -> RunState {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let state = rx.recv().await.unwrap();
                if matches!(state.phase, Phase::Stopped | Phase::Error) {
                    return state;
                }
            }
        })
        .await
        .expect("process did not finish in time")
    }

    #[test]
    fn test_classifier() {
        let c = OutputClassifier::default();
        assert_eq!(c.classify("2024/01/01 [I] start frpc success"), LogLevel::Success);
        assert_eq!(c.classify("[I] login to server success, get run id"), LogLevel::Success);
        assert_eq!(c.classify("[E] connect to server failed"), LogLevel::Error);
        assert_eq!(c.classify("dial tcp: error"), LogLevel::Warn);
        assert_eq!(c.classify("[W] retrying"), LogLevel::Warn);
        assert_eq!(c.classify("[I] proxy added"), LogLevel::Info);
    }

    #[test]
    fn test_exit_state_mapping() {
        let ok = exit_state("a", ExitStatus::from_raw(0));
        assert_eq!(ok.phase, Phase::Stopped);

        let crashed = exit_state("a", ExitStatus::from_raw(3 << 8));
        assert_eq!(crashed.phase, Phase::Error);
        assert_eq!(crashed.exit_code, Some(3));

        let high = exit_state("a", ExitStatus::from_raw(137 << 8));
        assert!(high.error_message.unwrap().contains("terminated by signal 9"));

        let signaled = exit_state("a", ExitStatus::from_raw(libc::SIGSEGV));
        assert_eq!(signaled.phase, Phase::Error);
        assert!(signaled.error_message.unwrap().contains("SIGSEGV"));
    }

    #[tokio::test]
    async fn test_clean_exit_is_stopped_and_output_classified() {
        let (registry, sink, supervisor) = setup();
        let mut rx = registry.subscribe();
        let reservation = registry.reserve("cfgA").unwrap();

        let state = supervisor.supervise(
            reservation,
            launched("echo 'start frpc success'; echo 'dial failed' >&2; exit 0"),
            "frpc",
            None,
        );
        assert_eq!(state.phase, Phase::Running);
        assert!(state.pid.is_some());
        assert!(state.start_time.is_some());

        let last = wait_terminal(&mut rx).await;
        assert_eq!(last.phase, Phase::Stopped);
        assert!(!registry.is_active("cfgA"));

        let output: Vec<_> = sink
            .entries_for("cfgA")
            .into_iter()
            .filter(|e| e.tag == "frpc")
            .collect();
        assert_eq!(output.len(), 2);
        assert!(output.iter().any(|e| e.level == LogLevel::Success));
        assert!(output.iter().any(|e| e.level == LogLevel::Warn));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let (registry, _sink, supervisor) = setup();
        let mut rx = registry.subscribe();
        let reservation = registry.reserve("bad").unwrap();
        supervisor.supervise(reservation, launched("exit 3"), "frpc", None);

        let last = wait_terminal(&mut rx).await;
        assert_eq!(last.phase, Phase::Error);
        assert_eq!(last.exit_code, Some(3));
        assert_eq!(registry.status("bad"), last);
    }

    #[tokio::test]
    async fn test_stop_terminates_gracefully() {
        let (registry, _sink, supervisor) = setup();
        let reservation = registry.reserve("s").unwrap();
        supervisor.supervise(reservation, launched("exec sleep 30"), "frpc", None);
        assert!(registry.is_active("s"));

        let state = supervisor.stop("s").await.unwrap();
        assert_eq!(state.phase, Phase::Stopped);
        assert!(!registry.is_active("s"));
        assert_eq!(registry.status("s").phase, Phase::Stopped);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let (registry, sink, supervisor) = setup();
        let reservation = registry.reserve("stubborn").unwrap();
        supervisor.supervise(
            reservation,
            launched("trap '' TERM; echo ready; while true; do sleep 1; done"),
            "frpc",
            None,
        );

        // SIGTERM must not arrive before the trap is installed.
        let armed = tokio::time::timeout(Duration::from_secs(5), async {
            while !sink
                .entries_for("stubborn")
                .iter()
                .any(|e| e.tag == "frpc" && e.message == "ready")
            {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(armed.is_ok(), "process never reported ready");

        let started = std::time::Instant::now();
        let state = supervisor.stop("stubborn").await.unwrap();
        assert_eq!(state.phase, Phase::Stopped);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(!registry.is_active("stubborn"));
    }

    #[tokio::test]
    async fn test_stop_unknown_is_not_running() {
        let (registry, _sink, supervisor) = setup();
        let err = supervisor.stop("cfgX").await.unwrap_err();
        assert_eq!(err, ServiceError::NotRunning("cfgX".into()));
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let (registry, sink, supervisor) = setup();
        let supervisor = supervisor.with_max_output_lines(5);
        let mut rx = registry.subscribe();
        let reservation = registry.reserve("chatty").unwrap();
        supervisor.supervise(
            reservation,
            launched("i=0; while [ $i -lt 50 ]; do echo line $i; i=$((i+1)); done"),
            "frpc",
            None,
        );
        wait_terminal(&mut rx).await;

        let entries = sink.entries_for("chatty");
        assert_eq!(entries.iter().filter(|e| e.tag == "frpc").count(), 5);
        assert_eq!(
            entries
                .iter()
                .filter(|e| e.tag == SUPERVISOR_TAG && e.message.contains("output limit"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_permit_released_on_exit() {
        let (registry, _sink, supervisor) = setup();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = semaphore.clone().try_acquire_owned().unwrap();
        let mut rx = registry.subscribe();

        let reservation = registry.reserve("p").unwrap();
        supervisor.supervise(reservation, launched("exit 0"), "frpc", Some(permit));
        wait_terminal(&mut rx).await;

        assert_eq!(semaphore.available_permits(), 1);
    }
}
