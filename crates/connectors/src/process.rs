//! Isolated-process worker
//!
//! Runs the agent as a child process and talks to it with NDJSON over
//! stdin/stdout. The first stdin line configures the session; after that the
//! only thing we ever write is a stop request. Every stdout line is one event:
//!
//! ```text
//! {"type":"message","delta":"Hi"}
//! {"type":"error","message":"model hung up"}
//! {"type":"done"}
//! ```

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voicedock_connector_core::{
    AgentWorker, InferenceConfig, MessageEvent, MessageSink, WorkerError, WorkerFactory,
    WorkerSpec,
};

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Stdin / stdout messages
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage<'a> {
    Configure {
        channel_name: &'a str,
        uid: u32,
        inference: &'a InferenceConfig,
    },
    Stop,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdoutMessage {
    Message { delta: String },
    Error { message: String },
    Done,
}

fn parse_stdout_line(line: &str) -> Option<StdoutMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!(
                component = "process_worker",
                event = "worker.stdout.parse_error",
                error = %e,
                line_preview = %line.chars().take(200).collect::<String>(),
                "Failed to parse worker stdout line"
            );
            None
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, msg: &StdinMessage<'_>) -> Result<(), WorkerError> {
    let mut json =
        serde_json::to_string(msg).map_err(|e| WorkerError::Protocol(e.to_string()))?;
    json.push('\n');
    stdin.write_all(json.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds [`ProcessWorker`]s that all run the same program
#[derive(Debug, Clone)]
pub struct ProcessWorkerFactory {
    program: PathBuf,
    args: Vec<String>,
    stop_grace: Duration,
}

impl ProcessWorkerFactory {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// How long a stopped worker gets to exit before it is killed
    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }
}

impl WorkerFactory for ProcessWorkerFactory {
    fn new_worker(
        &self,
        spec: WorkerSpec,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Box<dyn AgentWorker>, WorkerError> {
        if self.program.as_os_str().is_empty() {
            return Err(WorkerError::Spawn("no worker program configured".into()));
        }
        Ok(Box::new(ProcessWorker {
            program: self.program.clone(),
            args: self.args.clone(),
            stop_grace: self.stop_grace,
            spec,
            sink,
        }))
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct ProcessWorker {
    program: PathBuf,
    args: Vec<String>,
    stop_grace: Duration,
    spec: WorkerSpec,
    sink: Arc<dyn MessageSink>,
}

impl ProcessWorker {
    fn spawn(&self) -> Result<Child, WorkerError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("VOICEDOCK_APP_ID", &self.spec.app_id)
            .env("VOICEDOCK_CHANNEL", &self.spec.channel_name)
            .env("VOICEDOCK_UID", self.spec.uid.to_string())
            .kill_on_drop(true);
        if let Some(cert) = &self.spec.app_cert {
            cmd.env("VOICEDOCK_APP_CERT", cert);
        }

        cmd.spawn().map_err(|e| {
            WorkerError::Spawn(format!(
                "failed to spawn {}: {}",
                self.program.display(),
                e
            ))
        })
    }

    /// Wait for exit, killing the process if it outlives the grace period.
    async fn reap(&self, child: &mut Child) -> Result<ExitStatus, WorkerError> {
        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!(
                    component = "process_worker",
                    event = "worker.stop.kill",
                    channel_name = %self.spec.channel_name,
                    grace_ms = self.stop_grace.as_millis() as u64,
                    "Worker ignored stop request, killing process"
                );
                child.kill().await?;
                Ok(child.wait().await?)
            }
        }
    }
}

#[async_trait]
impl AgentWorker for ProcessWorker {
    async fn run(self: Box<Self>, stop: CancellationToken) -> Result<(), WorkerError> {
        let channel_name = self.spec.channel_name.clone();
        info!(
            component = "process_worker",
            event = "worker.spawn",
            channel_name = %channel_name,
            uid = self.spec.uid,
            program = %self.program.display(),
            "Spawning agent worker process"
        );

        let mut child = self.spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("no stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("no stdout on child".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let channel_name = channel_name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(
                        component = "process_worker",
                        event = "worker.stderr",
                        channel_name = %channel_name,
                        line = %line,
                        "Worker stderr"
                    );
                }
            });
        }

        let configure = StdinMessage::Configure {
            channel_name: &self.spec.channel_name,
            uid: self.spec.uid,
            inference: &self.spec.inference,
        };
        if let Err(e) = write_line(&mut stdin, &configure).await {
            // The exit status below says why.
            warn!(
                component = "process_worker",
                event = "worker.configure.failed",
                channel_name = %channel_name,
                error = %e,
                "Failed to send configuration to worker"
            );
        }

        let mut stdin = Some(stdin);
        let mut lines = BufReader::new(stdout).lines();
        let mut agent_error: Option<String> = None;
        let mut stopped = false;
        let mut finished = false;

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match parse_stdout_line(&line) {
                        Some(StdoutMessage::Message { delta }) => {
                            self.sink.emit(MessageEvent { delta });
                        }
                        Some(StdoutMessage::Error { message }) => {
                            warn!(
                                component = "process_worker",
                                event = "worker.agent_error",
                                channel_name = %channel_name,
                                error = %message,
                                "Worker reported an agent error"
                            );
                            agent_error = Some(message);
                        }
                        Some(StdoutMessage::Done) => {
                            finished = true;
                            break;
                        }
                        None => {}
                    },
                    Ok(None) => {
                        debug!(
                            component = "process_worker",
                            event = "worker.stdout.eof",
                            channel_name = %channel_name,
                            "Worker stdout EOF"
                        );
                        break;
                    }
                    Err(e) => {
                        error!(
                            component = "process_worker",
                            event = "worker.stdout.read_error",
                            channel_name = %channel_name,
                            error = %e,
                            "Error reading worker stdout"
                        );
                        agent_error = Some(format!("read error: {}", e));
                        break;
                    }
                },

                _ = stop.cancelled() => {
                    info!(
                        component = "process_worker",
                        event = "worker.stop.requested",
                        channel_name = %channel_name,
                        "Asking worker to stop"
                    );
                    stopped = true;
                    break;
                }
            }
        }

        if let Some(mut stdin) = stdin.take() {
            if stopped {
                let _ = write_line(&mut stdin, &StdinMessage::Stop).await;
            }
            // Dropping closes the pipe, which is the stop signal of last resort.
            drop(stdin);
        }

        let status = if stopped || finished {
            self.reap(&mut child).await?
        } else {
            tokio::select! {
                status = child.wait() => status?,
                _ = stop.cancelled() => {
                    stopped = true;
                    self.reap(&mut child).await?
                }
            }
        };

        info!(
            component = "process_worker",
            event = "worker.exited",
            channel_name = %channel_name,
            code = ?status.code(),
            stopped,
            "Agent worker process exited"
        );

        if stopped {
            return Ok(());
        }
        if let Some(message) = agent_error {
            return Err(WorkerError::Agent(message));
        }
        if !status.success() {
            return Err(WorkerError::Exited {
                code: status.code(),
            });
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use voicedock_protocol::Voice;

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<MessageEvent>>,
    }

    impl CollectingSink {
        fn deltas(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.delta.clone())
                .collect()
        }
    }

    impl MessageSink for CollectingSink {
        fn emit(&self, event: MessageEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn spec(channel: &str) -> WorkerSpec {
        WorkerSpec {
            app_id: "app-123".into(),
            app_cert: None,
            channel_name: channel.into(),
            uid: 42,
            inference: InferenceConfig::new(None, Voice::Ballad),
        }
    }

    fn script_worker(
        dir: &tempfile::TempDir,
        body: &str,
        sink: Arc<CollectingSink>,
    ) -> Box<dyn AgentWorker> {
        let path = dir.path().join("agent.sh");
        std::fs::write(&path, body).unwrap();
        ProcessWorkerFactory::new("/bin/sh", vec![path.display().to_string()])
            .with_stop_grace(Duration::from_millis(300))
            .new_worker(spec("room1"), sink)
            .unwrap()
    }

    async fn run_with_deadline(
        worker: Box<dyn AgentWorker>,
        stop: CancellationToken,
    ) -> Result<(), WorkerError> {
        tokio::time::timeout(Duration::from_secs(10), worker.run(stop))
            .await
            .expect("worker did not finish in time")
    }

    #[test]
    fn parses_known_stdout_messages_and_skips_garbage() {
        assert_eq!(
            parse_stdout_line(r#"{"type":"message","delta":"Hi"}"#),
            Some(StdoutMessage::Message {
                delta: "Hi".into()
            })
        );
        assert_eq!(
            parse_stdout_line(r#"{"type":"done"}"#),
            Some(StdoutMessage::Done)
        );
        assert_eq!(parse_stdout_line("   "), None);
        assert_eq!(parse_stdout_line("not json"), None);
    }

    #[tokio::test]
    async fn relays_deltas_in_emission_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let worker = script_worker(
            &dir,
            r#"read cfg
echo '{"type":"message","delta":"Hi"}'
echo 'garbage line'
echo '{"type":"message","delta":" there"}'
echo '{"type":"message","delta":"!"}'
echo '{"type":"done"}'
"#,
            sink.clone(),
        );

        run_with_deadline(worker, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sink.deltas(), vec!["Hi", " there", "!"]);
    }

    #[tokio::test]
    async fn passes_identity_through_env_and_configure_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let worker = script_worker(
            &dir,
            r#"read cfg
case "$cfg" in
  *'"type":"configure"'*'"voice":"ballad"'*) echo '{"type":"message","delta":"configured"}' ;;
esac
echo "{\"type\":\"message\",\"delta\":\"$VOICEDOCK_APP_ID/$VOICEDOCK_CHANNEL/$VOICEDOCK_UID\"}"
"#,
            sink.clone(),
        );

        run_with_deadline(worker, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sink.deltas(), vec!["configured", "app-123/room1/42"]);
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_worker_failure() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let worker = script_worker(&dir, "read cfg\nexit 3\n", sink);

        let err = run_with_deadline(worker, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Exited { code: Some(3) }));
    }

    #[tokio::test]
    async fn reported_agent_error_wins_over_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let worker = script_worker(
            &dir,
            "read cfg\necho '{\"type\":\"error\",\"message\":\"model hung up\"}'\n",
            sink,
        );

        let err = run_with_deadline(worker, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Agent(ref m) if m == "model hung up"));
    }

    #[tokio::test]
    async fn stop_request_is_honored_by_cooperative_worker() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let worker = script_worker(
            &dir,
            r#"read cfg
echo '{"type":"message","delta":"ready"}'
while read line; do
  case "$line" in *'"stop"'*) exit 0 ;; esac
done
"#,
            sink.clone(),
        );

        let stop = CancellationToken::new();
        let handle = tokio::spawn(run_with_deadline(worker, stop.clone()));
        while sink.deltas().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.cancel();

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stubborn_worker_is_killed_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let worker = script_worker(&dir, "read cfg\nexec sleep 30\n", sink);

        let stop = CancellationToken::new();
        stop.cancel();
        run_with_deadline(worker, stop).await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let sink = Arc::new(CollectingSink::default());
        let worker = ProcessWorkerFactory::new("/nonexistent/voicedock-agent", vec![])
            .new_worker(spec("room1"), sink)
            .unwrap();

        let err = run_with_deadline(worker, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Spawn(_)));
    }

    #[test]
    fn empty_program_is_rejected_by_factory() {
        let sink = Arc::new(CollectingSink::default());
        let result = ProcessWorkerFactory::new("", vec![]).new_worker(spec("room1"), sink);
        assert!(matches!(result, Err(WorkerError::Spawn(_))));
    }
}
