//! Connectors running as child processes
//!
//! Each verb is one process invocation. For a container runtime the command is
//!
//! ```text
//! docker run --interactive --rm [--network=<net>] <image> <verb>
//! ```
//!
//! while any other program is run as `<program> <image> <verb>`, which lets a
//! local executable or script stand in for an image. The JSON request is written
//! to stdin; newline-delimited JSON messages are read from stdout. Stderr is
//! forwarded to the log, and its tail is attached to failures.

use super::{Connector, ConnectorFactory, ReadStream};
use crate::protocol::{
    ConnectorError, ConnectorMessage, ConnectorRequest, DiscoverResponse, LogMessage, ReadMessage,
    ReadRequest, SpecResponse, ValidateRequest, ValidateResponse,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Lines of stderr kept for error reports
const STDERR_TAIL_LINES: usize = 20;

/// Longest excerpt of connector output quoted in an error
const EXCERPT_LEN: usize = 200;

/// How connector processes are started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessLauncher {
    pub program: String,
    /// `--network` passed to container runtimes
    pub docker_network: Option<String>,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            docker_network: None,
        }
    }
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            docker_network: None,
        }
    }

    pub fn with_network(mut self, network: Option<String>) -> Self {
        self.docker_network = network;
        self
    }

    fn is_container_runtime(&self) -> bool {
        matches!(
            Path::new(&self.program).file_stem().and_then(|s| s.to_str()),
            Some("docker") | Some("podman")
        )
    }

    /// Arguments following the program for one invocation
    pub fn args(&self, image: &str, verb: &str) -> Vec<String> {
        let mut args = Vec::new();
        if self.is_container_runtime() {
            args.extend(["run", "--interactive", "--rm"].map(String::from));
            if let Some(network) = &self.docker_network {
                args.push(format!("--network={}", network));
            }
        }
        args.push(image.to_string());
        args.push(verb.to_string());
        args
    }

    fn command(&self, image: &str, verb: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(image, verb))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Creates a [`ProcessConnector`] per image
#[derive(Debug, Clone, Default)]
pub struct ProcessConnectorFactory {
    launcher: ProcessLauncher,
}

impl ProcessConnectorFactory {
    pub fn new(launcher: ProcessLauncher) -> Self {
        Self { launcher }
    }
}

impl ConnectorFactory for ProcessConnectorFactory {
    fn create(&self, image: &str) -> Arc<dyn Connector> {
        Arc::new(ProcessConnector::new(image, self.launcher.clone()))
    }
}

/// Connector image invoked as a child process
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    image: String,
    launcher: ProcessLauncher,
}

impl ProcessConnector {
    pub fn new(image: impl Into<String>, launcher: ProcessLauncher) -> Self {
        Self {
            image: image.into(),
            launcher,
        }
    }

    async fn launch(&self, request: &ConnectorRequest) -> Result<Invocation, ConnectorError> {
        let verb = request.verb();
        let mut payload = serde_json::to_vec(request)
            .map_err(|e| ConnectorError::failed(format!("failed to encode {} request: {}", verb, e)))?;
        payload.push(b'\n');

        debug!(image = %self.image, verb = verb, program = %self.launcher.program, "Launching connector");
        let mut child = self
            .launcher
            .command(&self.image, verb)
            .spawn()
            .map_err(|source| ConnectorError::Launch {
                program: self.launcher.program.clone(),
                source,
            })?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ConnectorError::failed("connector stdio was not captured"));
        };

        let image = self.image.clone();
        tokio::spawn(async move {
            // Connectors that ignore their input may exit before reading it
            if let Err(e) = stdin.write_all(&payload).await {
                debug!(image = %image, error = %e, "Connector did not accept its request");
            }
        });

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = {
            let tail = Arc::clone(&tail);
            let image = self.image.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(connector = %image, "{}", line);
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            })
        };

        Ok(Invocation {
            image: self.image.clone(),
            verb,
            child,
            stdout: BufReader::new(stdout).lines(),
            stderr_tail: tail,
            stderr_task: Some(stderr_task),
        })
    }

    /// Run a verb that answers with exactly one message of kind `expected`
    async fn call(
        &self,
        request: ConnectorRequest,
        expected: &'static str,
    ) -> Result<ConnectorMessage, ConnectorError> {
        let mut invocation = self.launch(&request).await?;
        let mut response = None;

        while let Some(message) = invocation.next_message().await? {
            if message.kind() != expected {
                return Err(ConnectorError::protocol(format!(
                    "{} {} emitted a '{}' message, expected '{}'",
                    self.image,
                    request.verb(),
                    message.kind(),
                    expected
                )));
            }
            if response.replace(message).is_some() {
                return Err(ConnectorError::protocol(format!(
                    "{} {} emitted more than one '{}' message",
                    self.image,
                    request.verb(),
                    expected
                )));
            }
        }

        invocation.finish().await?;
        response.ok_or_else(|| {
            ConnectorError::protocol(format!(
                "{} {} exited without a '{}' message",
                self.image,
                request.verb(),
                expected
            ))
        })
    }
}

fn unexpected(image: &str, verb: &str, message: &ConnectorMessage) -> ConnectorError {
    ConnectorError::protocol(format!(
        "{} {} emitted an unexpected '{}' message",
        image,
        verb,
        message.kind()
    ))
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn spec(&self) -> Result<SpecResponse, ConnectorError> {
        match self.call(ConnectorRequest::Spec {}, "spec").await? {
            ConnectorMessage::Spec(spec) => Ok(spec),
            other => Err(unexpected(&self.image, "spec", &other)),
        }
    }

    async fn discover(&self, config: &Value) -> Result<DiscoverResponse, ConnectorError> {
        let request = ConnectorRequest::Discover {
            config: config.clone(),
        };
        match self.call(request, "discovered").await? {
            ConnectorMessage::Discovered(catalog) => Ok(catalog),
            other => Err(unexpected(&self.image, "discover", &other)),
        }
    }

    async fn validate(&self, request: &ValidateRequest) -> Result<ValidateResponse, ConnectorError> {
        let request = ConnectorRequest::Validate(request.clone());
        match self.call(request, "validated").await? {
            ConnectorMessage::Validated(response) => Ok(response),
            other => Err(unexpected(&self.image, "validate", &other)),
        }
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadStream, ConnectorError> {
        let invocation = self.launch(&ConnectorRequest::Read(request)).await?;

        let stream = futures::stream::unfold(Some(invocation), |state| async move {
            let mut invocation = state?;
            match invocation.next_message().await {
                Ok(Some(ConnectorMessage::Record(record))) => {
                    Some((Ok(ReadMessage::Record(record)), Some(invocation)))
                },
                Ok(Some(ConnectorMessage::Checkpoint(checkpoint))) => {
                    Some((Ok(ReadMessage::Checkpoint(checkpoint)), Some(invocation)))
                },
                Ok(Some(other)) => Some((
                    Err(unexpected(&invocation.image, "read", &other)),
                    None,
                )),
                Ok(None) => match invocation.finish().await {
                    Ok(()) => None,
                    Err(e) => Some((Err(e), None)),
                },
                Err(e) => Some((Err(e), None)),
            }
        });

        Ok(stream.boxed())
    }
}

/// One running connector process
struct Invocation {
    image: String,
    verb: &'static str,
    child: Child,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl Invocation {
    /// Next protocol message, or `None` at end of output
    ///
    /// Log messages are forwarded and skipped; an `error` message becomes an `Err`.
    async fn next_message(&mut self) -> Result<Option<ConnectorMessage>, ConnectorError> {
        loop {
            let line = self.stdout.next_line().await.map_err(|e| {
                ConnectorError::transient(format!("failed to read output of {}: {}", self.image, e))
            })?;
            let Some(line) = line else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Ok(value) = serde_json::from_str::<Value>(line) else {
                info!(connector = %self.image, "{}", line);
                continue;
            };
            let message: ConnectorMessage = serde_json::from_value(value).map_err(|e| {
                ConnectorError::protocol(format!(
                    "{} {} emitted an unrecognized message {}: {}",
                    self.image,
                    self.verb,
                    excerpt(line),
                    e
                ))
            })?;

            match message {
                ConnectorMessage::Log(log) => forward_log(&self.image, &log),
                ConnectorMessage::Error(err) => return Err(err.into()),
                other => return Ok(Some(other)),
            }
        }
    }

    /// Wait for the process to exit and check its status
    async fn finish(mut self) -> Result<(), ConnectorError> {
        let status = self.child.wait().await.map_err(|e| {
            ConnectorError::failed(format!("failed to wait for {}: {}", self.image, e))
        })?;
        if let Some(task) = self.stderr_task.take() {
            // Stderr closes with the process; a join error only loses the tail
            let _ = task.await;
        }

        if status.success() {
            return Ok(());
        }

        let tail = self
            .stderr_tail
            .lock()
            .map(|t| t.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();
        Err(ConnectorError::failed(format!(
            "{} {} exited with {}{}",
            self.image,
            self.verb,
            status,
            if tail.is_empty() { String::new() } else { format!(":\n{}", tail) }
        )))
    }
}

fn excerpt(line: &str) -> String {
    if line.chars().count() <= EXCERPT_LEN {
        line.to_string()
    } else {
        let cut: String = line.chars().take(EXCERPT_LEN).collect();
        format!("{}...", cut)
    }
}

/// Re-emit a connector log message at its own level
fn forward_log(image: &str, log: &LogMessage) {
    match log.level.to_ascii_lowercase().as_str() {
        "trace" => trace!(connector = %image, "{}", log.message),
        "debug" => debug!(connector = %image, "{}", log.message),
        "warn" | "warning" => warn!(connector = %image, "{}", log.message),
        "error" | "fatal" => error!(connector = %image, "{}", log.message),
        _ => info!(connector = %image, "{}", log.message),
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::{BindingRequest, SyncMode};
    use serde_json::json;
    use tempfile::TempDir;

    /// Write a shell script connector and return a connector running it through `sh`
    fn script_connector(dir: &TempDir, body: &str) -> ProcessConnector {
        let path = dir.path().join("connector.sh");
        std::fs::write(&path, body).unwrap();
        ProcessConnector::new(path.display().to_string(), ProcessLauncher::new("sh"))
    }

    fn read_request() -> ReadRequest {
        ReadRequest {
            capture: "acmeCo/source-x".to_string(),
            config: json!({}),
            binding: BindingRequest {
                stream: "clients".to_string(),
                namespace: None,
                sync_mode: SyncMode::Incremental,
                resource: json!({"stream": "clients"}),
                target: "acmeCo/clients".to_string(),
            },
            state: None,
            start_cursor: None,
        }
    }

    #[test]
    fn test_docker_arguments() {
        let launcher = ProcessLauncher::default().with_network(Some("flow-test".to_string()));
        assert_eq!(
            launcher.args("ghcr.io/estuary/source-airtable:dev", "spec"),
            vec![
                "run",
                "--interactive",
                "--rm",
                "--network=flow-test",
                "ghcr.io/estuary/source-airtable:dev",
                "spec"
            ]
        );

        let local = ProcessLauncher::new("/usr/bin/python3");
        assert_eq!(local.args("connector.py", "read"), vec!["connector.py", "read"]);
    }

    #[tokio::test]
    async fn test_spec_skips_noise_and_logs() {
        let dir = TempDir::new().unwrap();
        let connector = script_connector(
            &dir,
            r#"
echo "starting up"
echo '{"log": {"level": "debug", "message": "loading"}}'
echo '{"spec": {"config_schema": {"type": "object"}}}'
"#,
        );
        let spec = connector.spec().await.unwrap();
        assert_eq!(spec.config_schema, json!({"type": "object"}));
    }

    #[tokio::test]
    async fn test_wrong_message_kind_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let connector = script_connector(&dir, r#"echo '{"validated": {"status": "ok"}}'"#);
        let err = connector.spec().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Protocol(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_unknown_json_message_is_protocol_error() {
        let dir = TempDir::new().unwrap();
        let connector = script_connector(&dir, r#"echo '{"trace": {"spans": []}}'"#);
        let err = connector.spec().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Protocol(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let dir = TempDir::new().unwrap();
        let connector = script_connector(&dir, "echo 'invalid api key' >&2\nexit 3\n");
        let err = connector.spec().await.unwrap_err();
        match err {
            ConnectorError::Failed(message) => assert!(message.contains("invalid api key")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retryable_error_message() {
        let dir = TempDir::new().unwrap();
        let connector = script_connector(
            &dir,
            r#"echo '{"error": {"message": "rate limited", "retryable": true}}'"#,
        );
        assert!(connector.discover(&json!({})).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_read_stream() {
        let dir = TempDir::new().unwrap();
        let connector = script_connector(
            &dir,
            r#"
cat > /dev/null
echo '{"record": {"stream": "clients", "data": {"id": 1}}}'
echo '{"record": {"stream": "clients", "data": {"id": 2}}}'
echo '{"checkpoint": {"state": {"page": 1}, "cursor": 2}}'
"#,
        );

        let messages: Vec<_> = connector.read(read_request()).await.unwrap().collect().await;
        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], Ok(ReadMessage::Record(_))));
        assert!(matches!(messages[2], Ok(ReadMessage::Checkpoint(_))));
    }

    #[tokio::test]
    async fn test_read_failure_after_records() {
        let dir = TempDir::new().unwrap();
        let connector = script_connector(
            &dir,
            r#"
echo '{"record": {"stream": "clients", "data": {"id": 1}}}'
exit 1
"#,
        );

        let messages: Vec<_> = connector.read(read_request()).await.unwrap().collect().await;
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[1], Err(ConnectorError::Failed(_))));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let connector = ProcessConnector::new(
            "source-x",
            ProcessLauncher::new("/nonexistent/capflow-connector-runtime"),
        );
        assert!(matches!(
            connector.spec().await.unwrap_err(),
            ConnectorError::Launch { .. }
        ));
    }
}
