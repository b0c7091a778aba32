//! Process supervision: runs a strategy's `(executable, args, cwd,
//! env_action)` tuple under a time budget, streaming stdout/stderr as
//! events and respecting cancellation (spec.md §4.4 step 6).

use crate::state::TaskOutput;
use crate::strategy::{EnvAction, StrategyConfig};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// In-order process lifecycle events (spec.md §5: `Started → (StdOut|StdErr
/// in arrival order) → Exited` totally ordered within one task).
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    Started,
    StdOut(String),
    StdErr(String),
    Exited(i32),
}

pub type ProgressSink = mpsc::UnboundedSender<ProcessEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

pub struct ProcessOutcome {
    pub status: ProcessStatus,
    pub exit_code: i32,
    pub output: TaskOutput,
    pub error_message: Option<String>,
}

pub struct ProcessRequest {
    pub config: StrategyConfig,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub max_size_bytes: usize,
    pub capture_stderr: bool,
}

/// Runs one process to completion (or until cancelled/timed out), enforcing
/// the output size cap with a `[truncated]` sentinel (spec.md §4.4 step 6).
pub async fn run_process(
    req: ProcessRequest,
    cancel: CancellationToken,
    sink: Option<&ProgressSink>,
) -> ProcessOutcome {
    let mut command = Command::new(&req.config.executable);
    command.args(&req.config.args);
    if let Some(cwd) = &req.config.cwd {
        command.current_dir(cwd);
    }
    if let EnvAction::SetProcessEnv(env) = &req.config.env_action {
        command.env_clear();
        command.envs(env);
    }
    command.stdin(if req.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ProcessOutcome {
                status: ProcessStatus::Failed,
                exit_code: -1,
                output: TaskOutput::empty(),
                error_message: Some(format!("failed to spawn process: {e}")),
            }
        }
    };

    if let Some(sink) = sink {
        let _ = sink.send(ProcessEvent::Started);
    }

    if let Some(bytes) = req.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&bytes).await;
            drop(stdin);
        }
    }

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let (tx, mut rx) = mpsc::unbounded_channel::<(bool, String)>();

    let tx_out = tx.clone();
    let out_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx_out.send((false, line)).is_err() {
                break;
            }
        }
    });
    let tx_err = tx.clone();
    let err_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx_err.send((true, line)).is_err() {
                break;
            }
        }
    });
    drop(tx);

    let mut stdout_buf = String::new();
    let mut stderr_buf = String::new();
    let mut truncated = false;
    let mut captured_bytes: usize = 0;

    let sleep = tokio::time::sleep(req.timeout);
    tokio::pin!(sleep);

    let status;
    let mut error_message = None;
    let mut exit_code = -1;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                status = ProcessStatus::Cancelled;
                error_message = Some("task cancelled".to_string());
                break;
            }
            _ = &mut sleep => {
                let _ = child.start_kill();
                status = ProcessStatus::TimedOut;
                error_message = Some(format!("task timed out after {:?}", req.timeout));
                break;
            }
            line = rx.recv() => {
                match line {
                    Some((is_stderr, text)) => {
                        if let Some(sink) = sink {
                            let event = if is_stderr {
                                ProcessEvent::StdErr(text.clone())
                            } else {
                                ProcessEvent::StdOut(text.clone())
                            };
                            let _ = sink.send(event);
                        }
                        if !truncated {
                            let line_len = text.len() + 1;
                            if captured_bytes + line_len > req.max_size_bytes {
                                truncated = true;
                                if is_stderr {
                                    stderr_buf.push_str("[truncated]");
                                } else {
                                    stdout_buf.push_str("[truncated]");
                                }
                            } else {
                                captured_bytes += line_len;
                                if is_stderr {
                                    if req.capture_stderr {
                                        stderr_buf.push_str(&text);
                                        stderr_buf.push('\n');
                                    }
                                } else {
                                    stdout_buf.push_str(&text);
                                    stdout_buf.push('\n');
                                }
                            }
                        }
                    }
                    None => {
                        let wait_result = child.wait().await;
                        exit_code = wait_result
                            .ok()
                            .and_then(|s| s.code())
                            .unwrap_or(-1);
                        status = if exit_code == 0 {
                            ProcessStatus::Succeeded
                        } else {
                            ProcessStatus::Failed
                        };
                        if exit_code != 0 {
                            error_message = Some(format!("process exited with code {exit_code}"));
                        }
                        break;
                    }
                }
            }
        }
    }

    out_task.abort();
    err_task.abort();

    if let Some(sink) = sink {
        let _ = sink.send(ProcessEvent::Exited(exit_code));
    }

    ProcessOutcome {
        status,
        exit_code,
        output: TaskOutput {
            stdout: stdout_buf,
            stderr: stderr_buf,
            bytes: None,
            file_path: None,
            truncated,
        },
        error_message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn echo_config(cmd: &str) -> StrategyConfig {
        StrategyConfig {
            executable: "bash".to_string(),
            args: vec!["-c".to_string(), cmd.to_string()],
            cwd: None,
            env_action: EnvAction::SetProcessEnv(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn successful_process_captures_stdout() {
        let outcome = run_process(
            ProcessRequest {
                config: echo_config("echo hello"),
                stdin: None,
                timeout: Duration::from_secs(5),
                max_size_bytes: 1024,
                capture_stderr: true,
            },
            CancellationToken::new(),
            None,
        )
        .await;
        assert_eq!(outcome.status, ProcessStatus::Succeeded);
        assert_eq!(outcome.exit_code, 0);
        assert!(outcome.output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let outcome = run_process(
            ProcessRequest {
                config: echo_config("exit 7"),
                stdin: None,
                timeout: Duration::from_secs(5),
                max_size_bytes: 1024,
                capture_stderr: true,
            },
            CancellationToken::new(),
            None,
        )
        .await;
        assert_eq!(outcome.status, ProcessStatus::Failed);
        assert_eq!(outcome.exit_code, 7);
    }

    #[tokio::test]
    async fn timeout_preserves_partial_output() {
        let outcome = run_process(
            ProcessRequest {
                config: echo_config("echo partial; sleep 10"),
                stdin: None,
                timeout: Duration::from_millis(200),
                max_size_bytes: 1024,
                capture_stderr: true,
            },
            CancellationToken::new(),
            None,
        )
        .await;
        assert_eq!(outcome.status, ProcessStatus::TimedOut);
        assert_eq!(outcome.exit_code, -1);
        assert!(outcome.output.stdout.contains("partial"));
        assert!(outcome.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_stops_the_process() {
        let token = CancellationToken::new();
        let child_token = token.clone();
        let handle = tokio::spawn(async move {
            run_process(
                ProcessRequest {
                    config: echo_config("sleep 10"),
                    stdin: None,
                    timeout: Duration::from_secs(30),
                    max_size_bytes: 1024,
                    capture_stderr: true,
                },
                child_token,
                None,
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, ProcessStatus::Cancelled);
    }

    #[tokio::test]
    async fn output_is_truncated_past_max_size() {
        let outcome = run_process(
            ProcessRequest {
                config: echo_config("echo 0123456789"),
                stdin: None,
                timeout: Duration::from_secs(5),
                max_size_bytes: 4,
                capture_stderr: true,
            },
            CancellationToken::new(),
            None,
        )
        .await;
        assert!(outcome.output.truncated);
        assert!(outcome.output.stdout.ends_with("[truncated]"));
    }
}
