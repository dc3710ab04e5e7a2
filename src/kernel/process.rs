//! 解释器进程句柄
//!
//! 一个句柄独占一个 Python 子进程及其 stdin/stdout 通道。stdout 由读取任务逐行转发到 channel，
//! 等待结果时只 recv（可安全取消）；通道关闭即视为进程已死，在下次使用时才被发现。
//! 超时只结束调用方的等待，不杀进程；迟到的结果按 id 丢弃。
//! 句柄被 drop 而未 stop 时强制 kill，保证任何退出路径上子进程都只被回收一次。

use std::collections::VecDeque;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::environment::PythonEnvironment;
use super::protocol::{DriverMessage, DriverOp, DriverRequest, RawOutcome};
use crate::core::KernelError;

const DRIVER_SOURCE: &str = include_str!("driver.py");
const STDERR_TAIL_LINES: usize = 20;

/// 握手时驱动脚本报告的解释器信息
#[derive(Debug, Clone, Serialize)]
pub struct InterpreterInfo {
    pub python_version: String,
    pub executable: String,
    pub pid: u32,
}

pub struct InterpreterProcess {
    child: Child,
    stdin: ChildStdin,
    lines: mpsc::UnboundedReceiver<String>,
    reader: JoinHandle<()>,
    stderr_pump: JoinHandle<()>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    info: InterpreterInfo,
    environment: PythonEnvironment,
    execution_count: u64,
    alive: bool,
    stopped: bool,
}

impl InterpreterProcess {
    /// 启动解释器并等待 ready 握手
    pub async fn start(
        working_dir: &Path,
        environment: &PythonEnvironment,
        startup_timeout: Duration,
    ) -> Result<Self, KernelError> {
        if !environment.is_valid() {
            return Err(KernelError::ProcessStartFailed(format!(
                "python environment path invalid: {}",
                environment.interpreter.display()
            )));
        }
        if !working_dir.is_dir() {
            return Err(KernelError::ProcessStartFailed(format!(
                "working directory does not exist: {}",
                working_dir.display()
            )));
        }

        let mut cmd = Command::new(&environment.interpreter);
        cmd.arg("-u")
            .arg("-c")
            .arg(DRIVER_SOURCE)
            .current_dir(working_dir)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let (Some(venv), Some(bin)) = (&environment.venv, environment.bin_dir()) {
            let path = std::env::var_os("PATH").unwrap_or_default();
            let joined = std::env::join_paths(
                std::iter::once(bin).chain(std::env::split_paths(&path)),
            )
            .map_err(|e| KernelError::ProcessStartFailed(e.to_string()))?;
            cmd.env("VIRTUAL_ENV", venv).env("PATH", joined);
        }

        let mut child = cmd.spawn().map_err(|e| {
            KernelError::ProcessStartFailed(format!(
                "{}: {}",
                environment.interpreter.display(),
                e
            ))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| KernelError::ProcessStartFailed("no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KernelError::ProcessStartFailed("no stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| KernelError::ProcessStartFailed("no stderr".to_string()))?;

        let (tx, mut lines) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut stdout = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = stdout.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = Arc::clone(&stderr_tail);
        let stderr_pump = tokio::spawn(async move {
            let mut stderr = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = stderr.next_line().await {
                tracing::debug!(target: "kernel::stderr", "{}", line);
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        });

        let handshake = tokio::time::timeout(startup_timeout, async {
            while let Some(line) = lines.recv().await {
                match DriverMessage::parse(&line) {
                    Ok(DriverMessage::Ready {
                        python_version,
                        executable,
                        pid,
                    }) => {
                        return Some(InterpreterInfo {
                            python_version,
                            executable,
                            pid,
                        })
                    }
                    _ => tracing::debug!(line = %line, "ignored line before handshake"),
                }
            }
            None
        })
        .await;

        let info = match handshake {
            Ok(Some(info)) => info,
            outcome => {
                let reason = match outcome {
                    Err(_) => format!("no handshake within {:?}", startup_timeout),
                    _ => "process exited before handshake".to_string(),
                };
                let _ = child.start_kill();
                let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok);
                // 给 stderr 读取任务一点时间把最后几行收完
                tokio::time::sleep(Duration::from_millis(50)).await;
                reader.abort();
                stderr_pump.abort();
                let tail = tail_text(&stderr_tail);
                return Err(KernelError::ProcessStartFailed(format!(
                    "{reason} (exit: {}){}",
                    status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string()),
                    if tail.is_empty() {
                        String::new()
                    } else {
                        format!("\nstderr:\n{tail}")
                    }
                )));
            }
        };

        tracing::info!(
            pid = info.pid,
            python = %info.python_version,
            interpreter = %environment.interpreter.display(),
            working_dir = %working_dir.display(),
            "interpreter started"
        );

        Ok(Self {
            child,
            stdin,
            lines,
            reader,
            stderr_pump,
            stderr_tail,
            info,
            environment: environment.clone(),
            execution_count: 0,
            alive: true,
            stopped: false,
        })
    }

    pub fn info(&self) -> &InterpreterInfo {
        &self.info
    }

    pub fn environment(&self) -> &PythonEnvironment {
        &self.environment
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    /// 轻量存活探测：通道未关闭且进程未退出
    pub fn is_alive(&mut self) -> bool {
        if self.alive && !matches!(self.child.try_wait(), Ok(None)) {
            self.alive = false;
        }
        self.alive
    }

    /// 发送代码并等待结果；超时返回 ExecutionTimeout，进程保持运行
    pub async fn run(&mut self, code: &str, timeout: Duration) -> Result<RawOutcome, KernelError> {
        self.request(DriverRequest::new(0, DriverOp::Execute, code), timeout).await
    }

    /// 列出解释器全局命名空间
    pub async fn inspect(&mut self, timeout: Duration) -> Result<RawOutcome, KernelError> {
        self.request(DriverRequest::new(0, DriverOp::Inspect, ""), timeout).await
    }

    /// 描述单个变量；按名字查命名空间，不求值
    pub async fn describe(&mut self, name: &str, detailed: bool, timeout: Duration) -> Result<RawOutcome, KernelError> {
        let req = DriverRequest::new(0, DriverOp::Describe, name).with_detail(detailed);
        self.request(req, timeout).await
    }

    /// 最近一次失败执行的异常、traceback 与出错帧的局部变量
    pub async fn last_error(&mut self, timeout: Duration) -> Result<RawOutcome, KernelError> {
        self.request(DriverRequest::new(0, DriverOp::LastError, ""), timeout).await
    }

    /// 解释器能看到的已安装发行包（`name==version`）
    pub async fn packages(&mut self, timeout: Duration) -> Result<RawOutcome, KernelError> {
        self.request(DriverRequest::new(0, DriverOp::Packages, ""), timeout).await
    }

    async fn request(&mut self, mut req: DriverRequest<'_>, timeout: Duration) -> Result<RawOutcome, KernelError> {
        if !self.is_alive() {
            return Err(self.died().await);
        }
        self.execution_count += 1;
        let id = self.execution_count;
        req.id = id;
        let line = req
            .to_line()
            .map_err(|e| KernelError::Channel(e.to_string()))?;

        if let Err(e) = self.write_line(&line).await {
            tracing::warn!(error = %e, "write to interpreter failed");
            return Err(self.died().await);
        }

        match tokio::time::timeout(timeout, self.await_result(id)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(id, ?timeout, "execution timed out, interpreter left running");
                Err(KernelError::ExecutionTimeout(timeout))
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await
    }

    async fn await_result(&mut self, id: u64) -> Result<RawOutcome, KernelError> {
        loop {
            let Some(line) = self.lines.recv().await else {
                return Err(self.died().await);
            };
            match DriverMessage::parse(&line) {
                Ok(DriverMessage::Result(outcome)) if outcome.id == id => return Ok(outcome),
                Ok(DriverMessage::Result(stale)) => {
                    tracing::debug!(stale = stale.id, expected = id, "discarding late result");
                }
                Ok(DriverMessage::ProtocolError { message }) => {
                    return Err(KernelError::Channel(message));
                }
                Ok(DriverMessage::Ready { .. }) => {}
                Err(e) => {
                    // 无法解析的行可能正是本次结果，继续等只会变成超时
                    let preview: String = line.chars().take(200).collect();
                    tracing::warn!(error = %e, line = %preview, "unparseable line from interpreter");
                    return Err(KernelError::Channel(format!("unparseable driver output: {e}")));
                }
            }
        }
    }

    async fn died(&mut self) -> KernelError {
        self.alive = false;
        let status = self.exit_status().await;
        let tail = tail_text(&self.stderr_tail);
        if !tail.is_empty() {
            tracing::warn!(pid = self.info.pid, stderr = %tail, "interpreter died");
        }
        KernelError::ProcessDied { status }
    }

    async fn exit_status(&mut self) -> Option<ExitStatus> {
        tokio::time::timeout(Duration::from_millis(200), self.child.wait())
            .await
            .ok()
            .and_then(Result::ok)
    }

    /// 终止进程：先请求驱动退出，grace 内未退出则 kill。多次调用只生效一次
    pub async fn stop(&mut self, grace: Duration) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.alive = false;

        if let Ok(line) = DriverRequest::new(0, DriverOp::Shutdown, "").to_line() {
            let _ = self.write_line(&line).await;
        }
        let exited = tokio::time::timeout(grace, self.child.wait()).await;
        if !matches!(exited, Ok(Ok(_))) {
            if let Err(e) = self.child.kill().await {
                tracing::warn!(pid = self.info.pid, error = %e, "kill interpreter failed");
            }
        }
        self.reader.abort();
        self.stderr_pump.abort();
        tracing::info!(pid = self.info.pid, "interpreter stopped");
    }
}

impl Drop for InterpreterProcess {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.child.start_kill();
            self.reader.abort();
            self.stderr_pump.abort();
        }
    }
}

fn tail_text(tail: &Mutex<VecDeque<String>>) -> String {
    tail.lock()
        .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
        .unwrap_or_default()
}
