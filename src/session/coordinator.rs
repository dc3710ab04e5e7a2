//! 执行协调器
//!
//! 同一会话的请求在会话锁上排队、严格按到达顺序逐个执行；不同会话互不阻塞。
//! 用户代码的失败（异常、超时、进程死亡）一律装进 [`ExecutionResult`] 返回，
//! 只有会话 ID 非法或解释器根本起不来才返回 `Err`。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};

use super::registry::SessionRegistry;
use crate::core::KernelError;
use crate::kernel::{cap_displays, cap_lines, cap_output, RawError, RawOutcome, RawStatus};

/// 解释器进程在执行途中退出时填入的异常类型名
pub const KERNEL_DIED: &str = "KernelDiedError";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub stdout: String,
    pub stderr: String,
    /// 末尾表达式的 repr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub displays: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub traceback: Vec<String>,
    pub execution_count: u64,
    pub duration_ms: u64,
    /// 任一文本字段被截断
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }

    fn empty(outcome: ExecutionOutcome, execution_count: u64, elapsed: Duration) -> Self {
        Self {
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            value: None,
            displays: Vec::new(),
            exception_type: None,
            exception_message: None,
            traceback: Vec::new(),
            execution_count,
            duration_ms: elapsed.as_millis() as u64,
            truncated: false,
        }
    }

    fn from_raw(raw: RawOutcome, max_bytes: usize, elapsed: Duration) -> Self {
        let (stdout, cut_out) = cap_output(raw.stdout, max_bytes);
        let (stderr, cut_err) = cap_output(raw.stderr, max_bytes);
        let (value, cut_value) = match raw.value {
            Some(v) => {
                let (v, cut) = cap_output(v, max_bytes);
                (Some(v), cut)
            }
            None => (None, false),
        };
        let (exception_message, cut_message) = match raw.evalue {
            Some(m) => {
                let (m, cut) = cap_output(m, max_bytes);
                (Some(m), cut)
            }
            None => (None, false),
        };
        let (traceback, cut_traceback) = cap_lines(raw.traceback, max_bytes);
        let (displays, cut_displays) = cap_displays(raw.displays, max_bytes);
        let outcome = match raw.status {
            RawStatus::Ok => ExecutionOutcome::Success,
            RawStatus::Error => ExecutionOutcome::Error,
        };
        Self {
            outcome,
            stdout,
            stderr,
            value,
            displays,
            exception_type: raw.ename,
            exception_message,
            traceback,
            execution_count: raw.id,
            duration_ms: elapsed.as_millis() as u64,
            truncated: cut_out || cut_err || cut_value || cut_message || cut_traceback || cut_displays,
        }
    }

    /// 一行摘要：`NameError: name 'x' is not defined`
    pub fn error_summary(&self) -> Option<String> {
        match self.outcome {
            ExecutionOutcome::Success => None,
            ExecutionOutcome::Timeout => Some(format!("timed out after {} ms", self.duration_ms)),
            ExecutionOutcome::Error => Some(format!(
                "{}: {}",
                self.exception_type.as_deref().unwrap_or("Error"),
                self.exception_message.as_deref().unwrap_or_default()
            )),
        }
    }
}

/// 会话最近一次失败的执行，文本按输出上限截断
#[derive(Debug, Clone, Serialize)]
pub struct LastError {
    pub exception_type: String,
    pub exception_message: String,
    pub traceback: Vec<String>,
    /// 出错帧的局部变量：`{name: {type, value}}`
    pub locals: Map<String, Value>,
    pub truncated: bool,
}

impl LastError {
    fn from_raw(raw: RawError, max_bytes: usize) -> Self {
        let (exception_message, cut_message) = cap_output(raw.evalue, max_bytes);
        let (traceback, cut_traceback) = cap_lines(raw.traceback, max_bytes);
        Self {
            exception_type: raw.ename,
            exception_message,
            traceback,
            locals: raw.locals,
            truncated: cut_message || cut_traceback,
        }
    }
}

/// 一次逻辑执行请求
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub session_id: String,
    pub code: String,
    /// 覆盖默认超时
    pub timeout: Option<Duration>,
    /// 调用方此前已用掉的尝试次数（改代码后重试时带上，与恢复循环共用预算）
    pub prior_attempts: u32,
    /// 覆盖恢复策略的 verbose：成功时是否保留完整尝试历史
    pub verbose: Option<bool>,
}

impl ExecutionRequest {
    pub fn new(session_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            code: code.into(),
            timeout: None,
            prior_attempts: 0,
            verbose: None,
        }
    }

    pub fn with_verbose(mut self, verbose: Option<bool>) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_prior_attempts(mut self, prior_attempts: u32) -> Self {
        self.prior_attempts = prior_attempts;
        self
    }
}

pub struct ExecutionCoordinator {
    registry: Arc<SessionRegistry>,
    default_timeout: Duration,
    max_output_bytes: usize,
}

impl ExecutionCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, default_timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            registry,
            default_timeout,
            max_output_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub async fn submit(&self, request: &ExecutionRequest) -> Result<ExecutionResult, KernelError> {
        self.execute(&request.session_id, &request.code, request.timeout)
            .await
    }

    /// 在会话上执行代码；未见过的会话 ID 会以默认工作目录创建
    pub async fn execute(
        &self,
        session_id: &str,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, KernelError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let session = self.registry.entry(Some(session_id), None).await?;
        let mut guard = session.lock().await?;
        let process = guard.process().await?;

        let started = Instant::now();
        let outcome = process.run(code, timeout).await;
        let elapsed = started.elapsed();
        let count = process.execution_count();
        drop(guard);
        session.touch();

        let result = match outcome {
            Ok(raw) => ExecutionResult::from_raw(raw, self.max_output_bytes, elapsed),
            Err(KernelError::ExecutionTimeout(_)) => {
                ExecutionResult::empty(ExecutionOutcome::Timeout, count, elapsed)
            }
            Err(err @ KernelError::ProcessDied { .. }) => {
                let mut result = ExecutionResult::empty(ExecutionOutcome::Error, count, elapsed);
                result.exception_type = Some(KERNEL_DIED.to_string());
                result.exception_message = Some(err.to_string());
                result
            }
            Err(err) => return Err(err),
        };

        tracing::debug!(
            session = %session_id,
            execution_count = result.execution_count,
            outcome = ?result.outcome,
            duration_ms = result.duration_ms,
            "execution finished"
        );
        Ok(result)
    }

    /// 列出会话命名空间，要求会话已存在
    pub async fn inspect(&self, session_id: &str) -> Result<Map<String, Value>, KernelError> {
        let session = self.registry.get(session_id).await?;
        let mut guard = session.lock().await?;
        let raw = guard.process().await?.inspect(self.default_timeout).await?;
        drop(guard);
        session.touch();
        Ok(raw.namespace.unwrap_or_default())
    }

    /// 描述会话里的单个变量；变量不存在时返回 `{"exists": false}`
    pub async fn describe(&self, session_id: &str, name: &str, detailed: bool) -> Result<Value, KernelError> {
        let session = self.registry.get(session_id).await?;
        let mut guard = session.lock().await?;
        let raw = guard
            .process()
            .await?
            .describe(name, detailed, self.default_timeout)
            .await?;
        drop(guard);
        session.touch();
        Ok(raw.variable.unwrap_or_else(|| serde_json::json!({"exists": false})))
    }

    /// 会话最近一次失败的执行；解释器重启后清空
    pub async fn last_error(&self, session_id: &str) -> Result<Option<LastError>, KernelError> {
        let session = self.registry.get(session_id).await?;
        let mut guard = session.lock().await?;
        let raw = guard.process().await?.last_error(self.default_timeout).await?;
        drop(guard);
        session.touch();
        Ok(raw
            .last_error
            .map(|err| LastError::from_raw(err, self.max_output_bytes)))
    }
}
