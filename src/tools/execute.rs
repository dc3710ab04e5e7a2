//! 执行类工具：execute_cell / run_file / inspect_namespace
//!
//! execute_cell 与 run_file 默认经恢复循环执行，返回 [`RecoveryReport`]；
//! `recover=false` 时只跑一次，返回 ExecutionResult 与错误分析。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{parse_args, schema_of, to_content, Tool, ToolContext};
use crate::core::{analyze, ErrorAnalysis};
use crate::session::{ExecutionOutcome, ExecutionRequest, ExecutionResult};

fn default_recover() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCellArgs {
    pub session_id: String,
    pub code: String,
    /// 覆盖默认执行超时（秒）
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    /// 是否经恢复循环（缺包自动安装并重跑）
    #[serde(default = "default_recover")]
    pub recover: bool,
    /// 上一次返回的 attempts_used；修改代码后重试时带上
    #[serde(default)]
    pub prior_attempts: u32,
    /// 成功时也返回完整尝试历史；不填则用配置的默认值
    #[serde(default)]
    pub verbose: Option<bool>,
}

#[derive(Debug, Serialize)]
struct SingleRunResponse {
    #[serde(flatten)]
    result: ExecutionResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<ErrorAnalysis>,
}

fn timeout_from_secs(secs: Option<f64>) -> Result<Option<Duration>, String> {
    match secs {
        None => Ok(None),
        Some(s) if s.is_finite() && s > 0.0 => Duration::try_from_secs_f64(s)
            .map(Some)
            .map_err(|e| format!("timeout_secs out of range ({s}): {e}")),
        Some(s) => Err(format!("timeout_secs must be positive, got {s}")),
    }
}

/// 执行一次逻辑请求，按 recover 选择单次执行或恢复循环
async fn run_request(ctx: &ToolContext, request: ExecutionRequest, recover: bool) -> Result<String, String> {
    if recover {
        let report = ctx.recovery.run(request).await.map_err(|e| e.to_string())?;
        return to_content(&report);
    }
    let result = ctx.coordinator.submit(&request).await.map_err(|e| e.to_string())?;
    let analysis = match result.outcome {
        ExecutionOutcome::Error => Some(analyze(
            result.exception_type.as_deref().unwrap_or_default(),
            result.exception_message.as_deref().unwrap_or_default(),
        )),
        _ => None,
    };
    to_content(&SingleRunResponse { result, analysis })
}

pub struct ExecuteCellTool {
    ctx: Arc<ToolContext>,
}

impl ExecuteCellTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for ExecuteCellTool {
    fn name(&self) -> &str {
        "execute_cell"
    }

    fn description(&self) -> &str {
        "Execute Python code in the session's persistent interpreter; variables survive across calls"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ExecuteCellArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ExecuteCellArgs = parse_args(args)?;
        let request = ExecutionRequest::new(args.session_id, args.code)
            .with_timeout(timeout_from_secs(args.timeout_secs)?)
            .with_prior_attempts(args.prior_attempts)
            .with_verbose(args.verbose);
        run_request(&self.ctx, request, args.recover).await
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunFileArgs {
    pub session_id: String,
    /// `.py` 文件；相对路径基于会话工作目录
    pub path: PathBuf,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(default = "default_recover")]
    pub recover: bool,
    #[serde(default)]
    pub verbose: Option<bool>,
}

pub struct RunFileTool {
    ctx: Arc<ToolContext>,
}

impl RunFileTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

/// 解析并校验脚本路径，不碰解释器
fn resolve_script(working_dir: &Path, path: &Path) -> Result<PathBuf, String> {
    if path.extension().and_then(|e| e.to_str()) != Some("py") {
        return Err(format!("Not a Python file: {}", path.display()));
    }
    let full = if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    };
    if !full.is_file() {
        return Err(format!("File not found: {}", full.display()));
    }
    Ok(full)
}

#[async_trait]
impl Tool for RunFileTool {
    fn name(&self) -> &str {
        "run_file"
    }

    fn description(&self) -> &str {
        "Execute a .py file inside the session's interpreter, like execute_cell with the file's contents"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<RunFileArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: RunFileArgs = parse_args(args)?;
        let timeout = timeout_from_secs(args.timeout_secs)?;
        let session = self
            .ctx
            .registry
            .entry(Some(&args.session_id), None)
            .await
            .map_err(|e| e.to_string())?;
        let script = resolve_script(&session.working_dir, &args.path)?;
        let code = tokio::fs::read_to_string(&script)
            .await
            .map_err(|e| format!("Read {} failed: {e}", script.display()))?;
        tracing::info!(session = %args.session_id, script = %script.display(), "running file");

        let request = ExecutionRequest::new(args.session_id, code)
            .with_timeout(timeout)
            .with_verbose(args.verbose);
        run_request(&self.ctx, request, args.recover).await
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InspectArgs {
    pub session_id: String,
    /// 只返回名字匹配该正则的变量
    #[serde(default)]
    pub filter: Option<String>,
}

pub struct InspectNamespaceTool {
    ctx: Arc<ToolContext>,
}

impl InspectNamespaceTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

fn filter_namespace(namespace: Map<String, Value>, filter: Option<&Regex>) -> Map<String, Value> {
    match filter {
        Some(re) => namespace.into_iter().filter(|(name, _)| re.is_match(name)).collect(),
        None => namespace,
    }
}

#[async_trait]
impl Tool for InspectNamespaceTool {
    fn name(&self) -> &str {
        "inspect_namespace"
    }

    fn description(&self) -> &str {
        "List variables defined in the session with type, length and shape where available"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<InspectArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: InspectArgs = parse_args(args)?;
        let filter = args
            .filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| format!("Invalid filter: {e}"))?;
        let namespace = self
            .ctx
            .coordinator
            .inspect(&args.session_id)
            .await
            .map_err(|e| e.to_string())?;
        let variables = filter_namespace(namespace, filter.as_ref());
        to_content(&serde_json::json!({
            "session_id": args.session_id,
            "count": variables.len(),
            "variables": variables,
        }))
    }
}
