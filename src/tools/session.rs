//! 会话生命周期工具：initialize / restart_kernel / shutdown_kernel / kernel_status

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{parse_args, schema_of, to_content, Tool, ToolContext};
use crate::kernel::EnvironmentInfo;
use crate::session::SessionStatus;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InitializeArgs {
    /// 项目目录；相对路径基于守护进程的默认工作目录
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// 复用或指定会话 ID；缺省时生成新 ID
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct InitializeResponse {
    session_id: String,
    environment_info: EnvironmentInfo,
}

pub struct InitializeTool {
    ctx: Arc<ToolContext>,
}

impl InitializeTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for InitializeTool {
    fn name(&self) -> &str {
        "initialize"
    }

    fn description(&self) -> &str {
        "Create or resolve a session: discovers the project's Python environment and starts its interpreter"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<InitializeArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: InitializeArgs = parse_args(args)?;
        let session = self
            .ctx
            .registry
            .resolve_or_create(args.session_id.as_deref(), args.working_dir.as_deref())
            .await
            .map_err(|e| e.to_string())?;

        let (environment, python_version) = {
            let mut guard = session.lock().await.map_err(|e| e.to_string())?;
            let described = match guard.current() {
                Some(process) => (
                    process.environment().clone(),
                    Some(process.info().python_version.clone()),
                ),
                None => (self.ctx.registry.launcher().environment(&session.working_dir), None),
            };
            described
        };
        let environment_info =
            EnvironmentInfo::collect(&session.working_dir, &environment, python_version, &self.ctx.uv_program)
                .await;

        to_content(&InitializeResponse {
            session_id: session.id.clone(),
            environment_info,
        })
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionArgs {
    pub session_id: String,
}

pub struct RestartKernelTool {
    ctx: Arc<ToolContext>,
}

impl RestartKernelTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for RestartKernelTool {
    fn name(&self) -> &str {
        "restart_kernel"
    }

    fn description(&self) -> &str {
        "Replace the session's interpreter with a fresh one; all variables and imports are lost"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SessionArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: SessionArgs = parse_args(args)?;
        let session = self
            .ctx
            .registry
            .restart(&args.session_id)
            .await
            .map_err(|e| e.to_string())?;
        to_content(&serde_json::json!({
            "status": "restarted",
            "session": session.status(),
        }))
    }
}

pub struct ShutdownKernelTool {
    ctx: Arc<ToolContext>,
}

impl ShutdownKernelTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for ShutdownKernelTool {
    fn name(&self) -> &str {
        "shutdown_kernel"
    }

    fn description(&self) -> &str {
        "Stop the session's interpreter and forget the session; unknown sessions are a no-op"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SessionArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: SessionArgs = parse_args(args)?;
        let existed = self.ctx.registry.shutdown(&args.session_id).await;
        to_content(&serde_json::json!({
            "status": if existed { "shutdown" } else { "not_found" },
            "session_id": args.session_id,
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StatusArgs {
    /// 缺省时列出所有会话
    #[serde(default)]
    pub session_id: Option<String>,
}

pub struct KernelStatusTool {
    ctx: Arc<ToolContext>,
}

impl KernelStatusTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for KernelStatusTool {
    fn name(&self) -> &str {
        "kernel_status"
    }

    fn description(&self) -> &str {
        "Report state, execution count and interpreter of one session or of all sessions"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<StatusArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: StatusArgs = parse_args(args)?;
        match args.session_id {
            Some(id) => {
                let session = self.ctx.registry.get(&id).await.map_err(|e| e.to_string())?;
                to_content(&session.status())
            }
            None => {
                let sessions: Vec<SessionStatus> =
                    self.ctx.registry.list().await.iter().map(|s| s.status()).collect();
                to_content(&serde_json::json!({ "sessions": sessions }))
            }
        }
    }
}
