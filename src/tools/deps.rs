//! 环境类工具：ensure_dependencies / sync_environment / validate_setup

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use super::{parse_args, schema_of, to_content, Tool, ToolContext};
use crate::kernel::SetupReport;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EnsureDependenciesArgs {
    pub session_id: String,
    /// 发行包名（如 opencv-python），一次调用内批量安装
    pub packages: Vec<String>,
    /// 装入开发依赖组
    #[serde(default)]
    pub dev: bool,
}

pub struct EnsureDependenciesTool {
    ctx: Arc<ToolContext>,
}

impl EnsureDependenciesTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for EnsureDependenciesTool {
    fn name(&self) -> &str {
        "ensure_dependencies"
    }

    fn description(&self) -> &str {
        "Install packages into the session's project environment in one batch; the interpreter keeps its state"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<EnsureDependenciesArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: EnsureDependenciesArgs = parse_args(args)?;
        let report = self
            .ctx
            .ensurer
            .ensure(&args.session_id, &args.packages, args.dev)
            .await
            .map_err(|e| e.to_string())?;
        to_content(&report)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SyncEnvironmentArgs {
    pub session_id: String,
    /// 允许在约束范围内升级（`uv sync --upgrade`）
    #[serde(default)]
    pub upgrade: bool,
}

pub struct SyncEnvironmentTool {
    ctx: Arc<ToolContext>,
}

impl SyncEnvironmentTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for SyncEnvironmentTool {
    fn name(&self) -> &str {
        "sync_environment"
    }

    fn description(&self) -> &str {
        "Sync the session's environment with uv.lock and report which packages changed"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SyncEnvironmentArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: SyncEnvironmentArgs = parse_args(args)?;
        let report = self
            .ctx
            .ensurer
            .sync(&args.session_id, args.upgrade)
            .await
            .map_err(|e| e.to_string())?;
        to_content(&report)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ValidateSetupArgs {
    /// 项目目录；相对路径基于守护进程的默认工作目录
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

pub struct ValidateSetupTool {
    ctx: Arc<ToolContext>,
}

impl ValidateSetupTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for ValidateSetupTool {
    fn name(&self) -> &str {
        "validate_setup"
    }

    fn description(&self) -> &str {
        "Check a project directory for uv, .venv, pyproject.toml, uv.lock and a working interpreter; needs no session"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ValidateSetupArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ValidateSetupArgs = parse_args(args)?;
        let working_dir = self.ctx.registry.resolve_working_dir(args.working_dir.as_deref());
        let environment = self.ctx.registry.launcher().environment(&working_dir);
        let report = SetupReport::check(&working_dir, &environment, &self.ctx.uv_program).await;
        if !report.is_valid {
            tracing::info!(working_dir = %working_dir.display(), issues = report.issues.len(), "setup has issues");
        }
        to_content(&report)
    }
}
