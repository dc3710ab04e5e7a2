//! 对外工具面：会话管理、代码执行、调试、依赖与环境、指引
//!
//! 所有工具共享一个 [`ToolContext`]，其中的注册表、协调器、依赖安装器与恢复循环都是显式构造的实例。

pub mod debug;
pub mod deps;
pub mod execute;
pub mod executor;
pub mod guidance;
pub mod registry;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

pub use executor::{ToolError, ToolExecutor};
pub use registry::{parse_args, schema_of, to_content, Tool, ToolRegistry};

use crate::config::AppConfig;
use crate::core::{RecoveryLoop, RecoveryPolicy};
use crate::deps::{DependencyEnsurer, PackageManager, UvPackageManager};
use crate::kernel::KernelLauncher;
use crate::session::{ExecutionCoordinator, SessionRegistry};

/// 工具共享的服务
pub struct ToolContext {
    pub registry: Arc<SessionRegistry>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub ensurer: Arc<DependencyEnsurer>,
    pub recovery: Arc<RecoveryLoop>,
    pub uv_program: String,
}

impl ToolContext {
    /// 按配置组装，包管理器由调用方注入（测试里换成假的）
    pub fn new(cfg: &AppConfig, manager: Arc<dyn PackageManager>) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            KernelLauncher::from_config(&cfg.kernel),
            cfg.app.default_working_dir(),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            Arc::clone(&registry),
            cfg.kernel.execution_timeout(),
            cfg.kernel.max_output_bytes,
        ));
        let ensurer = Arc::new(DependencyEnsurer::new(Arc::clone(&registry), manager));
        let recovery = Arc::new(RecoveryLoop::new(
            coordinator.clone(),
            ensurer.clone(),
            RecoveryPolicy::from(&cfg.recovery),
        ));
        Self {
            registry,
            coordinator,
            ensurer,
            recovery,
            uv_program: cfg.dependencies.uv_program.clone(),
        }
    }

    /// 使用 uv 作为包管理器
    pub fn with_uv(cfg: &AppConfig) -> Self {
        let manager = UvPackageManager::new(
            cfg.dependencies.uv_program.clone(),
            std::time::Duration::from_secs(cfg.dependencies.install_timeout_secs),
        );
        Self::new(cfg, Arc::new(manager))
    }
}

/// 返回全部工具 schema
pub struct ListToolsTool {
    catalog: Value,
}

#[async_trait]
impl Tool for ListToolsTool {
    fn name(&self) -> &str {
        "list_tools"
    }

    fn description(&self) -> &str {
        "List every tool with its description and JSON schema of arguments"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        to_content(&self.catalog)
    }
}

/// 注册全部工具
pub fn build_registry(ctx: Arc<ToolContext>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(session::InitializeTool::new(Arc::clone(&ctx)));
    registry.register(session::RestartKernelTool::new(Arc::clone(&ctx)));
    registry.register(session::ShutdownKernelTool::new(Arc::clone(&ctx)));
    registry.register(session::KernelStatusTool::new(Arc::clone(&ctx)));
    registry.register(execute::ExecuteCellTool::new(Arc::clone(&ctx)));
    registry.register(execute::RunFileTool::new(Arc::clone(&ctx)));
    registry.register(execute::InspectNamespaceTool::new(Arc::clone(&ctx)));
    registry.register(debug::InspectVariableTool::new(Arc::clone(&ctx)));
    registry.register(debug::DebugLastErrorTool::new(Arc::clone(&ctx)));
    registry.register(deps::EnsureDependenciesTool::new(Arc::clone(&ctx)));
    registry.register(deps::SyncEnvironmentTool::new(Arc::clone(&ctx)));
    registry.register(deps::ValidateSetupTool::new(Arc::clone(&ctx)));
    registry.register(guidance::GetGuidanceTool);

    let mut catalog = registry.schema_value();
    let list_tools = ListToolsTool {
        catalog: Value::Null,
    };
    if let Value::Array(items) = &mut catalog {
        items.push(serde_json::json!({
            "name": list_tools.name(),
            "description": list_tools.description(),
            "parameters": list_tools.parameters_schema(),
        }));
    }
    registry.register(ListToolsTool { catalog });
    registry
}
