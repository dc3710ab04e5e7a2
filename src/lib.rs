//! kernel-daemon：面向对话式 Agent 的长生命周期 Python 执行守护进程
//!
//! 模块划分：
//! - **config**: 配置加载（TOML + 环境变量）
//! - **core**: 错误类型、错误分类、恢复循环、优雅关闭
//! - **kernel**: 环境发现、解释器进程句柄与驱动协议
//! - **session**: 会话注册表与按会话串行的执行协调器
//! - **deps**: 依赖安装（uv）
//! - **guidance**: 纯函数的使用指引
//! - **tools**: 对外工具面与执行器
//! - **server**: stdin/stdout 上的换行分隔 JSON 服务循环

pub mod config;
pub mod core;
pub mod deps;
pub mod guidance;
pub mod kernel;
pub mod observability;
pub mod server;
pub mod session;
pub mod tools;

pub use crate::core::{KernelError, RecoveryLoop, RecoveryReport, RecoveryStatus};
pub use crate::session::{ExecutionCoordinator, ExecutionOutcome, ExecutionRequest, ExecutionResult, SessionRegistry};
pub use crate::tools::ToolContext;
