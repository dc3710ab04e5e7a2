//! 守护进程错误类型
//!
//! 基础设施类错误（进程起不来、通道断开）直接返回给调用方，从不自动重试；
//! 用户代码引发的异常不走这里，而是装进 ExecutionResult 交给分类器与恢复循环。

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// 会话、解释器进程与依赖安装过程中可能出现的错误
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Interpreter failed to start: {0}")]
    ProcessStartFailed(String),

    /// 进程已退出（下次使用时才发现）
    #[error("Interpreter process exited ({})", describe_status(.status))]
    ProcessDied { status: Option<ExitStatus> },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Execution timed out after {0:?}")]
    ExecutionTimeout(Duration),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid session id: {0}")]
    InvalidSessionId(String),

    #[error("Invalid package name: {0}")]
    InvalidPackageName(String),

    #[error("No uv.lock in {0}: run `uv lock` to create one")]
    LockfileMissing(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    /// 进程/通道层面的故障：调用方可据此决定是否 restart_kernel
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::ProcessStartFailed(_) | Self::ProcessDied { .. } | Self::Channel(_) | Self::Io(_)
        )
    }
}

fn describe_status(status: &Option<ExitStatus>) -> String {
    match status {
        Some(s) => s.to_string(),
        None => "status unknown".to_string(),
    }
}
