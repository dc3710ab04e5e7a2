//! 解释器层：环境发现、驱动协议、进程句柄、输出截断

pub mod environment;
pub mod output;
pub mod process;
pub mod protocol;

use std::path::{Path, PathBuf};
use std::time::Duration;

pub use environment::{EnvironmentInfo, EnvironmentKind, PythonEnvironment, SetupReport};
pub use output::{cap_displays, cap_lines, cap_output};
pub use process::{InterpreterInfo, InterpreterProcess};
pub use protocol::{RawError, RawOutcome, RawStatus};

use crate::config::KernelSection;
use crate::core::KernelError;

/// 按工作目录发现环境并启动解释器；注册表通过它创建句柄
#[derive(Debug, Clone)]
pub struct KernelLauncher {
    pub python_override: Option<PathBuf>,
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
}

impl KernelLauncher {
    pub fn from_config(cfg: &KernelSection) -> Self {
        Self {
            python_override: cfg.python.clone(),
            startup_timeout: cfg.startup_timeout(),
            stop_timeout: cfg.stop_timeout(),
        }
    }

    pub fn environment(&self, working_dir: &Path) -> PythonEnvironment {
        PythonEnvironment::discover(working_dir, self.python_override.as_deref())
    }

    pub async fn start(&self, working_dir: &Path) -> Result<InterpreterProcess, KernelError> {
        let env = self.environment(working_dir);
        InterpreterProcess::start(working_dir, &env, self.startup_timeout).await
    }
}
