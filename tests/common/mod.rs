//! 集成测试公共件：查找 python3、组装上下文、记录安装调用的假包管理器

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kernel_daemon::config::AppConfig;
use kernel_daemon::deps::{InstallOutput, InstallTarget, PackageManager};
use kernel_daemon::ToolContext;

/// PATH 上的 python3；没有时测试跳过
pub fn python3() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join("python3"))
        .find(|candidate| candidate.is_file())
}

pub struct FakeManager {
    pub calls: Mutex<Vec<(Vec<String>, bool)>>,
    pub succeed: bool,
}

impl FakeManager {
    pub fn new(succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            succeed,
        })
    }

    pub fn calls(&self) -> Vec<(Vec<String>, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageManager for FakeManager {
    fn name(&self) -> &str {
        "fake"
    }

    async fn install(&self, _target: &InstallTarget<'_>, packages: &[String], dev: bool) -> InstallOutput {
        self.calls.lock().unwrap().push((packages.to_vec(), dev));
        InstallOutput {
            success: self.succeed,
            command: format!("fake add {}", packages.join(" ")),
            output: if self.succeed {
                String::new()
            } else {
                "No solution found".to_string()
            },
            duration_ms: 0,
        }
    }

    async fn sync(&self, _target: &InstallTarget<'_>, upgrade: bool) -> InstallOutput {
        InstallOutput {
            success: self.succeed,
            command: if upgrade { "fake sync --upgrade" } else { "fake sync" }.to_string(),
            output: String::new(),
            duration_ms: 0,
        }
    }
}

pub fn config(python: &Path, workspace: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.app.workspace_root = Some(workspace.to_path_buf());
    cfg.kernel.python = Some(python.to_path_buf());
    cfg.kernel.execution_timeout_secs = 30;
    cfg.kernel.stop_timeout_secs = 2;
    cfg
}

pub fn context(python: &Path, workspace: &Path, manager: Arc<FakeManager>) -> Arc<ToolContext> {
    Arc::new(ToolContext::new(&config(python, workspace), manager))
}
