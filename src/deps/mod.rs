//! 依赖安装
//!
//! 安装总是进入会话所在的隔离环境，多个包一次批量安装；不重启解释器、不清空会话状态。
//! 新装的包对正在运行的解释器可见，调用方重新执行 import 即可。

pub mod packages;
pub mod uv;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub use packages::package_for_module;
pub use uv::UvPackageManager;

use crate::core::KernelError;
use crate::kernel::{InterpreterProcess, PythonEnvironment};
use crate::session::SessionRegistry;

/// 安装目标：会话工作目录及其解释器环境
pub struct InstallTarget<'a> {
    pub working_dir: &'a Path,
    pub environment: &'a PythonEnvironment,
}

/// 包管理器一次调用的结果
#[derive(Debug, Clone, Serialize)]
pub struct InstallOutput {
    pub success: bool,
    pub command: String,
    pub output: String,
    pub duration_ms: u64,
}

impl InstallOutput {
    pub fn failed(command: String, output: impl Into<String>) -> Self {
        Self {
            success: false,
            command,
            output: output.into(),
            duration_ms: 0,
        }
    }
}

/// 同步前后列包时给解释器的时间
const PACKAGE_LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// 包管理器抽象：一次调用装完整批包
#[async_trait]
pub trait PackageManager: Send + Sync {
    fn name(&self) -> &str;

    async fn install(&self, target: &InstallTarget<'_>, packages: &[String], dev: bool) -> InstallOutput;

    /// 让环境与锁文件一致；`upgrade` 时允许升级到约束内的最新版本
    async fn sync(&self, target: &InstallTarget<'_>, upgrade: bool) -> InstallOutput;
}

/// ensure_dependencies 的返回
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub session_id: String,
    pub packages: Vec<String>,
    pub dev: bool,
    pub success: bool,
    /// 空列表时为 None（没有调用包管理器）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<InstallOutput>,
}

/// sync_environment 的返回：同步结果加上解释器视角的包列表差异
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub session_id: String,
    pub upgrade: bool,
    pub success: bool,
    pub sync: InstallOutput,
    /// `name==version`；版本变化表现为一删一增
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// 同步后的包总数；解释器列包失败时为 None
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_packages: Option<usize>,
    /// 已导入的模块不会自动换成新版本
    pub kernel_restart_required: bool,
}

pub struct DependencyEnsurer {
    registry: Arc<SessionRegistry>,
    manager: Arc<dyn PackageManager>,
}

impl DependencyEnsurer {
    pub fn new(registry: Arc<SessionRegistry>, manager: Arc<dyn PackageManager>) -> Self {
        Self { registry, manager }
    }

    /// 为已存在的会话安装依赖。持有会话锁，因此与该会话的执行串行
    pub async fn ensure(
        &self,
        session_id: &str,
        packages: &[String],
        dev: bool,
    ) -> Result<InstallReport, KernelError> {
        let packages = normalize(packages)?;
        let session = self.registry.get(session_id).await?;
        let mut report = InstallReport {
            session_id: session_id.to_string(),
            packages: packages.clone(),
            dev,
            success: true,
            install: None,
        };
        if packages.is_empty() {
            return Ok(report);
        }

        let mut guard = session.lock().await?;
        let environment = match guard.current() {
            Some(process) => process.environment().clone(),
            None => self.registry.launcher().environment(&session.working_dir),
        };
        let target = InstallTarget {
            working_dir: &session.working_dir,
            environment: &environment,
        };
        let output = self.manager.install(&target, &packages, dev).await;
        drop(guard);
        session.touch();

        if output.success {
            tracing::info!(session = %session_id, packages = ?packages, manager = self.manager.name(), "packages installed");
        } else {
            tracing::warn!(session = %session_id, packages = ?packages, output = %output.output, "package install failed");
        }
        report.success = output.success;
        report.install = Some(output);
        Ok(report)
    }

    /// 按 uv.lock 同步会话环境。需要锁文件；解释器未运行时会先启动它以便对比前后的包列表
    pub async fn sync(&self, session_id: &str, upgrade: bool) -> Result<SyncReport, KernelError> {
        let session = self.registry.get(session_id).await?;
        if !session.working_dir.join("uv.lock").is_file() {
            return Err(KernelError::LockfileMissing(session.working_dir.display().to_string()));
        }

        let mut guard = session.lock().await?;
        let process = guard.process().await?;
        let environment = process.environment().clone();
        let before = list_packages(process).await;

        let target = InstallTarget {
            working_dir: &session.working_dir,
            environment: &environment,
        };
        let output = self.manager.sync(&target, upgrade).await;

        let after = match guard.current() {
            Some(process) => list_packages(process).await,
            None => None,
        };
        drop(guard);
        session.touch();

        let (added, removed) = match (&before, &after) {
            (Some(before), Some(after)) => diff_packages(before, after),
            _ => (Vec::new(), Vec::new()),
        };
        let changed = !added.is_empty() || !removed.is_empty();
        if output.success {
            tracing::info!(session = %session_id, upgrade, added = added.len(), removed = removed.len(), "environment synced");
        } else {
            tracing::warn!(session = %session_id, output = %output.output, "environment sync failed");
        }
        Ok(SyncReport {
            session_id: session_id.to_string(),
            upgrade,
            success: output.success,
            sync: output,
            added,
            removed,
            total_packages: after.as_ref().map(Vec::len),
            kernel_restart_required: changed,
        })
    }
}

async fn list_packages(process: &mut InterpreterProcess) -> Option<Vec<String>> {
    match process.packages(PACKAGE_LIST_TIMEOUT).await {
        Ok(raw) => raw.packages,
        Err(e) => {
            tracing::warn!(error = %e, "listing installed packages failed");
            None
        }
    }
}

/// (新增, 移除)，各自排序
fn diff_packages(before: &[String], after: &[String]) -> (Vec<String>, Vec<String>) {
    let before: BTreeSet<&String> = before.iter().collect();
    let after: BTreeSet<&String> = after.iter().collect();
    let added = after.difference(&before).map(|p| p.to_string()).collect();
    let removed = before.difference(&after).map(|p| p.to_string()).collect();
    (added, removed)
}

/// 去空白、去重（保持顺序），拒绝以 `-` 开头的名字以免被当成命令行选项
fn normalize(packages: &[String]) -> Result<Vec<String>, KernelError> {
    let mut out: Vec<String> = Vec::with_capacity(packages.len());
    for raw in packages {
        let name = raw.trim();
        if name.is_empty() {
            continue;
        }
        if name.starts_with('-') || name.chars().any(char::is_whitespace) {
            return Err(KernelError::InvalidPackageName(name.to_string()));
        }
        if !out.iter().any(|p| p == name) {
            out.push(name.to_string());
        }
    }
    Ok(out)
}
