//! 恢复循环
//!
//! 状态机：Attempting → Succeeded | Classifying → RemedyPending → Attempting(next) | Exhausted | Unrecoverable。
//! 只有缺包能自动补救（装包后原样重跑）；其余可恢复错误交还调用方写新代码（RemedyRequested）。
//! 超时一律不可恢复。这里是唯一决定是否继续重试的地方，协调器本身跨尝试无状态。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::RecoverySection;
use crate::core::classifier::{analyze, ErrorClass, RemedyKind, UnrecoverableReason};
use crate::core::KernelError;
use crate::deps::{package_for_module, DependencyEnsurer};
use crate::session::{ExecutionCoordinator, ExecutionOutcome, ExecutionRequest, ExecutionResult};

/// 执行一次尝试
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, KernelError>;
}

/// 缺包补救：为会话批量安装，返回是否成功
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, session_id: &str, packages: &[String]) -> Result<bool, KernelError>;
}

#[async_trait]
impl CodeRunner for ExecutionCoordinator {
    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, KernelError> {
        self.submit(request).await
    }
}

#[async_trait]
impl PackageInstaller for DependencyEnsurer {
    async fn install(&self, session_id: &str, packages: &[String]) -> Result<bool, KernelError> {
        Ok(self.ensure(session_id, packages, false).await?.success)
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub auto_install: bool,
    /// 成功时也返回尝试记录
    pub verbose: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self::from(&RecoverySection::default())
    }
}

impl From<&RecoverySection> for RecoveryPolicy {
    fn from(cfg: &RecoverySection) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            auto_install: cfg.auto_install,
            verbose: cfg.verbose,
        }
    }
}

/// 两次尝试之间施加的补救
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppliedRemedy {
    InstallPackages {
        packages: Vec<String>,
        succeeded: bool,
        /// 安装器本身报错（包名非法、uv 起不来）时的错误信息
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    /// 从 1 开始，含调用方此前的尝试
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remedy: Option<AppliedRemedy>,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecoveryStatus {
    Succeeded,
    /// 需要调用方提交新代码
    RemedyRequested { remedy: RemedyKind, hints: Vec<String> },
    /// 可恢复但预算用尽
    Exhausted { reason: UnrecoverableReason },
    Unrecoverable { reason: UnrecoverableReason, hints: Vec<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    #[serde(flatten)]
    pub status: RecoveryStatus,
    pub final_result: ExecutionResult,
    /// 下次重试应带上的 prior_attempts
    pub attempts_used: u32,
    pub max_attempts: u32,
    pub attempts: Vec<AttemptRecord>,
}

impl RecoveryReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, RecoveryStatus::Succeeded)
    }
}

pub struct RecoveryLoop {
    runner: Arc<dyn CodeRunner>,
    installer: Arc<dyn PackageInstaller>,
    policy: RecoveryPolicy,
}

impl RecoveryLoop {
    pub fn new(
        runner: Arc<dyn CodeRunner>,
        installer: Arc<dyn PackageInstaller>,
        policy: RecoveryPolicy,
    ) -> Self {
        Self {
            runner,
            installer,
            policy,
        }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// 跑完一个逻辑请求。基础设施错误直接返回 Err，不重试
    pub async fn run(&self, request: ExecutionRequest) -> Result<RecoveryReport, KernelError> {
        let max = self.policy.max_attempts;
        let verbose = request.verbose.unwrap_or(self.policy.verbose);
        let mut attempt = request.prior_attempts.saturating_add(1);
        let mut history: Vec<AttemptRecord> = Vec::new();

        loop {
            let result = self.runner.run(&request).await?;

            if result.outcome == ExecutionOutcome::Success {
                let attempts = if verbose {
                    history.push(AttemptRecord {
                        attempt,
                        classification: None,
                        remedy: None,
                        result: result.clone(),
                    });
                    history
                } else {
                    Vec::new()
                };
                return Ok(self.report(RecoveryStatus::Succeeded, result, attempt, attempts));
            }

            let analysis = match result.outcome {
                ExecutionOutcome::Timeout => None,
                _ => Some(analyze(
                    result.exception_type.as_deref().unwrap_or_default(),
                    result.exception_message.as_deref().unwrap_or_default(),
                )),
            };
            let class = analysis.as_ref().map(|a| a.class).unwrap_or(ErrorClass::Unrecoverable {
                reason: UnrecoverableReason::Timeout,
            });
            tracing::info!(
                session = %request.session_id,
                attempt,
                max,
                class = ?class,
                "execution failed"
            );

            let mut record = AttemptRecord {
                attempt,
                classification: Some(class),
                remedy: None,
                result: result.clone(),
            };
            let hints = analysis.as_ref().map(|a| a.hints.clone()).unwrap_or_default();

            let remedy = match class {
                ErrorClass::Unrecoverable { reason } => {
                    history.push(record);
                    let status = RecoveryStatus::Unrecoverable { reason, hints };
                    return Ok(self.report(status, result, attempt, history));
                }
                ErrorClass::Recoverable { remedy } => remedy,
            };

            if attempt >= max {
                history.push(record);
                let status = RecoveryStatus::Exhausted {
                    reason: UnrecoverableReason::RetryBudgetExhausted,
                };
                return Ok(self.report(status, result, attempt, history));
            }

            if !(remedy.is_auto_fixable() && self.policy.auto_install) {
                history.push(record);
                let status = RecoveryStatus::RemedyRequested { remedy, hints };
                return Ok(self.report(status, result, attempt, history));
            }

            let module = analysis.and_then(|a| a.missing_module);
            let Some(module) = module else {
                // ImportError 但不是缺模块（如 cannot import name），装包无济于事
                history.push(record);
                let status = RecoveryStatus::RemedyRequested { remedy, hints };
                return Ok(self.report(status, result, attempt, history));
            };
            let packages = vec![package_for_module(&module)];
            // 装包失败也算用掉一次尝试，记进历史后继续，由预算决定何时停
            let (succeeded, error) = match self.installer.install(&request.session_id, &packages).await {
                Ok(succeeded) => (succeeded, None),
                Err(e) => {
                    tracing::warn!(session = %request.session_id, ?packages, error = %e, "package install failed");
                    (false, Some(e.to_string()))
                }
            };
            record.remedy = Some(AppliedRemedy::InstallPackages {
                packages,
                succeeded,
                error,
            });
            history.push(record);
            attempt = attempt.saturating_add(1);
        }
    }

    fn report(
        &self,
        status: RecoveryStatus,
        final_result: ExecutionResult,
        attempts_used: u32,
        attempts: Vec<AttemptRecord>,
    ) -> RecoveryReport {
        RecoveryReport {
            status,
            final_result,
            attempts_used,
            max_attempts: self.policy.max_attempts,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 按脚本依次返回结果的假执行器
    struct ScriptedRunner {
        results: Mutex<VecDeque<ExecutionResult>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(results: Vec<ExecutionResult>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CodeRunner for ScriptedRunner {
        async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, KernelError> {
            self.calls.lock().unwrap().push(request.code.clone());
            let mut results = self.results.lock().unwrap();
            let next = if results.len() > 1 {
                results.pop_front()
            } else {
                results.front().cloned()
            };
            next.ok_or_else(|| KernelError::Channel("script exhausted".to_string()))
        }
    }

    struct FakeInstaller {
        succeed: bool,
        rejects: bool,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeInstaller {
        fn new(succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                succeed,
                rejects: false,
                calls: Mutex::new(Vec::new()),
            })
        }

        /// 安装器本身报错，而不是装包失败
        fn rejecting() -> Arc<Self> {
            Arc::new(Self {
                succeed: false,
                rejects: true,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PackageInstaller for FakeInstaller {
        async fn install(&self, _session_id: &str, packages: &[String]) -> Result<bool, KernelError> {
            self.calls.lock().unwrap().push(packages.to_vec());
            if self.rejects {
                return Err(KernelError::InvalidPackageName(packages.join(" ")));
            }
            Ok(self.succeed)
        }
    }

    fn result(outcome: ExecutionOutcome, ename: Option<&str>, evalue: &str) -> ExecutionResult {
        ExecutionResult {
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            value: None,
            displays: Vec::new(),
            exception_type: ename.map(str::to_string),
            exception_message: ename.map(|_| evalue.to_string()),
            traceback: Vec::new(),
            execution_count: 1,
            duration_ms: 1,
            truncated: false,
        }
    }

    fn ok() -> ExecutionResult {
        result(ExecutionOutcome::Success, None, "")
    }

    fn err(ename: &str, evalue: &str) -> ExecutionResult {
        result(ExecutionOutcome::Error, Some(ename), evalue)
    }

    fn looped(
        runner: Arc<ScriptedRunner>,
        installer: Arc<FakeInstaller>,
        policy: RecoveryPolicy,
    ) -> RecoveryLoop {
        RecoveryLoop::new(runner, installer, policy)
    }

    #[tokio::test]
    async fn test_success_has_empty_history() {
        let runner = ScriptedRunner::new(vec![ok()]);
        let lp = looped(runner, FakeInstaller::new(true), RecoveryPolicy::default());
        let report = lp.run(ExecutionRequest::new("s", "x = 1")).await.unwrap();
        assert!(report.succeeded());
        assert!(report.attempts.is_empty());
        assert_eq!(report.attempts_used, 1);
    }

    #[tokio::test]
    async fn test_verbose_success_keeps_history() {
        let runner = ScriptedRunner::new(vec![ok()]);
        let policy = RecoveryPolicy {
            verbose: true,
            ..RecoveryPolicy::default()
        };
        let report = looped(runner, FakeInstaller::new(true), policy)
            .run(ExecutionRequest::new("s", "x = 1"))
            .await
            .unwrap();
        assert_eq!(report.attempts.len(), 1);
        assert!(report.attempts[0].classification.is_none());
    }

    #[tokio::test]
    async fn test_missing_import_failed_install_exhausts_after_three() {
        let runner = ScriptedRunner::new(vec![err(
            "ModuleNotFoundError",
            "No module named 'nonexistent_pkg_xyz'",
        )]);
        let installer = FakeInstaller::new(false);
        let lp = looped(runner.clone(), installer.clone(), RecoveryPolicy::default());
        let report = lp
            .run(ExecutionRequest::new("s", "import nonexistent_pkg_xyz"))
            .await
            .unwrap();

        assert!(matches!(
            report.status,
            RecoveryStatus::Exhausted {
                reason: UnrecoverableReason::RetryBudgetExhausted
            }
        ));
        assert_eq!(report.attempts.len(), 3);
        assert_eq!(
            report.attempts.iter().map(|a| a.attempt).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(report.attempts[0].remedy.is_some());
        assert!(report.attempts[2].remedy.is_none());
        // 每次都原样重跑原始代码
        assert!(runner.calls().iter().all(|c| c == "import nonexistent_pkg_xyz"));
        assert_eq!(installer.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_import_installs_mapped_package_then_succeeds() {
        let runner = ScriptedRunner::new(vec![err("ModuleNotFoundError", "No module named 'cv2'"), ok()]);
        let installer = FakeInstaller::new(true);
        let report = looped(runner, installer.clone(), RecoveryPolicy::default())
            .run(ExecutionRequest::new("s", "import cv2"))
            .await
            .unwrap();
        assert!(report.succeeded());
        assert_eq!(report.attempts_used, 2);
        assert_eq!(
            *installer.calls.lock().unwrap(),
            vec![vec!["opencv-python".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_stop_marker_terminates_immediately() {
        let runner = ScriptedRunner::new(vec![err("Exception", "STOP: need human")]);
        let installer = FakeInstaller::new(true);
        let report = looped(runner.clone(), installer.clone(), RecoveryPolicy::default())
            .run(ExecutionRequest::new("s", "raise Exception('STOP: need human')"))
            .await
            .unwrap();
        assert!(matches!(
            report.status,
            RecoveryStatus::Unrecoverable {
                reason: UnrecoverableReason::ExplicitStopSignal,
                ..
            }
        ));
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(runner.calls().len(), 1);
        assert!(installer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_never_retried() {
        let runner = ScriptedRunner::new(vec![result(ExecutionOutcome::Timeout, None, "")]);
        let report = looped(runner.clone(), FakeInstaller::new(true), RecoveryPolicy::default())
            .run(ExecutionRequest::new("s", "while True: pass"))
            .await
            .unwrap();
        assert!(matches!(
            report.status,
            RecoveryStatus::Unrecoverable {
                reason: UnrecoverableReason::Timeout,
                ..
            }
        ));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_code_problems_request_a_remedy() {
        let runner = ScriptedRunner::new(vec![err("NameError", "name 'x' is not defined")]);
        let report = looped(runner.clone(), FakeInstaller::new(true), RecoveryPolicy::default())
            .run(ExecutionRequest::new("s", "print(x)"))
            .await
            .unwrap();
        match report.status {
            RecoveryStatus::RemedyRequested { remedy, hints } => {
                assert_eq!(remedy, RemedyKind::UndefinedName);
                assert!(hints.iter().any(|h| h.contains('x')));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_caller_retries_share_the_budget() {
        let runner = ScriptedRunner::new(vec![err("IndexError", "list index out of range")]);
        let lp = looped(runner, FakeInstaller::new(true), RecoveryPolicy::default());

        let first = lp.run(ExecutionRequest::new("s", "a[5]")).await.unwrap();
        assert!(matches!(first.status, RecoveryStatus::RemedyRequested { .. }));
        let second = lp
            .run(ExecutionRequest::new("s", "a[4]").with_prior_attempts(first.attempts_used))
            .await
            .unwrap();
        assert!(matches!(second.status, RecoveryStatus::RemedyRequested { .. }));
        let third = lp
            .run(ExecutionRequest::new("s", "a[3]").with_prior_attempts(second.attempts_used))
            .await
            .unwrap();
        assert!(matches!(third.status, RecoveryStatus::Exhausted { .. }));
        assert_eq!(third.attempts[0].attempt, 3);
    }

    #[tokio::test]
    async fn test_auto_install_disabled_requests_remedy() {
        let runner = ScriptedRunner::new(vec![err("ModuleNotFoundError", "No module named 'yaml'")]);
        let installer = FakeInstaller::new(true);
        let policy = RecoveryPolicy {
            auto_install: false,
            ..RecoveryPolicy::default()
        };
        let report = looped(runner, installer.clone(), policy)
            .run(ExecutionRequest::new("s", "import yaml"))
            .await
            .unwrap();
        assert!(matches!(
            report.status,
            RecoveryStatus::RemedyRequested {
                remedy: RemedyKind::MissingImport,
                ..
            }
        ));
        assert!(installer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_infrastructure_errors_propagate() {
        let runner = ScriptedRunner::new(Vec::new());
        let res = looped(runner, FakeInstaller::new(true), RecoveryPolicy::default())
            .run(ExecutionRequest::new("s", "1"))
            .await;
        assert!(matches!(res, Err(KernelError::Channel(_))));
    }

    #[tokio::test]
    async fn test_installer_error_is_recorded_not_propagated() {
        let runner = ScriptedRunner::new(vec![err("ModuleNotFoundError", "No module named 'yaml'")]);
        let installer = FakeInstaller::rejecting();
        let report = looped(runner.clone(), installer.clone(), RecoveryPolicy::default())
            .run(ExecutionRequest::new("s", "import yaml"))
            .await
            .unwrap();

        assert!(matches!(report.status, RecoveryStatus::Exhausted { .. }));
        assert_eq!(report.attempts.len(), 3);
        match &report.attempts[0].remedy {
            Some(AppliedRemedy::InstallPackages {
                packages,
                succeeded,
                error,
            }) => {
                assert_eq!(packages, &vec!["pyyaml".to_string()]);
                assert!(!succeeded);
                assert!(error.as_deref().unwrap().contains("Invalid package name"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(runner.calls().len(), 3);
        assert_eq!(installer.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_huge_prior_attempts_does_not_overflow() {
        let runner = ScriptedRunner::new(vec![err("NameError", "name 'x' is not defined")]);
        let report = looped(runner, FakeInstaller::new(true), RecoveryPolicy::default())
            .run(ExecutionRequest::new("s", "print(x)").with_prior_attempts(u32::MAX))
            .await
            .unwrap();
        assert!(matches!(report.status, RecoveryStatus::Exhausted { .. }));
        assert_eq!(report.attempts_used, u32::MAX);
    }

    #[tokio::test]
    async fn test_request_verbose_overrides_policy() {
        let policy = RecoveryPolicy::default();
        assert!(!policy.verbose);
        let runner = ScriptedRunner::new(vec![ok()]);
        let report = looped(runner, FakeInstaller::new(true), policy)
            .run(ExecutionRequest::new("s", "x = 1").with_verbose(Some(true)))
            .await
            .unwrap();
        assert!(report.succeeded());
        assert_eq!(report.attempts.len(), 1);
    }
}
