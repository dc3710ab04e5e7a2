//! 会话与执行集成测试（需要 PATH 上有 python3）

mod common;

use std::sync::Arc;
use std::time::Duration;

use kernel_daemon::core::{classify, ErrorClass, RemedyKind, UnrecoverableReason};
use kernel_daemon::{ExecutionOutcome, ExecutionRequest, KernelError, RecoveryStatus};

macro_rules! python_or_skip {
    () => {
        match common::python3() {
            Some(python) => python,
            None => {
                eprintln!("python3 not found on PATH, skipping");
                return;
            }
        }
    };
}

#[tokio::test]
async fn test_state_survives_between_executions() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let ctx = common::context(&python, dir.path(), common::FakeManager::new(true));

    let first = ctx.coordinator.execute("s", "x = 42", None).await.unwrap();
    assert_eq!(first.outcome, ExecutionOutcome::Success);
    let second = ctx.coordinator.execute("s", "print(x)", None).await.unwrap();
    assert_eq!(second.outcome, ExecutionOutcome::Success);
    assert!(second.stdout.contains("42"));
    assert!(second.execution_count > first.execution_count);

    let value = ctx.coordinator.execute("s", "x + 1", None).await.unwrap();
    assert_eq!(value.value.as_deref(), Some("43"));

    ctx.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_missing_package_exhausts_after_three_attempts() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let manager = common::FakeManager::new(false);
    let ctx = common::context(&python, dir.path(), manager.clone());

    let report = ctx
        .recovery
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
    for record in &report.attempts {
        assert_eq!(
            record.classification,
            Some(ErrorClass::Recoverable {
                remedy: RemedyKind::MissingImport
            })
        );
    }
    assert_eq!(
        report.final_result.exception_type.as_deref(),
        Some("ModuleNotFoundError")
    );
    assert!(manager
        .calls()
        .iter()
        .all(|(pkgs, _)| pkgs == &vec!["nonexistent_pkg_xyz".to_string()]));

    ctx.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_stop_marker_ends_after_first_attempt() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let manager = common::FakeManager::new(true);
    let ctx = common::context(&python, dir.path(), manager.clone());

    let report = ctx
        .recovery
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
    assert!(report.attempts[0].remedy.is_none());
    assert!(manager.calls().is_empty());

    ctx.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_ensure_batches_packages() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let manager = common::FakeManager::new(true);
    let ctx = common::context(&python, dir.path(), manager.clone());
    ctx.registry.resolve_or_create(Some("s"), None).await.unwrap();
    ctx.coordinator.execute("s", "kept = 'still here'", None).await.unwrap();

    let packages = vec!["numpy".to_string(), "pandas".to_string()];
    let report = ctx.ensurer.ensure("s", &packages, false).await.unwrap();
    assert!(report.success);
    assert_eq!(manager.calls(), vec![(packages, false)]);

    // 安装不重启解释器
    let after = ctx.coordinator.execute("s", "print(kept)", None).await.unwrap();
    assert!(after.stdout.contains("still here"));

    ctx.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_restart_drops_state() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let ctx = common::context(&python, dir.path(), common::FakeManager::new(true));

    ctx.coordinator.execute("s", "x = 42", None).await.unwrap();
    ctx.registry.restart("s").await.unwrap();
    let result = ctx.coordinator.execute("s", "print(x)", None).await.unwrap();

    assert_eq!(result.outcome, ExecutionOutcome::Error);
    assert_eq!(result.exception_type.as_deref(), Some("NameError"));
    assert_eq!(
        classify("NameError", result.exception_message.as_deref().unwrap_or_default()),
        ErrorClass::Recoverable {
            remedy: RemedyKind::UndefinedName
        }
    );

    ctx.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_same_session_runs_in_arrival_order() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let ctx = common::context(&python, dir.path(), common::FakeManager::new(true));
    ctx.coordinator.execute("s", "import time\norder = []", None).await.unwrap();

    let mut handles = Vec::new();
    for (i, delay) in [(0, "0.4"), (1, "0"), (2, "0")] {
        let coordinator = Arc::clone(&ctx.coordinator);
        let code = format!("time.sleep({delay})\norder.append({i})");
        handles.push(tokio::spawn(async move {
            coordinator.execute("s", &code, None).await
        }));
        // 保证到达顺序
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_success());
    }

    let order = ctx.coordinator.execute("s", "order", None).await.unwrap();
    assert_eq!(order.value.as_deref(), Some("[0, 1, 2]"));

    ctx.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_sessions_run_independently() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let ctx = common::context(&python, dir.path(), common::FakeManager::new(true));
    ctx.coordinator.execute("slow", "import time", None).await.unwrap();
    ctx.coordinator.execute("fast", "y = 1", None).await.unwrap();

    let coordinator = Arc::clone(&ctx.coordinator);
    let slow = tokio::spawn(async move { coordinator.execute("slow", "time.sleep(1.5)", None).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fast = ctx.coordinator.execute("fast", "y + 1", None).await.unwrap();
    assert_eq!(fast.value.as_deref(), Some("2"));
    assert!(!slow.is_finished());
    assert!(slow.await.unwrap().unwrap().is_success());

    // 会话之间不共享状态
    let isolated = ctx.coordinator.execute("slow", "y", None).await.unwrap();
    assert_eq!(isolated.exception_type.as_deref(), Some("NameError"));

    ctx.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_timeout_leaves_interpreter_running() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let ctx = common::context(&python, dir.path(), common::FakeManager::new(true));

    let timed_out = ctx
        .coordinator
        .execute("s", "import time\ntime.sleep(1)\nlate = True", Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(timed_out.outcome, ExecutionOutcome::Timeout);

    // 下一次调用排在未完成的计算之后，迟到的结果被丢弃
    let next = ctx.coordinator.execute("s", "late", None).await.unwrap();
    assert_eq!(next.value.as_deref(), Some("True"));

    let report = ctx
        .recovery
        .run(ExecutionRequest::new("s", "time.sleep(1)").with_timeout(Some(Duration::from_millis(100))))
        .await
        .unwrap();
    assert!(matches!(
        report.status,
        RecoveryStatus::Unrecoverable {
            reason: UnrecoverableReason::Timeout,
            ..
        }
    ));
    assert_eq!(report.attempts.len(), 1);

    ctx.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_dead_interpreter_is_replaced_on_next_use() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let ctx = common::context(&python, dir.path(), common::FakeManager::new(true));

    ctx.coordinator.execute("s", "x = 1", None).await.unwrap();
    let died = ctx
        .coordinator
        .execute("s", "import os\nos._exit(3)", None)
        .await
        .unwrap();
    assert_eq!(died.outcome, ExecutionOutcome::Error);
    assert_eq!(died.exception_type.as_deref(), Some("KernelDiedError"));

    let fresh = ctx.coordinator.execute("s", "print('back')", None).await.unwrap();
    assert!(fresh.stdout.contains("back"));
    let lost = ctx.coordinator.execute("s", "x", None).await.unwrap();
    assert_eq!(lost.exception_type.as_deref(), Some("NameError"));

    ctx.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let ctx = common::context(&python, dir.path(), common::FakeManager::new(true));

    ctx.coordinator.execute("s", "x = 1", None).await.unwrap();
    assert!(ctx.registry.shutdown("s").await);
    assert!(!ctx.registry.shutdown("s").await);
    assert!(matches!(
        ctx.registry.restart("s").await,
        Err(KernelError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_output_is_captured_and_capped() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = common::config(&python, dir.path());
    cfg.kernel.max_output_bytes = 100;
    let ctx = kernel_daemon::ToolContext::new(&cfg, common::FakeManager::new(true));

    let result = ctx
        .coordinator
        .execute(
            "s",
            "import sys\nprint('a' * 1000)\nprint('warn', file=sys.stderr)",
            None,
        )
        .await
        .unwrap();
    assert!(result.truncated);
    assert!(result.stdout.starts_with(&"a".repeat(100)));
    assert!(result.stdout.contains("output truncated"));
    assert_eq!(result.stderr.trim(), "warn");

    ctx.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_unstartable_interpreter_is_infrastructure_error() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = common::context(
        std::path::Path::new("/nonexistent/bin/python"),
        dir.path(),
        common::FakeManager::new(true),
    );
    let err = ctx.coordinator.execute("s", "1", None).await.unwrap_err();
    assert!(matches!(err, KernelError::ProcessStartFailed(_)));
    assert!(err.is_infrastructure());
}

#[tokio::test]
async fn test_lone_surrogate_output_comes_back_escaped() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let ctx = common::context(&python, dir.path(), common::FakeManager::new(true));

    let result = ctx
        .coordinator
        .execute("s", "print('\\ud800')", Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(result.outcome, ExecutionOutcome::Success);
    assert!(result.stdout.contains("\\ud800"), "{:?}", result.stdout);

    // 通道仍然同步，后续请求照常
    let next = ctx.coordinator.execute("s", "1 + 1", None).await.unwrap();
    assert_eq!(next.value.as_deref(), Some("2"));

    ctx.registry.shutdown_all().await;
}

#[tokio::test]
async fn test_error_text_is_capped() {
    let python = python_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = common::config(&python, dir.path());
    cfg.kernel.max_output_bytes = 100;
    let ctx = kernel_daemon::ToolContext::new(&cfg, common::FakeManager::new(true));

    let result = ctx
        .coordinator
        .execute("s", "raise ValueError('x' * 5000)", None)
        .await
        .unwrap();
    assert_eq!(result.outcome, ExecutionOutcome::Error);
    assert!(result.truncated);
    assert!(result.exception_message.as_ref().unwrap().len() < 300);
    let traceback_bytes: usize = result.traceback.iter().map(String::len).sum();
    assert!(traceback_bytes < 400, "{traceback_bytes}");

    ctx.registry.shutdown_all().await;
}
