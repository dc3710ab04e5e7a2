//! kernel-daemon 入口
//!
//! 初始化日志、加载配置、组装会话注册表与工具，然后在 stdin/stdout 上服务换行分隔的 JSON 请求。
//! 用法：`kernel-daemon [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use kernel_daemon::config::{load_config, AppConfig};
use kernel_daemon::core::shutdown::run_with_graceful_shutdown;
use kernel_daemon::core::{RegistryCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use kernel_daemon::observability;
use kernel_daemon::server::serve;
use kernel_daemon::tools::{build_registry, ToolContext, ToolExecutor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志写 stderr：默认 info，可通过 RUST_LOG 覆盖
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "invalid config, falling back to defaults");
            AppConfig::default()
        }
    };

    let ctx = Arc::new(ToolContext::with_uv(&cfg));
    let tools = build_registry(Arc::clone(&ctx));
    tracing::info!(tools = ?tools.tool_names(), working_dir = %ctx.registry.default_working_dir().display(), "kernel daemon ready");
    let executor = Arc::new(ToolExecutor::new(tools, cfg.tools.call_timeout_secs));

    let shutdown = Arc::new(ShutdownManager::new());
    let mut cleanup = ShutdownCoordinator::new(Arc::clone(&shutdown)).with_timeout(30);
    cleanup.register(RegistryCleanup::new(Arc::clone(&ctx.registry)));

    let token = shutdown.token();
    let on_input_closed = Arc::clone(&shutdown);
    let app = async move {
        match serve(executor, tokio::io::stdin(), tokio::io::stdout(), token).await {
            Ok(()) => on_input_closed.shutdown(ShutdownReason::InputClosed),
            Err(e) => {
                tracing::error!(error = %e, "server stopped");
                on_input_closed.shutdown(ShutdownReason::FatalError(e.to_string()));
            }
        }
    };

    run_with_graceful_shutdown(shutdown, app, || async move { cleanup.run_cleanup().await }).await;

    // 信号触发时 stdin 的阻塞读取线程仍在等待输入，直接退出而不是等运行时回收它
    std::process::exit(0)
}
