//! 基于 uv 的包管理器
//!
//! 有 pyproject.toml 时走 `uv add [--dev]`（写入项目依赖并同步 .venv）；
//! 只有 .venv 时走 `uv pip install --python <venv 解释器>`。
//! 两者都没有则拒绝安装，不往系统解释器里装包。
//! 同步走 `uv sync [--upgrade]`，要求项目已有锁文件。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use super::{InstallOutput, InstallTarget, PackageManager};

const OUTPUT_TAIL_BYTES: usize = 4000;

pub struct UvPackageManager {
    program: String,
    timeout: Duration,
}

impl UvPackageManager {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// 组装参数；没有隔离环境时返回 None
    fn args(&self, target: &InstallTarget<'_>, packages: &[String], dev: bool) -> Option<Vec<String>> {
        let mut args = Vec::new();
        if target.working_dir.join("pyproject.toml").is_file() {
            args.push("add".to_string());
            if dev {
                args.push("--dev".to_string());
            }
        } else if target.environment.venv.is_some() {
            args.extend(["pip", "install", "--python"].map(String::from));
            args.push(target.environment.interpreter.display().to_string());
        } else {
            return None;
        }
        args.extend(packages.iter().cloned());
        Some(args)
    }

    fn sync_args(upgrade: bool) -> Vec<String> {
        let mut args = vec!["sync".to_string()];
        if upgrade {
            args.push("--upgrade".to_string());
        }
        args
    }

    async fn run(&self, target: &InstallTarget<'_>, args: &[String]) -> InstallOutput {
        let started = Instant::now();
        let command = format!("{} {}", self.program, args.join(" "));
        tracing::info!(command = %command, working_dir = %target.working_dir.display(), "running uv");

        let mut cmd = Command::new(&self.program);
        cmd.args(args).current_dir(target.working_dir).kill_on_drop(true);
        if let Some(venv) = &target.environment.venv {
            cmd.env("VIRTUAL_ENV", venv);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return InstallOutput::failed(command, format!("failed to run {}: {e}", self.program)),
            Err(_) => return InstallOutput::failed(command, format!("uv timed out after {:?}", self.timeout)),
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        InstallOutput {
            success: output.status.success(),
            command,
            output: tail(&text, OUTPUT_TAIL_BYTES),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[async_trait]
impl PackageManager for UvPackageManager {
    fn name(&self) -> &str {
        "uv"
    }

    async fn install(&self, target: &InstallTarget<'_>, packages: &[String], dev: bool) -> InstallOutput {
        let Some(args) = self.args(target, packages, dev) else {
            return InstallOutput::failed(
                String::new(),
                "no isolated environment: create one with `uv init` or `uv venv` in the working directory",
            );
        };
        self.run(target, &args).await
    }

    async fn sync(&self, target: &InstallTarget<'_>, upgrade: bool) -> InstallOutput {
        self.run(target, &Self::sync_args(upgrade)).await
    }
}

/// 保留末尾 max 字节（uv 的错误信息在最后）
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.trim_end().to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", text[start..].trim_end())
}
