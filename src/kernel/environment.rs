//! Python 环境发现
//!
//! 优先级：显式配置的解释器 > 从工作目录向上找到的 `.venv` > PATH 上的 python3 / python。
//! 环境只决定启动哪个解释器，不影响执行协议。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

const PYTHON_PROGRAM: &str = "python3";
const PYTHON_PROGRAM_FALLBACK: &str = "python";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    /// 配置里显式指定
    Override,
    /// 项目隔离环境（.venv）
    Venv,
    /// 系统解释器
    System,
}

#[derive(Debug, Clone, Serialize)]
pub struct PythonEnvironment {
    pub interpreter: PathBuf,
    pub venv: Option<PathBuf>,
    pub kind: EnvironmentKind,
}

impl PythonEnvironment {
    pub fn discover(working_dir: &Path, override_python: Option<&Path>) -> Self {
        if let Some(python) = override_python {
            return Self {
                interpreter: python.to_path_buf(),
                venv: None,
                kind: EnvironmentKind::Override,
            };
        }
        if let Some((venv, interpreter)) = find_venv(working_dir) {
            return Self {
                interpreter,
                venv: Some(venv),
                kind: EnvironmentKind::Venv,
            };
        }
        let interpreter = find_program_on_path(PYTHON_PROGRAM)
            .or_else(|| find_program_on_path(PYTHON_PROGRAM_FALLBACK))
            .unwrap_or_else(|| PathBuf::from(PYTHON_PROGRAM));
        Self {
            interpreter,
            venv: None,
            kind: EnvironmentKind::System,
        }
    }

    /// 解释器路径是否指向存在的文件（裸命令名交给 spawn 去报错）
    pub fn is_valid(&self) -> bool {
        match self.kind {
            EnvironmentKind::System if self.interpreter.components().count() == 1 => true,
            _ => self.interpreter.is_file(),
        }
    }

    /// venv 的可执行目录，启动时前置到 PATH
    pub fn bin_dir(&self) -> Option<PathBuf> {
        self.interpreter.parent().map(Path::to_path_buf).filter(|_| self.venv.is_some())
    }
}

/// 从 start 向上查找 `.venv`，返回 (venv 目录, 解释器路径)
pub fn find_venv(start: &Path) -> Option<(PathBuf, PathBuf)> {
    for dir in start.ancestors() {
        let venv = dir.join(".venv");
        for candidate in [
            venv.join("bin").join("python"),
            venv.join("bin").join("python3"),
            venv.join("Scripts").join("python.exe"),
        ] {
            if candidate.is_file() {
                return Some((venv, candidate));
            }
        }
    }
    None
}

fn find_program_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if !candidate.is_file() {
            continue;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(&candidate) {
                if meta.permissions().mode() & 0o111 != 0 {
                    return Some(candidate);
                }
            }
        }

        #[cfg(not(unix))]
        {
            return Some(candidate);
        }
    }
    None
}

/// 项目要求的 Python 版本：`.python-version` 优先，其次 pyproject.toml 的 requires-python
pub fn requested_python_version(working_dir: &Path) -> Option<String> {
    if let Ok(text) = std::fs::read_to_string(working_dir.join(".python-version")) {
        let version = text.trim();
        if !version.is_empty() {
            return Some(version.to_string());
        }
    }
    let text = std::fs::read_to_string(working_dir.join("pyproject.toml")).ok()?;
    let doc: toml::Value = toml::from_str(&text).ok()?;
    let requirement = doc.get("project")?.get("requires-python")?.as_str()?;
    extract_major_minor(requirement)
}

/// ">=3.11,<4" -> "3.11"
fn extract_major_minor(requirement: &str) -> Option<String> {
    let start = requirement.find(|c: char| c.is_ascii_digit())?;
    let rest = &requirement[start..];
    let mut parts = rest.split('.');
    let major = parts.next()?;
    let minor: String = parts.next()?.chars().take_while(|c| c.is_ascii_digit()).collect();
    (!minor.is_empty()).then(|| format!("{major}.{minor}"))
}

/// uv 是否可用（`uv --version` 5 秒内成功）
pub async fn uv_available(program: &str) -> bool {
    let check = Command::new(program).arg("--version").output();
    matches!(
        tokio::time::timeout(Duration::from_secs(5), check).await,
        Ok(Ok(output)) if output.status.success()
    )
}

/// initialize 返回给调用方的环境描述
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentInfo {
    pub working_dir: PathBuf,
    pub interpreter: PathBuf,
    pub venv: Option<PathBuf>,
    pub kind: EnvironmentKind,
    pub python_version: Option<String>,
    pub requested_python: Option<String>,
    pub uv_available: bool,
    pub pyproject: bool,
    pub uv_lock: bool,
}

impl EnvironmentInfo {
    pub async fn collect(
        working_dir: &Path,
        env: &PythonEnvironment,
        python_version: Option<String>,
        uv_program: &str,
    ) -> Self {
        Self {
            working_dir: working_dir.to_path_buf(),
            interpreter: env.interpreter.clone(),
            venv: env.venv.clone(),
            kind: env.kind,
            python_version,
            requested_python: requested_python_version(working_dir),
            uv_available: uv_available(uv_program).await,
            pyproject: working_dir.join("pyproject.toml").is_file(),
            uv_lock: working_dir.join("uv.lock").is_file(),
        }
    }
}

/// `python --version` 的输出（如 "3.12.1"）；起不来则为 None
pub async fn interpreter_version(interpreter: &Path) -> Option<String> {
    let check = Command::new(interpreter).arg("--version").output();
    let output = tokio::time::timeout(Duration::from_secs(5), check).await.ok()?.ok()?;
    if !output.status.success() {
        return None;
    }
    // 老版本把版本号写到 stderr
    let text = if output.stdout.is_empty() {
        String::from_utf8_lossy(&output.stderr).into_owned()
    } else {
        String::from_utf8_lossy(&output.stdout).into_owned()
    };
    text.trim().strip_prefix("Python ").map(str::to_string)
}

/// "3.12.1" 是否满足 "3.12"
fn version_matches(actual: &str, requested: &str) -> bool {
    actual == requested || actual.starts_with(&format!("{requested}."))
}

#[derive(Debug, Clone, Serialize)]
pub struct SetupChecks {
    pub uv_installed: bool,
    pub venv_exists: bool,
    pub pyproject_exists: bool,
    pub uv_lock_exists: bool,
    pub interpreter_found: bool,
    pub interpreter_starts: bool,
}

/// validate_setup 的返回：逐项检查结果与修复建议
#[derive(Debug, Clone, Serialize)]
pub struct SetupReport {
    pub working_dir: PathBuf,
    pub interpreter: PathBuf,
    pub checks: SetupChecks,
    pub python_version: Option<String>,
    pub requested_python: Option<String>,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub is_valid: bool,
}

impl SetupReport {
    /// 不启动会话，只看文件系统与解释器本身
    pub async fn check(working_dir: &Path, env: &PythonEnvironment, uv_program: &str) -> Self {
        let mut issues = Vec::new();
        let mut suggestions = Vec::new();

        if !working_dir.is_dir() {
            issues.push(format!("Working directory does not exist: {}", working_dir.display()));
        }

        let uv_installed = uv_available(uv_program).await;
        if !uv_installed {
            issues.push(format!("uv not found ({uv_program})"));
            suggestions.push("Install uv: curl -LsSf https://astral.sh/uv/install.sh | sh".to_string());
        }

        let pyproject_exists = working_dir.join("pyproject.toml").is_file();
        if !pyproject_exists {
            issues.push("No pyproject.toml in working directory".to_string());
            suggestions.push("Create a project with `uv init`".to_string());
        }

        let uv_lock_exists = working_dir.join("uv.lock").is_file();
        if pyproject_exists && !uv_lock_exists {
            issues.push("No uv.lock; dependencies are not pinned".to_string());
            suggestions.push("Run `uv lock` to create the lockfile".to_string());
        }

        let venv_exists = env.venv.is_some();
        if !venv_exists && env.kind != EnvironmentKind::Override {
            issues.push("No .venv found; code would run on the system interpreter".to_string());
            suggestions.push("Run `uv sync` (or `uv venv`) to create the project environment".to_string());
        }

        let interpreter_found = env.is_valid();
        let python_version = if interpreter_found {
            interpreter_version(&env.interpreter).await
        } else {
            None
        };
        let interpreter_starts = python_version.is_some();
        if !interpreter_found {
            issues.push(format!("Interpreter not found: {}", env.interpreter.display()));
        } else if !interpreter_starts {
            issues.push(format!("Interpreter does not start: {}", env.interpreter.display()));
            suggestions.push("Recreate the environment with `uv venv --clear`".to_string());
        }

        let requested_python = requested_python_version(working_dir);
        if let (Some(actual), Some(requested)) = (&python_version, &requested_python) {
            if !version_matches(actual, requested) {
                issues.push(format!("Python {actual} does not match requested {requested}"));
                suggestions.push(format!("Run `uv python install {requested}` then `uv sync`"));
            }
        }

        Self {
            working_dir: working_dir.to_path_buf(),
            interpreter: env.interpreter.clone(),
            checks: SetupChecks {
                uv_installed,
                venv_exists,
                pyproject_exists,
                uv_lock_exists,
                interpreter_found,
                interpreter_starts,
            },
            python_version,
            requested_python,
            is_valid: issues.is_empty(),
            issues,
            suggestions,
        }
    }
}
