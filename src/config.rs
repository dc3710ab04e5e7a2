//! 守护进程配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `KERNEL_DAEMON__*` 覆盖（双下划线表示嵌套，如 `KERNEL_DAEMON__KERNEL__PYTHON=/usr/bin/python3`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub kernel: KernelSection,
    pub recovery: RecoverySection,
    pub dependencies: DependenciesSection,
    pub tools: ToolsSection,
}

/// [app] 段：默认工作目录
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppSection {
    /// 未指定 working_dir 的会话使用该目录，未设置时用进程当前目录
    pub workspace_root: Option<PathBuf>,
}

impl AppSection {
    pub fn default_working_dir(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// [kernel] 段：解释器路径、启动/执行超时、输出上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelSection {
    /// 显式指定解释器；不设置时按 .venv → PATH 顺序查找
    pub python: Option<PathBuf>,
    pub startup_timeout_secs: u64,
    /// execute_cell 未传 timeout 时的默认值（秒）
    pub execution_timeout_secs: u64,
    /// stdout / stderr / 返回值各自的字节上限
    pub max_output_bytes: usize,
    pub stop_timeout_secs: u64,
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            python: None,
            startup_timeout_secs: 30,
            execution_timeout_secs: 120,
            max_output_bytes: 1024 * 1024,
            stop_timeout_secs: 5,
        }
    }
}

impl KernelSection {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs.max(1))
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// [recovery] 段：重试上限与自动安装开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    pub max_attempts: u32,
    /// missing-import 时是否自动调用依赖安装
    pub auto_install: bool,
    /// 成功时也返回完整尝试记录
    pub verbose: bool,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            auto_install: true,
            verbose: false,
        }
    }
}

/// [dependencies] 段：uv 可执行文件与安装超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DependenciesSection {
    pub uv_program: String,
    pub install_timeout_secs: u64,
}

impl Default for DependenciesSection {
    fn default() -> Self {
        Self {
            uv_program: "uv".to_string(),
            install_timeout_secs: 600,
        }
    }
}

/// [tools] 段：单次工具调用的外层超时（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub call_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            call_timeout_secs: 900,
        }
    }
}

/// 从 config 目录加载配置，环境变量 KERNEL_DAEMON__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 KERNEL_DAEMON__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignored");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("KERNEL_DAEMON")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
