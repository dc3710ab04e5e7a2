//! 错误分类器：按异常类型名与消息给出可恢复 / 不可恢复分类
//!
//! 映射表是 [`ExceptionKind`] 上的穷举 match，新增异常种类时编译器会强制补全规则；
//! 表外类型落入 `Unknown`，分类为不可恢复。`classify` 是全函数，不会失败。

use serde::Serialize;

/// 可恢复错误建议的补救方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemedyKind {
    MissingImport,
    UndefinedName,
    BadIndex,
    BadValue,
    MissingFile,
}

impl RemedyKind {
    /// 只有缺包可由守护进程自己修（安装依赖后原样重跑），其余都需要调用方提交新代码
    pub fn is_auto_fixable(self) -> bool {
        matches!(self, Self::MissingImport)
    }
}

/// 不可恢复的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnrecoverableReason {
    ResourceExhaustion,
    ExplicitStopSignal,
    PermissionDenied,
    RetryBudgetExhausted,
    /// 超时从不自动重试
    Timeout,
    /// 映射表之外的异常类型
    Unknown,
}

/// 分类结果：恰好二者之一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "class", rename_all = "kebab-case")]
pub enum ErrorClass {
    Recoverable { remedy: RemedyKind },
    Unrecoverable { reason: UnrecoverableReason },
}

impl ErrorClass {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable { .. })
    }
}

/// 分类器认识的异常种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    NameError,
    ImportError,
    ModuleNotFoundError,
    IndexError,
    ValueError,
    FileNotFoundError,
    MemoryError,
    RecursionError,
    PermissionError,
    KeyboardInterrupt,
    SystemExit,
    Unknown,
}

enum Rule {
    Recoverable(RemedyKind),
    /// 仅当消息非空（校验型 ValueError）时可恢复
    RecoverableWithMessage(RemedyKind),
    Unrecoverable(UnrecoverableReason),
}

impl ExceptionKind {
    pub const ALL: [ExceptionKind; 12] = [
        Self::NameError,
        Self::ImportError,
        Self::ModuleNotFoundError,
        Self::IndexError,
        Self::ValueError,
        Self::FileNotFoundError,
        Self::MemoryError,
        Self::RecursionError,
        Self::PermissionError,
        Self::KeyboardInterrupt,
        Self::SystemExit,
        Self::Unknown,
    ];

    /// Python 侧的类型名；Unknown 没有对应名字
    pub fn type_name(self) -> Option<&'static str> {
        Some(match self {
            Self::NameError => "NameError",
            Self::ImportError => "ImportError",
            Self::ModuleNotFoundError => "ModuleNotFoundError",
            Self::IndexError => "IndexError",
            Self::ValueError => "ValueError",
            Self::FileNotFoundError => "FileNotFoundError",
            Self::MemoryError => "MemoryError",
            Self::RecursionError => "RecursionError",
            Self::PermissionError => "PermissionError",
            Self::KeyboardInterrupt => "KeyboardInterrupt",
            Self::SystemExit => "SystemExit",
            Self::Unknown => return None,
        })
    }

    /// 精确、区分大小写匹配
    pub fn from_type_name(name: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.type_name() == Some(name))
            .unwrap_or(Self::Unknown)
    }

    fn rule(self) -> Rule {
        match self {
            Self::NameError => Rule::Recoverable(RemedyKind::UndefinedName),
            Self::ImportError | Self::ModuleNotFoundError => {
                Rule::Recoverable(RemedyKind::MissingImport)
            }
            Self::IndexError => Rule::Recoverable(RemedyKind::BadIndex),
            Self::ValueError => Rule::RecoverableWithMessage(RemedyKind::BadValue),
            Self::FileNotFoundError => Rule::Recoverable(RemedyKind::MissingFile),
            Self::MemoryError | Self::RecursionError => {
                Rule::Unrecoverable(UnrecoverableReason::ResourceExhaustion)
            }
            Self::PermissionError => Rule::Unrecoverable(UnrecoverableReason::PermissionDenied),
            Self::KeyboardInterrupt | Self::SystemExit => {
                Rule::Unrecoverable(UnrecoverableReason::ExplicitStopSignal)
            }
            Self::Unknown => Rule::Unrecoverable(UnrecoverableReason::Unknown),
        }
    }
}

/// 消息里任意位置出现 STOP（不区分大小写、子串匹配）即强制终止，优先于一切类型规则。
/// 因此 `stopwatch`、`STOPPED` 也会触发
pub fn has_stop_marker(message: &str) -> bool {
    message.to_ascii_lowercase().contains("stop")
}

pub fn classify(exception_type: &str, message: &str) -> ErrorClass {
    if has_stop_marker(message) {
        return ErrorClass::Unrecoverable {
            reason: UnrecoverableReason::ExplicitStopSignal,
        };
    }
    match ExceptionKind::from_type_name(exception_type).rule() {
        Rule::Recoverable(remedy) => ErrorClass::Recoverable { remedy },
        Rule::RecoverableWithMessage(remedy) if !message.trim().is_empty() => {
            ErrorClass::Recoverable { remedy }
        }
        Rule::RecoverableWithMessage(_) => ErrorClass::Unrecoverable {
            reason: UnrecoverableReason::Unknown,
        },
        Rule::Unrecoverable(reason) => ErrorClass::Unrecoverable { reason },
    }
}

/// 分类 + 给调用方看的提示
#[derive(Debug, Clone, Serialize)]
pub struct ErrorAnalysis {
    #[serde(flatten)]
    pub class: ErrorClass,
    pub exception_type: String,
    /// 缺失模块的顶层名（仅 missing-import）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_module: Option<String>,
    pub hints: Vec<String>,
}

pub fn analyze(exception_type: &str, message: &str) -> ErrorAnalysis {
    let class = classify(exception_type, message);
    let missing_module = match class {
        ErrorClass::Recoverable {
            remedy: RemedyKind::MissingImport,
        } => missing_module_name(message),
        _ => None,
    };
    let hints = hints_for(&class, message, missing_module.as_deref());
    ErrorAnalysis {
        class,
        exception_type: exception_type.to_string(),
        missing_module,
        hints,
    }
}

/// 从 `No module named 'a.b'` 中取顶层包名 `a`
pub fn missing_module_name(message: &str) -> Option<String> {
    let rest = message.split("No module named '").nth(1)?;
    let full = rest.split('\'').next()?;
    let top = full.split('.').next()?.trim();
    (!top.is_empty()).then(|| top.to_string())
}

fn first_quoted(message: &str) -> Option<&str> {
    let start = message.find(['\'', '"'])?;
    let quote = message[start..].chars().next()?;
    let rest = &message[start + 1..];
    rest.find(quote).map(|end| &rest[..end])
}

fn hints_for(class: &ErrorClass, message: &str, module: Option<&str>) -> Vec<String> {
    match class {
        ErrorClass::Recoverable { remedy } => match remedy {
            RemedyKind::MissingImport => match module {
                Some(m) => vec![
                    format!("Install the package providing '{m}' with ensure_dependencies"),
                    "Re-run the import statement after installing; no restart needed".to_string(),
                ],
                None => vec![
                    "Check that the imported name exists in the installed version".to_string(),
                ],
            },
            RemedyKind::UndefinedName => {
                let name = first_quoted(message).unwrap_or("the name");
                vec![
                    format!("Define {name} before using it, or import it"),
                    "Run the cell that defines it first".to_string(),
                ]
            }
            RemedyKind::BadIndex => vec!["Check the length before indexing".to_string()],
            RemedyKind::BadValue => vec!["Validate the input value before the call".to_string()],
            RemedyKind::MissingFile => {
                let path = first_quoted(message).unwrap_or("the file");
                vec![
                    format!("Check that {path} exists relative to the session working directory"),
                    "Use an absolute path or os.getcwd() to confirm the location".to_string(),
                ]
            }
        },
        ErrorClass::Unrecoverable { reason } => match reason {
            UnrecoverableReason::ExplicitStopSignal => {
                vec!["Execution asked to stop; hand control back to the user".to_string()]
            }
            UnrecoverableReason::ResourceExhaustion => vec![
                "Process data in smaller chunks or free large variables".to_string(),
                "restart_kernel releases all interpreter memory".to_string(),
            ],
            UnrecoverableReason::PermissionDenied => {
                vec!["The interpreter lacks permission for this operation".to_string()]
            }
            UnrecoverableReason::Timeout => vec![
                "The computation may still be running; restart_kernel to abort it".to_string(),
            ],
            UnrecoverableReason::RetryBudgetExhausted => {
                vec!["Retry budget used up; review the attempt history".to_string()]
            }
            UnrecoverableReason::Unknown => {
                vec!["Read the traceback; this error is not retried automatically".to_string()]
            }
        },
    }
}
