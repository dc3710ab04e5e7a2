//! 核心层：错误类型、错误分类、恢复循环、优雅关闭

pub mod classifier;
pub mod error;
pub mod recovery;
pub mod shutdown;

pub use classifier::{analyze, classify, ErrorAnalysis, ErrorClass, RemedyKind, UnrecoverableReason};
pub use error::KernelError;
pub use recovery::{
    AppliedRemedy, AttemptRecord, CodeRunner, PackageInstaller, RecoveryLoop, RecoveryPolicy,
    RecoveryReport, RecoveryStatus,
};
pub use shutdown::{RegistryCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
