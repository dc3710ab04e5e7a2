//! 会话层：注册表（会话 ↔ 解释器句柄）与执行协调器（按会话串行执行）

pub mod coordinator;
pub mod registry;

pub use coordinator::{
    ExecutionCoordinator, ExecutionOutcome, ExecutionRequest, ExecutionResult, LastError,
    KERNEL_DIED,
};
pub use registry::{
    validate_session_id, KernelGuard, KernelState, Session, SessionId, SessionRegistry,
    SessionStatus,
};
