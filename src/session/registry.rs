//! 会话注册表
//!
//! 会话 ID → 会话；每个会话至多持有一个解释器句柄，且句柄从不在会话之间共享。
//! 映射表的锁只在查找/插入/删除时短暂持有，执行期间持有的是会话自己的锁。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::core::KernelError;
use crate::kernel::{InterpreterProcess, KernelLauncher};

/// 会话 ID（调用方提供或自动生成的不透明字符串）
pub type SessionId = String;

const MAX_SESSION_ID_LEN: usize = 128;

/// 会话 ID 格式：非空、不超过 128 字符、仅含 `[A-Za-z0-9_.:-]`
pub fn validate_session_id(id: &str) -> Result<(), KernelError> {
    let ok = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
    if ok {
        Ok(())
    } else {
        Err(KernelError::InvalidSessionId(id.to_string()))
    }
}

fn generate_session_id() -> SessionId {
    format!("session_{}", uuid::Uuid::new_v4())
}

/// 会话锁保护的句柄槽位
#[derive(Default)]
pub struct KernelSlot {
    process: Option<InterpreterProcess>,
    /// 会话已 shutdown；排在后面的请求据此拿到 SessionNotFound
    closed: bool,
}

/// 单个会话
pub struct Session {
    pub id: SessionId,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    last_activity: StdMutex<DateTime<Utc>>,
    slot: Mutex<KernelSlot>,
    launcher: Arc<KernelLauncher>,
}

impl Session {
    fn new(id: SessionId, working_dir: PathBuf, launcher: Arc<KernelLauncher>) -> Self {
        let now = Utc::now();
        Self {
            id,
            working_dir,
            created_at: now,
            last_activity: StdMutex::new(now),
            slot: Mutex::new(KernelSlot::default()),
            launcher,
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
            .lock()
            .map(|t| *t)
            .unwrap_or(self.created_at)
    }

    pub fn touch(&self) {
        if let Ok(mut t) = self.last_activity.lock() {
            *t = Utc::now();
        }
    }

    /// 获取会话锁。tokio Mutex 按到达顺序唤醒等待者，这就是同一会话内的 FIFO
    pub async fn lock(&self) -> Result<KernelGuard<'_>, KernelError> {
        let slot = self.slot.lock().await;
        if slot.closed {
            return Err(KernelError::SessionNotFound(self.id.clone()));
        }
        Ok(KernelGuard { session: self, slot })
    }

    /// 不等待的状态快照；会话正忙时只报告 busy
    pub fn status(&self) -> SessionStatus {
        let mut status = SessionStatus {
            session_id: self.id.clone(),
            working_dir: self.working_dir.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            state: KernelState::NotStarted,
            execution_count: None,
            interpreter: None,
            python_version: None,
            pid: None,
        };
        let Ok(mut slot) = self.slot.try_lock() else {
            status.state = KernelState::Busy;
            return status;
        };
        if let Some(process) = slot.process.as_mut() {
            status.state = if process.is_alive() {
                KernelState::Idle
            } else {
                KernelState::Dead
            };
            status.execution_count = Some(process.execution_count());
            status.interpreter = Some(process.environment().interpreter.clone());
            status.python_version = Some(process.info().python_version.clone());
            status.pid = Some(process.info().pid);
        }
        status
    }
}

/// 持有会话锁期间对句柄的访问
pub struct KernelGuard<'a> {
    session: &'a Session,
    slot: MutexGuard<'a, KernelSlot>,
}

impl KernelGuard<'_> {
    /// 当前句柄（可能已死，不会启动新进程）
    pub fn current(&mut self) -> Option<&mut InterpreterProcess> {
        self.slot.process.as_mut()
    }

    /// 取存活句柄；没有或已死则用同一工作目录重新启动
    pub async fn process(&mut self) -> Result<&mut InterpreterProcess, KernelError> {
        let alive = self
            .slot
            .process
            .as_mut()
            .map(InterpreterProcess::is_alive)
            .unwrap_or(false);
        if !alive {
            if let Some(mut dead) = self.slot.process.take() {
                tracing::warn!(session = %self.session.id, "interpreter found dead, starting a new one");
                dead.stop(self.session.launcher.stop_timeout).await;
            }
            let process = self.session.launcher.start(&self.session.working_dir).await?;
            self.slot.process = Some(process);
        }
        self.slot
            .process
            .as_mut()
            .ok_or_else(|| KernelError::Channel("interpreter slot empty after start".to_string()))
    }

    /// 停掉当前句柄并启动新的；之前的解释器状态全部丢失
    pub async fn restart(&mut self) -> Result<&mut InterpreterProcess, KernelError> {
        self.stop_process().await;
        self.process().await
    }

    async fn stop_process(&mut self) {
        if let Some(mut process) = self.slot.process.take() {
            process.stop(self.session.launcher.stop_timeout).await;
        }
    }

    async fn close(&mut self) {
        self.stop_process().await;
        self.slot.closed = true;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    NotStarted,
    Idle,
    Busy,
    Dead,
}

/// kernel_status 返回的会话描述
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: KernelState,
    pub execution_count: Option<u64>,
    pub interpreter: Option<PathBuf>,
    pub python_version: Option<String>,
    pub pid: Option<u32>,
}

async fn close(session: &Session) {
    // 已关闭的会话 lock 返回 Err，此时无事可做
    if let Ok(mut guard) = session.lock().await {
        guard.close().await;
    }
}

/// 会话注册表：显式构造、显式传递，测试里可以同时存在多个互不相干的实例
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    launcher: Arc<KernelLauncher>,
    default_working_dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(launcher: KernelLauncher, default_working_dir: PathBuf) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            launcher: Arc::new(launcher),
            default_working_dir,
        }
    }

    pub fn launcher(&self) -> &KernelLauncher {
        &self.launcher
    }

    pub fn default_working_dir(&self) -> &Path {
        &self.default_working_dir
    }

    /// 相对路径基于默认工作目录
    pub fn resolve_working_dir(&self, working_dir: Option<&Path>) -> PathBuf {
        match working_dir {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => self.default_working_dir.join(dir),
            None => self.default_working_dir.clone(),
        }
    }

    /// 取已有会话或登记新会话，不启动解释器。已知 ID 的 working_dir 参数被忽略
    pub async fn entry(
        &self,
        session_id: Option<&str>,
        working_dir: Option<&Path>,
    ) -> Result<Arc<Session>, KernelError> {
        let id = match session_id {
            Some(id) => {
                validate_session_id(id)?;
                id.to_string()
            }
            None => generate_session_id(),
        };

        if let Some(session) = self.sessions.read().await.get(&id) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(id.clone()).or_insert_with(|| {
            let dir = self.resolve_working_dir(working_dir);
            tracing::info!(session = %id, working_dir = %dir.display(), "session created");
            Arc::new(Session::new(id, dir, Arc::clone(&self.launcher)))
        });
        Ok(Arc::clone(session))
    }

    /// 幂等：已知且存活则原样返回；已知但句柄已死则用原工作目录重建句柄
    pub async fn resolve_or_create(
        &self,
        session_id: Option<&str>,
        working_dir: Option<&Path>,
    ) -> Result<Arc<Session>, KernelError> {
        let session = self.entry(session_id, working_dir).await?;
        {
            let mut guard = session.lock().await?;
            guard.process().await?;
        }
        session.touch();
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<Session>, KernelError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| KernelError::SessionNotFound(session_id.to_string()))
    }

    /// 停掉旧句柄并启动新句柄，会话条目保留
    pub async fn restart(&self, session_id: &str) -> Result<Arc<Session>, KernelError> {
        let session = self.get(session_id).await?;
        {
            let mut guard = session.lock().await?;
            guard.restart().await?;
        }
        session.touch();
        tracing::info!(session = %session_id, "kernel restarted");
        Ok(session)
    }

    /// 停掉句柄并删除会话；未知 ID 为空操作。返回会话此前是否存在
    pub async fn shutdown(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id);
        match removed {
            Some(session) => {
                close(&session).await;
                tracing::info!(session = %session_id, "session shut down");
                true
            }
            None => false,
        }
    }

    /// 进程退出时调用：停掉所有会话的解释器
    pub async fn shutdown_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        let count = drained.len();
        // 各会话并行停止，总耗时约为单个 stop_timeout
        join_all(drained.iter().map(|session| close(session))).await;
        if count > 0 {
            tracing::info!(count, "all sessions shut down");
        }
        count
    }

    pub async fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry(dir: &Path) -> SessionRegistry {
        let launcher = KernelLauncher {
            python_override: None,
            startup_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(1),
        };
        SessionRegistry::new(launcher, dir.to_path_buf())
    }

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("analysis-1").is_ok());
        assert!(validate_session_id("user:42.main_b").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("has space").is_err());
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id(&"a".repeat(129)).is_err());
    }

    #[tokio::test]
    async fn test_entry_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let a = reg.entry(Some("s1"), None).await.unwrap();
        let b = reg.entry(Some("s1"), Some(Path::new("/elsewhere"))).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.working_dir, dir.path());
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn test_generated_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let a = reg.entry(None, None).await.unwrap();
        let b = reg.entry(None, None).await.unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("session_"));
        assert!(validate_session_id(&a.id).is_ok());
    }

    #[tokio::test]
    async fn test_relative_working_dir_resolves_against_default() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let s = reg.entry(Some("rel"), Some(Path::new("proj"))).await.unwrap();
        assert_eq!(s.working_dir, dir.path().join("proj"));
    }

    #[tokio::test]
    async fn test_unknown_session_operations() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        assert!(matches!(
            reg.get("missing").await,
            Err(KernelError::SessionNotFound(_))
        ));
        assert!(matches!(
            reg.restart("missing").await,
            Err(KernelError::SessionNotFound(_))
        ));
        assert!(!reg.shutdown("missing").await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_held_handles() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path());
        let session = reg.entry(Some("s1"), None).await.unwrap();
        assert!(reg.shutdown("s1").await);
        assert!(!reg.shutdown("s1").await);
        assert!(matches!(
            session.lock().await,
            Err(KernelError::SessionNotFound(_))
        ));
        assert_eq!(session.status().state, KernelState::NotStarted);
    }
}
