//! 换行分隔 JSON 的请求循环
//!
//! 请求：`{"id": ..., "tool": "execute_cell", "args": {...}}`，响应：`{"id": ..., "ok": bool, "content": ...}`。
//! 每个请求在独立任务里执行，响应由唯一的写任务输出。带 session_id 的请求按到达顺序
//! 串成链：后一个等前一个结束才开始，所以同一会话的响应顺序与请求顺序一致；不同会话并行。
//! 工具 panic 也会得到一条 `ok: false` 响应，不会让调用方一直等。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Context;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::tools::ToolExecutor;

#[derive(Debug, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolRequest {
    fn session_key(&self) -> Option<String> {
        self.args
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub id: Value,
    pub ok: bool,
    pub content: Value,
}

impl ToolResponse {
    fn from_result(id: Value, result: Result<String, String>) -> Self {
        match result {
            Ok(content) => Self {
                id,
                ok: true,
                content: embed(content),
            },
            Err(message) => Self {
                id,
                ok: false,
                content: Value::String(message),
            },
        }
    }
}

/// 工具输出是 JSON 文本时原样嵌入，否则作为字符串
fn embed(content: String) -> Value {
    match serde_json::from_str::<Value>(&content) {
        Ok(value) => value,
        Err(_) => Value::String(content),
    }
}

/// 丢掉已结束（已发送或已中止）的链尾，只留仍在执行的
fn prune_drained(tails: &mut HashMap<String, oneshot::Receiver<()>>) {
    tails.retain(|_, tail| matches!(tail.try_recv(), Err(TryRecvError::Empty)));
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// 处理请求直到输入 EOF 或 token 被取消。EOF 时等待已在执行的请求写完响应
pub async fn serve<R, W>(
    executor: Arc<ToolExecutor>,
    input: R,
    output: W,
    token: CancellationToken,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<ToolResponse>();
    let writer = tokio::spawn(write_responses(output, rx));

    let mut lines = BufReader::new(input).lines();
    let mut tasks = JoinSet::new();
    let mut tails: HashMap<String, oneshot::Receiver<()>> = HashMap::new();

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => {
                tracing::info!("server cancelled, aborting in-flight requests");
                tasks.abort_all();
                break;
            }
            line = lines.next_line() => line.context("read request")?,
        };
        let Some(line) = line else {
            tracing::info!("input closed");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: ToolRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                let _ = tx.send(ToolResponse {
                    id: Value::Null,
                    ok: false,
                    content: Value::String(format!("Invalid request: {e}")),
                });
                continue;
            }
        };

        let previous = match request.session_key() {
            Some(key) => {
                prune_drained(&mut tails);
                let (done_tx, done_rx) = oneshot::channel();
                let previous = tails.insert(key, done_rx);
                Some((previous, done_tx))
            }
            None => None,
        };

        let executor = Arc::clone(&executor);
        let tx = tx.clone();
        tasks.spawn(async move {
            let done = match previous {
                Some((previous, done_tx)) => {
                    if let Some(previous) = previous {
                        // 前一个请求被中止时 Err，同样放行
                        let _ = previous.await;
                    }
                    Some(done_tx)
                }
                None => None,
            };
            let call = AssertUnwindSafe(executor.execute(&request.tool, request.args)).catch_unwind();
            let result = match call.await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(tool = %request.tool, panic = %message, "tool panicked");
                    Err(format!("Tool {} panicked: {message}", request.tool))
                }
            };
            let _ = tx.send(ToolResponse::from_result(request.id, result));
            if let Some(done) = done {
                let _ = done.send(());
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "request task failed");
            }
        }
    }
    drop(tx);
    writer.await.context("response writer panicked")??;
    Ok(())
}

async fn write_responses<W>(mut output: W, mut rx: mpsc::UnboundedReceiver<ToolResponse>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_string(&response).context("serialize response")?;
        line.push('\n');
        output.write_all(line.as_bytes()).await.context("write response")?;
        output.flush().await.context("flush response")?;
    }
    Ok(())
}
