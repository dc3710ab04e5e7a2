//! 与解释器驱动脚本之间的换行分隔 JSON 协议
//!
//! 请求：`{"id": n, "op": "execute"|"inspect"|"describe"|"last_error"|"packages"|"shutdown", "code": "..."}`
//! 响应：先一条 `ready` 握手，之后每个请求一条 `result`；id 即句柄的执行计数。
//! 驱动在发送前把孤立代理项等无法编码为 UTF-8 的字符转成 `\udXXX` 文本，所以每一行都是合法 JSON。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverOp {
    Execute,
    Inspect,
    /// 描述单个变量，`code` 为变量名
    Describe,
    /// 最近一次执行失败的异常与现场
    LastError,
    /// 解释器里已安装的发行包
    Packages,
    Shutdown,
}

#[derive(Debug, Serialize)]
pub struct DriverRequest<'a> {
    pub id: u64,
    pub op: DriverOp,
    pub code: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub detailed: bool,
}

impl<'a> DriverRequest<'a> {
    pub fn new(id: u64, op: DriverOp, code: &'a str) -> Self {
        Self {
            id,
            op,
            code,
            detailed: false,
        }
    }

    pub fn with_detail(mut self, detailed: bool) -> Self {
        self.detailed = detailed;
        self
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawStatus {
    Ok,
    Error,
}

/// 驱动脚本回传的一次执行结果（未截断）
#[derive(Debug, Clone, Deserialize)]
pub struct RawOutcome {
    pub id: u64,
    pub status: RawStatus,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// 末尾表达式的 repr
    #[serde(default)]
    pub value: Option<String>,
    /// display() 产生的 MIME bundle，原样转交
    #[serde(default)]
    pub displays: Vec<Value>,
    #[serde(default)]
    pub ename: Option<String>,
    #[serde(default)]
    pub evalue: Option<String>,
    #[serde(default)]
    pub traceback: Vec<String>,
    /// inspect 操作的结果
    #[serde(default)]
    pub namespace: Option<Map<String, Value>>,
    /// describe 操作的结果
    #[serde(default)]
    pub variable: Option<Value>,
    /// last_error 操作的结果；没有失败记录时为 null
    #[serde(default)]
    pub last_error: Option<RawError>,
    #[serde(default)]
    pub packages: Option<Vec<String>>,
}

/// 驱动保存的最近一次失败：异常、用户帧 traceback、出错帧的局部变量摘要
#[derive(Debug, Clone, Deserialize)]
pub struct RawError {
    pub ename: String,
    #[serde(default)]
    pub evalue: String,
    #[serde(default)]
    pub traceback: Vec<String>,
    #[serde(default)]
    pub locals: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverMessage {
    Ready {
        python_version: String,
        executable: String,
        pid: u32,
    },
    Result(RawOutcome),
    ProtocolError {
        message: String,
    },
}

impl DriverMessage {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
