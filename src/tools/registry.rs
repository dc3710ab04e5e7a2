//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找，
//! ToolExecutor 在调用时加超时并写审计日志。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// 工具 trait：名称、描述、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（请求中的 "tool" 字段）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认表示无参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；Ok 为返回给调用方的内容（通常是 JSON 文本）
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 由参数结构体派生 schema
pub fn schema_of<T: JsonSchema>() -> Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null)
}

/// 解析参数；缺省的 args（null）按空对象处理
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {e}"))
}

/// 把结果序列化成返回内容
pub fn to_content<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("Serialize result failed: {e}"))
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，名字有序，输出稳定
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<String, String> {
        let tool = self.tools.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 每个工具的名称、描述与参数 schema
    pub fn schema_value(&self) -> Value {
        Value::Array(
            self.tools
                .iter()
                .map(|(name, tool)| {
                    serde_json::json!({
                        "name": name,
                        "description": tool.description(),
                        "parameters": tool.parameters_schema()
                    })
                })
                .collect(),
        )
    }

    pub fn to_schema_json(&self) -> String {
        serde_json::to_string_pretty(&self.schema_value()).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, JsonSchema)]
    struct EchoArgs {
        /// 要回显的文本
        text: String,
    }

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo text back"
        }

        fn parameters_schema(&self) -> Value {
            schema_of::<EchoArgs>()
        }

        async fn execute(&self, args: Value) -> Result<String, String> {
            let args: EchoArgs = parse_args(args)?;
            Ok(args.text)
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo);
        assert_eq!(
            registry.execute("echo", serde_json::json!({"text": "hi"})).await.unwrap(),
            "hi"
        );
        assert!(registry.execute("nope", Value::Null).await.unwrap_err().contains("Unknown tool"));
        assert!(registry.execute("echo", Value::Null).await.unwrap_err().contains("Invalid arguments"));
    }

    #[test]
    fn test_schema_lists_parameters() {
        let mut registry = ToolRegistry::new();
        registry.register(Echo);
        let schema = registry.schema_value();
        assert_eq!(schema[0]["name"], "echo");
        assert!(schema[0]["parameters"]["properties"]["text"].is_object());
    }
}
