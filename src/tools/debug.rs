//! 调试类工具：inspect_variable / debug_last_error
//!
//! 两者都只读会话状态，不执行用户代码，要求会话已存在。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, schema_of, to_content, Tool, ToolContext};
use crate::core::analyze;

fn default_detailed() -> bool {
    true
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InspectVariableArgs {
    pub session_id: String,
    /// 全局命名空间里的变量名
    pub name: String,
    /// 附带属性、方法与 docstring
    #[serde(default = "default_detailed")]
    pub detailed: bool,
}

pub struct InspectVariableTool {
    ctx: Arc<ToolContext>,
}

impl InspectVariableTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

/// 按类型给出下一步可以执行的查看代码
fn suggestions_for(name: &str, info: &Value) -> Vec<String> {
    let type_name = info["type"].as_str().unwrap_or_default();
    match type_name {
        "DataFrame" => vec![
            format!("{name}.head()"),
            format!("{name}.describe()"),
            format!("{name}.info()"),
            format!("{name}.isna().sum()"),
        ],
        "Series" => vec![format!("{name}.value_counts()"), format!("{name}.describe()")],
        "ndarray" => vec![format!("{name}.shape, {name}.dtype"), format!("{name}[:5]")],
        "list" | "tuple" | "dict" | "set" => match info["length"].as_u64() {
            Some(len) if len > 10 => vec![format!("list({name})[:10]")],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[async_trait]
impl Tool for InspectVariableTool {
    fn name(&self) -> &str {
        "inspect_variable"
    }

    fn description(&self) -> &str {
        "Describe one variable in the session: type, size, preview, and optionally attributes, methods and docstring"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<InspectVariableArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: InspectVariableArgs = parse_args(args)?;
        let mut info = self
            .ctx
            .coordinator
            .describe(&args.session_id, &args.name, args.detailed)
            .await
            .map_err(|e| e.to_string())?;

        if info["exists"] == false {
            return to_content(&json!({
                "name": args.name,
                "exists": false,
                "suggestion": "Use inspect_namespace to list defined variables",
            }));
        }
        let suggestions = suggestions_for(&args.name, &info);
        if let Value::Object(map) = &mut info {
            if !suggestions.is_empty() {
                map.insert("suggestions".to_string(), json!(suggestions));
            }
        }
        to_content(&info)
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DebugLastErrorArgs {
    pub session_id: String,
}

pub struct DebugLastErrorTool {
    ctx: Arc<ToolContext>,
}

impl DebugLastErrorTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for DebugLastErrorTool {
    fn name(&self) -> &str {
        "debug_last_error"
    }

    fn description(&self) -> &str {
        "Show the session's most recent failure: exception, traceback, local variables at the failing frame and a fix analysis"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<DebugLastErrorArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: DebugLastErrorArgs = parse_args(args)?;
        let last = self
            .ctx
            .coordinator
            .last_error(&args.session_id)
            .await
            .map_err(|e| e.to_string())?;
        let Some(err) = last else {
            return to_content(&json!({
                "session_id": args.session_id,
                "has_error": false,
                "message": "No error recorded in this session",
            }));
        };
        let analysis = analyze(&err.exception_type, &err.exception_message);
        to_content(&json!({
            "session_id": args.session_id,
            "has_error": true,
            "exception_type": err.exception_type,
            "exception_message": err.exception_message,
            "traceback": err.traceback,
            "locals_at_error": err.locals,
            "truncated": err.truncated,
            "analysis": analysis,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detailed_defaults_on() {
        let args: InspectVariableArgs = parse_args(json!({"session_id": "s", "name": "df"})).unwrap();
        assert!(args.detailed);
    }

    #[test]
    fn test_suggestions_by_type() {
        let df = json!({"type": "DataFrame", "shape": [10, 3]});
        assert!(suggestions_for("df", &df).contains(&"df.head()".to_string()));

        let long = json!({"type": "list", "length": 500});
        assert_eq!(suggestions_for("rows", &long), vec!["list(rows)[:10]"]);

        let short = json!({"type": "list", "length": 3});
        assert!(suggestions_for("rows", &short).is_empty());
        assert!(suggestions_for("n", &json!({"type": "int"})).is_empty());
    }
}
