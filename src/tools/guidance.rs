//! get_guidance 工具：不接触任何会话

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use super::{parse_args, schema_of, to_content, Tool};
use crate::guidance;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GuidanceArgs {
    /// setup_environment | fix_error | execute_code | install_package | manage_kernel
    pub topic: String,
    /// 如 {"error_type": "ModuleNotFoundError", "module": "cv2"}
    #[serde(default)]
    pub context: Option<Value>,
}

pub struct GetGuidanceTool;

#[async_trait]
impl Tool for GetGuidanceTool {
    fn name(&self) -> &str {
        "get_guidance"
    }

    fn description(&self) -> &str {
        "Step-by-step advice for a topic; pure lookup with no side effects"
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<GuidanceArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: GuidanceArgs = parse_args(args)?;
        let context = args.context.unwrap_or(Value::Null);
        to_content(&guidance::resolve(&args.topic, &context))
    }
}
