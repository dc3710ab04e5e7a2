//! 使用指引
//!
//! `resolve(topic, context)` 是纯函数：不访问会话、不做 IO，只按主题与上下文拼出建议。

use serde::Serialize;
use serde_json::Value;

use crate::deps::package_for_module;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceTopic {
    SetupEnvironment,
    FixError,
    ExecuteCode,
    InstallPackage,
    ManageKernel,
    General,
}

impl GuidanceTopic {
    /// 未识别的主题落到 General
    pub fn parse(topic: &str) -> Self {
        match topic.trim() {
            "setup_environment" => Self::SetupEnvironment,
            "fix_error" => Self::FixError,
            "execute_code" => Self::ExecuteCode,
            "install_package" => Self::InstallPackage,
            "manage_kernel" => Self::ManageKernel,
            _ => Self::General,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Issue {
    pub issue: String,
    pub fixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Guidance {
    pub topic: GuidanceTopic,
    pub summary: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub troubleshooting: Vec<Issue>,
}

fn step(action: &str, command: Option<&str>) -> Step {
    Step {
        action: action.to_string(),
        command: command.map(str::to_string),
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn issue(issue: &str, fixes: &[&str]) -> Issue {
    Issue {
        issue: issue.to_string(),
        fixes: strings(fixes),
    }
}

fn context_str<'a>(context: &'a Value, key: &str) -> Option<&'a str> {
    context.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

pub fn resolve(topic: &str, context: &Value) -> Guidance {
    match GuidanceTopic::parse(topic) {
        GuidanceTopic::SetupEnvironment => setup_environment(),
        GuidanceTopic::FixError => fix_error(context),
        GuidanceTopic::ExecuteCode => execute_code(),
        GuidanceTopic::InstallPackage => install_package(),
        GuidanceTopic::ManageKernel => manage_kernel(),
        GuidanceTopic::General => general(),
    }
}

fn setup_environment() -> Guidance {
    Guidance {
        topic: GuidanceTopic::SetupEnvironment,
        summary: "Create a project environment with uv, then initialize a session in it".to_string(),
        steps: vec![
            step("Create the project and its .venv", Some("uv init && uv venv")),
            step("Start a session in the project directory", Some("initialize {\"working_dir\": \".\"}")),
            step("Check interpreter and uv detection in environment_info", None),
        ],
        rules: strings(&[
            "Use uv for package management, never a global pip install",
            "Pin the interpreter with .python-version when the project needs one",
            "Run `uv sync` after pulling changes to uv.lock",
        ]),
        troubleshooting: vec![
            issue("No .venv found", &["Run `uv venv` in the working directory, then restart_kernel"]),
            issue("Package not found", &["Install it with ensure_dependencies"]),
        ],
    }
}

fn fix_error(context: &Value) -> Guidance {
    let mut steps = vec![
        step("Read the exception type and message", None),
        step("Find the failing line in the traceback", None),
        step("Follow the hints returned with the failed execution", None),
    ];
    let mut summary = "Diagnose the failure, then resubmit corrected code".to_string();

    match context_str(context, "error_type") {
        Some("ModuleNotFoundError") | Some("ImportError") => {
            let module = context_str(context, "module").unwrap_or("the module");
            let package = context_str(context, "module").map(package_for_module);
            summary = format!("Module {module} is missing from the session environment");
            let command = match &package {
                Some(p) => format!("ensure_dependencies {{\"session_id\": \"...\", \"packages\": [\"{p}\"]}}"),
                None => "ensure_dependencies {\"session_id\": \"...\", \"packages\": [\"...\"]}".to_string(),
            };
            steps.push(Step {
                action: "Install the package".to_string(),
                command: Some(command),
            });
            steps.push(step("Re-run the import; the interpreter does not need a restart", None));
        }
        Some("FileNotFoundError") => {
            let path = context_str(context, "path").unwrap_or("the file");
            summary = format!("{path} does not exist relative to the session working directory");
            steps.push(step("Print the working directory", Some("import os; os.getcwd()")));
            steps.push(step("Use an absolute path or fix the relative one", None));
        }
        Some("NameError") => {
            summary = "A name is used before it is defined in this session".to_string();
            steps.push(step("Run the code that defines it first, or import it", None));
            steps.push(step("List what the session defines", Some("inspect_namespace")));
        }
        _ => {}
    }

    Guidance {
        topic: GuidanceTopic::FixError,
        summary,
        steps,
        rules: strings(&["A message containing STOP ends the retry loop immediately"]),
        troubleshooting: Vec::new(),
    }
}

fn execute_code() -> Guidance {
    Guidance {
        topic: GuidanceTopic::ExecuteCode,
        summary: "Run code in small cells; state persists between calls in one session".to_string(),
        steps: vec![
            step("Make sure a session exists", Some("initialize")),
            step("Execute a cell", Some("execute_cell {\"session_id\": \"...\", \"code\": \"x = 42\"}")),
            step("Check outcome, stdout and the exception fields", None),
        ],
        rules: strings(&[
            "Split long work into several cells",
            "A trailing expression is returned as value",
            "Pass a timeout for long computations; a timeout does not stop the computation",
        ]),
        troubleshooting: vec![issue(
            "Call timed out",
            &["The interpreter is still busy; wait or use restart_kernel"],
        )],
    }
}

fn install_package() -> Guidance {
    Guidance {
        topic: GuidanceTopic::InstallPackage,
        summary: "Install into the session environment with ensure_dependencies".to_string(),
        steps: vec![
            step(
                "Install all needed packages in one call",
                Some("ensure_dependencies {\"session_id\": \"...\", \"packages\": [\"numpy\", \"pandas\"]}"),
            ),
            step(
                "Development-only tools go to the dev group",
                Some("ensure_dependencies {\"session_id\": \"...\", \"packages\": [\"pytest\"], \"dev\": true}"),
            ),
            step("Re-run the import", None),
        ],
        rules: strings(&[
            "Never pip install into the system interpreter",
            "Import names may differ from package names: cv2 → opencv-python, sklearn → scikit-learn, PIL → pillow, yaml → pyyaml",
        ]),
        troubleshooting: Vec::new(),
    }
}

fn manage_kernel() -> Guidance {
    Guidance {
        topic: GuidanceTopic::ManageKernel,
        summary: "Each session owns one interpreter; restart drops all of its state".to_string(),
        steps: vec![
            step("Start", Some("initialize")),
            step("Check", Some("kernel_status")),
            step("Restart when unresponsive", Some("restart_kernel")),
            step("Shut down when done", Some("shutdown_kernel")),
        ],
        rules: Vec::new(),
        troubleshooting: vec![
            issue(
                "Interpreter will not start",
                &["Check that .venv/bin/python exists", "Set kernel.python in the config"],
            ),
            issue(
                "Interpreter dies unexpectedly",
                &["Look for memory exhaustion or os._exit", "The next call starts a fresh interpreter"],
            ),
        ],
    }
}

fn general() -> Guidance {
    Guidance {
        topic: GuidanceTopic::General,
        summary: "Initialize a session, execute code, install what is missing, repeat".to_string(),
        steps: vec![
            step("Initialize", Some("initialize")),
            step("Execute code", Some("execute_cell")),
            step("On a missing module", Some("ensure_dependencies")),
            step("Continue executing", None),
        ],
        rules: strings(&[
            "Always initialize before executing in a new project",
            "Use ensure_dependencies instead of pip",
        ]),
        troubleshooting: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_topic_is_general() {
        assert_eq!(resolve("create_notebook", &Value::Null).topic, GuidanceTopic::General);
        assert_eq!(resolve("", &json!({})).topic, GuidanceTopic::General);
    }

    #[test]
    fn test_fix_error_maps_module_to_package() {
        let g = resolve("fix_error", &json!({"error_type": "ModuleNotFoundError", "module": "cv2"}));
        assert!(g.summary.contains("cv2"));
        assert!(g
            .steps
            .iter()
            .filter_map(|s| s.command.as_deref())
            .any(|c| c.contains("opencv-python")));
    }

    #[test]
    fn test_fix_error_mentions_path() {
        let g = resolve("fix_error", &json!({"error_type": "FileNotFoundError", "path": "data.csv"}));
        assert!(g.summary.contains("data.csv"));
    }

    #[test]
    fn test_is_deterministic() {
        let ctx = json!({"error_type": "NameError"});
        let a = serde_json::to_string(&resolve("fix_error", &ctx)).unwrap();
        let b = serde_json::to_string(&resolve("fix_error", &ctx)).unwrap();
        assert_eq!(a, b);
    }
}
