//! Adapter manifests: declarative records teaching the adapter driver how to
//! start an external debug adapter for a language.
//!
//! User manifests are TOML files under `~/.config/gumshoe/adapters/`; a few
//! built-ins ship with the binary and are used when no user manifest exists.

use crate::protocol::ToolError;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Dap,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Stdio,
    Cdp,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub transport: Transport,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterManifest {
    pub r#type: ManifestKind,
    pub adapter: AdapterSpec,
    /// JSON template for the DAP launch body; `{program}` and `{cwd}` are
    /// substituted at launch time.
    #[serde(default)]
    pub launch_args: Option<toml::Value>,
    #[serde(default)]
    pub boundary_markers: Vec<String>,
    /// Arithmetic semantics the language expects from the evaluator.
    #[serde(default)]
    pub division: Option<String>,
}

impl AdapterManifest {
    pub fn parse(text: &str) -> Result<Self, ToolError> {
        toml::from_str(text).map_err(|e| ToolError::Internal(format!("bad adapter manifest: {e}")))
    }

    /// Resolve the manifest for a language: user manifest first, built-in
    /// fallback second.
    pub fn for_language(language: &str) -> Result<Self, ToolError> {
        if let Some(home) = home::home_dir() {
            let path = home
                .join(".config")
                .join("gumshoe")
                .join("adapters")
                .join(format!("{language}.toml"));
            if let Ok(text) = std::fs::read_to_string(&path) {
                return Self::parse(&text);
            }
        }
        Self::builtin(language)
    }

    pub fn builtin(language: &str) -> Result<Self, ToolError> {
        let text = match language {
            "python" | "py" => BUILTIN_PYTHON,
            "javascript" | "js" | "node" => BUILTIN_NODE,
            other => {
                return Err(ToolError::InvalidParams(format!(
                    "no adapter manifest for language `{other}`"
                )))
            }
        };
        Self::parse(text)
    }

    /// Verify the adapter command exists on PATH.
    pub fn resolve_command(&self) -> Result<PathBuf, ToolError> {
        which::which(&self.adapter.command).map_err(|_| {
            ToolError::Internal(format!(
                "adapter command `{}` is not on PATH",
                self.adapter.command
            ))
        })
    }

    /// Argv with `{port}` substituted.
    pub fn argv(&self, port: u16) -> Vec<String> {
        self.adapter
            .args
            .iter()
            .map(|arg| arg.replace("{port}", &port.to_string()))
            .collect()
    }

    /// Launch body rendered from the template with `{program}`/`{cwd}`
    /// substitutions applied to every string field.
    pub fn launch_body(&self, program: &str, cwd: Option<&str>) -> Result<Value, ToolError> {
        let template = match &self.launch_args {
            Some(value) => serde_json::to_value(value)
                .map_err(|e| ToolError::Internal(format!("bad launch template: {e}")))?,
            None => serde_json::json!({"program": "{program}"}),
        };
        Ok(substitute(template, program, cwd))
    }
}

fn substitute(value: Value, program: &str, cwd: Option<&str>) -> Value {
    match value {
        Value::String(s) => {
            let s = s.replace("{program}", program);
            let s = match cwd {
                Some(cwd) => s.replace("{cwd}", cwd),
                None if s == "{cwd}" => return Value::Null,
                None => s,
            };
            Value::String(s)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| substitute(v, program, cwd))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, substitute(v, program, cwd)))
                .collect(),
        ),
        other => other,
    }
}

const BUILTIN_PYTHON: &str = r#"
type = "dap"
division = "floor"

[adapter]
command = "python3"
args = ["-m", "debugpy.adapter", "--port", "{port}"]
transport = "tcp"

[launch_args]
request = "launch"
program = "{program}"
cwd = "{cwd}"
console = "internalConsole"
justMyCode = true
"#;

const BUILTIN_NODE: &str = r#"
type = "dap"
division = "float"

[adapter]
command = "node"
args = ["--inspect-brk={port}", "{program}"]
transport = "cdp"
"#;

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_manifests_parse() {
        let py = AdapterManifest::builtin("python").unwrap();
        assert_eq!(py.r#type, ManifestKind::Dap);
        assert_eq!(py.adapter.transport, Transport::Tcp);

        let js = AdapterManifest::builtin("js").unwrap();
        assert_eq!(js.adapter.transport, Transport::Cdp);

        assert!(AdapterManifest::builtin("cobol").is_err());
    }

    #[test]
    fn test_port_substitution() {
        let manifest = AdapterManifest::builtin("python").unwrap();
        let argv = manifest.argv(5678);
        assert!(argv.contains(&"5678".to_string()));
        assert!(!argv.iter().any(|a| a.contains("{port}")));
    }

    #[test]
    fn test_launch_body_substitution() {
        let manifest = AdapterManifest::builtin("python").unwrap();
        let body = manifest
            .launch_body("/tmp/app.py", Some("/work"))
            .unwrap();
        assert_eq!(body["program"], json!("/tmp/app.py"));
        assert_eq!(body["cwd"], json!("/work"));
        assert_eq!(body["request"], json!("launch"));
    }

    #[test]
    fn test_custom_manifest_round_trip() {
        let text = r#"
type = "dap"

[adapter]
command = "lldb-dap"
args = ["--port", "{port}"]
transport = "tcp"

boundary_markers = ["__libc_start_main"]

[launch_args]
request = "launch"
program = "{program}"
"#;
        let manifest = AdapterManifest::parse(text).unwrap();
        assert_eq!(manifest.adapter.command, "lldb-dap");
        assert_eq!(manifest.boundary_markers, vec!["__libc_start_main"]);
    }
}
