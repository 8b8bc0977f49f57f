use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use stage_core::STAGE_CONTENT_ROOT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchCommand {
    Run,
    Play,
    Edit,
    Mml,
}

impl LaunchCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchCommand::Run => "run",
            LaunchCommand::Play => "play",
            LaunchCommand::Edit => "edit",
            LaunchCommand::Mml => "mml",
        }
    }

    fn runs_program(self) -> bool {
        matches!(self, LaunchCommand::Run | LaunchCommand::Play)
    }
}

/// Parameters of the initial launch; replayed unchanged on every reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchParams {
    pub command: LaunchCommand,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub packages: Option<String>,
    #[serde(default)]
    pub gamepad: Option<String>,
    #[serde(default)]
    pub editor: Option<String>,
    #[serde(default, alias = "mmlList")]
    pub mml_list: Option<String>,
    #[serde(default)]
    pub base64: Option<String>,
}

impl LaunchParams {
    pub fn new(command: LaunchCommand) -> Self {
        Self {
            command,
            root: None,
            name: None,
            script: None,
            packages: None,
            gamepad: None,
            editor: None,
            mml_list: None,
            base64: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn content_root(&self) -> &str {
        non_empty(&self.root).unwrap_or(STAGE_CONTENT_ROOT)
    }
}

pub fn load_params(path: &Path) -> Result<LaunchParams> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed reading launch params {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );
    let params = if is_yaml {
        serde_yaml::from_str(&data)?
    } else {
        serde_json::from_str(&data)?
    };
    Ok(params)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgramInvocation {
    RunScript { name: String },
    RunSource { code: String },
    PlayApp { name: String },
    EditResource { name: String, editor: Option<String> },
    PlayMml { channels: Vec<String> },
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineFile {
    pub name: String,
    pub size: usize,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

/// Everything a launch does, in order: install packages, request the
/// on-screen gamepad, drop the inline file, then invoke the program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
    pub command: LaunchCommand,
    pub packages: Vec<String>,
    pub virtual_gamepad: bool,
    pub inline_file: Option<InlineFile>,
    pub invocation: ProgramInvocation,
}

impl LaunchPlan {
    pub fn from_params(params: &LaunchParams) -> Result<Self> {
        let command = params.command;
        let packages = if command.runs_program() {
            non_empty(&params.packages)
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<String>>()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let virtual_gamepad = command.runs_program() && params.gamepad.as_deref() == Some("enabled");

        let name = non_empty(&params.name);
        let inline_file = match (name, non_empty(&params.base64)) {
            (Some(name), Some(payload)) => Some(decode_inline_file(name, payload)?),
            _ => None,
        };

        let invocation = match command {
            LaunchCommand::Run => match (name, non_empty(&params.script)) {
                (Some(name), _) => ProgramInvocation::RunScript {
                    name: name.to_string(),
                },
                (None, Some(code)) => ProgramInvocation::RunSource {
                    code: code.to_string(),
                },
                (None, None) => ProgramInvocation::Idle,
            },
            LaunchCommand::Play => ProgramInvocation::PlayApp {
                name: name
                    .ok_or_else(|| anyhow!("play requires an app name"))?
                    .to_string(),
            },
            LaunchCommand::Edit => ProgramInvocation::EditResource {
                name: name.unwrap_or_default().to_string(),
                editor: non_empty(&params.editor).map(str::to_string),
            },
            LaunchCommand::Mml => ProgramInvocation::PlayMml {
                channels: non_empty(&params.mml_list)
                    .ok_or_else(|| anyhow!("mml requires mml_list"))?
                    .split(';')
                    .map(str::to_string)
                    .collect(),
            },
        };

        Ok(Self {
            command,
            packages,
            virtual_gamepad,
            inline_file,
            invocation,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

fn decode_inline_file(name: &str, payload: &str) -> Result<InlineFile> {
    if name.starts_with('/') || name.split('/').any(|segment| segment == "..") {
        return Err(anyhow!(
            "inline file name must stay inside the working root (got: {})",
            name
        ));
    }
    let bytes = BASE64_STANDARD
        .decode(payload.trim())
        .with_context(|| format!("invalid base64 payload for {}", name))?;
    Ok(InlineFile {
        name: name.to_string(),
        size: bytes.len(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: serde_json::Value) -> LaunchParams {
        serde_json::from_value(value).expect("params should parse")
    }

    #[test]
    fn run_with_name_runs_script_and_installs_packages() {
        let plan = LaunchPlan::from_params(&params(json!({
            "command": "run",
            "name": "main.py",
            "packages": "numpy, pandas,,",
            "gamepad": "enabled"
        })))
        .expect("plan");
        assert_eq!(plan.packages, vec!["numpy", "pandas"]);
        assert!(plan.virtual_gamepad);
        assert_eq!(
            plan.invocation,
            ProgramInvocation::RunScript {
                name: "main.py".to_string()
            }
        );
    }

    #[test]
    fn run_prefers_name_then_script_then_idle() {
        let source = LaunchPlan::from_params(&params(json!({
            "command": "run",
            "script": "print('hi')"
        })))
        .expect("plan");
        assert_eq!(
            source.invocation,
            ProgramInvocation::RunSource {
                code: "print('hi')".to_string()
            }
        );
        let idle = LaunchPlan::from_params(&LaunchParams::new(LaunchCommand::Run)).expect("plan");
        assert_eq!(idle.invocation, ProgramInvocation::Idle);
    }

    #[test]
    fn edit_ignores_packages_and_gamepad() {
        let plan = LaunchPlan::from_params(&params(json!({
            "command": "edit",
            "editor": "tilemap",
            "packages": "numpy",
            "gamepad": "enabled"
        })))
        .expect("plan");
        assert!(plan.packages.is_empty());
        assert!(!plan.virtual_gamepad);
        assert_eq!(
            plan.invocation,
            ProgramInvocation::EditResource {
                name: String::new(),
                editor: Some("tilemap".to_string())
            }
        );
    }

    #[test]
    fn mml_list_is_split_per_channel() {
        let plan = LaunchPlan::from_params(&params(json!({
            "command": "mml",
            "mmlList": "T120 CDE;O3 G"
        })))
        .expect("plan");
        assert_eq!(
            plan.invocation,
            ProgramInvocation::PlayMml {
                channels: vec!["T120 CDE".to_string(), "O3 G".to_string()]
            }
        );
        assert!(LaunchPlan::from_params(&LaunchParams::new(LaunchCommand::Mml)).is_err());
    }

    #[test]
    fn play_requires_name() {
        let err = LaunchPlan::from_params(&LaunchParams::new(LaunchCommand::Play))
            .expect_err("missing name");
        assert!(err.to_string().contains("play requires"));
    }

    #[test]
    fn inline_file_is_decoded() {
        let plan = LaunchPlan::from_params(&params(json!({
            "command": "play",
            "name": "game.pyxapp",
            "base64": "AAEC/w=="
        })))
        .expect("plan");
        let file = plan.inline_file.expect("inline file");
        assert_eq!(file.name, "game.pyxapp");
        assert_eq!(file.bytes, vec![0, 1, 2, 255]);
    }

    #[test]
    fn inline_file_rejects_bad_payload_and_escaping_names() {
        let bad = params(json!({"command": "run", "name": "a.py", "base64": "!!!"}));
        assert!(LaunchPlan::from_params(&bad).is_err());
        let escape = params(json!({"command": "run", "name": "../a.py", "base64": "AA=="}));
        assert!(LaunchPlan::from_params(&escape).is_err());
    }

    #[test]
    fn content_root_defaults_to_current_directory() {
        assert_eq!(LaunchParams::new(LaunchCommand::Run).content_root(), ".");
        let mut with_root = LaunchParams::new(LaunchCommand::Run);
        with_root.root = Some("https://cdn.example/game".to_string());
        assert_eq!(with_root.content_root(), "https://cdn.example/game");
    }

    #[test]
    fn params_load_from_yaml_and_json() {
        let dir = std::env::temp_dir().join(format!(
            "stage_params_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        let yaml = dir.join("launch.yaml");
        fs::write(&yaml, "command: play\nname: app.pyxapp\nroot: ./dist\n").expect("yaml");
        let json_path = dir.join("launch.json");
        fs::write(&json_path, r#"{"command":"run","script":"x=1"}"#).expect("json");

        let from_yaml = load_params(&yaml).expect("yaml params");
        assert_eq!(from_yaml.command, LaunchCommand::Play);
        assert_eq!(from_yaml.content_root(), "./dist");
        let from_json = load_params(&json_path).expect("json params");
        assert_eq!(from_json.script.as_deref(), Some("x=1"));
        let _ = fs::remove_dir_all(dir);
    }
}
