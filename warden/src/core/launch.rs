//! Supervisor argument construction for (re)launching the managed process.

use anyhow::{Result, bail};

/// How the supervisor should start the managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Entry point handed to the supervisor (e.g. `neurons/validator.py`).
    pub script: String,
    /// Optional interpreter (`--interpreter <bin>`).
    pub interpreter: Option<String>,
    /// Extra supervisor arguments; anything after `--` is passed to the process.
    pub args: Vec<String>,
}

/// Reject names the supervisor would split or misread.
pub fn validate_process_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!("process name must be non-empty");
    }
    if name.chars().any(char::is_whitespace) {
        bail!("process name must not contain whitespace: '{name}'");
    }
    if name.starts_with('-') {
        bail!("process name must not start with '-': '{name}'");
    }
    Ok(())
}

/// Arguments for `<supervisor> start ...`.
///
/// Layout: `start <script> --name <name> [--interpreter <bin>] [args...]`.
pub fn launch_args(name: &str, spec: &LaunchSpec) -> Result<Vec<String>> {
    validate_process_name(name)?;
    if spec.script.trim().is_empty() {
        bail!("launch script must be non-empty");
    }
    let mut args = vec![
        "start".to_string(),
        spec.script.clone(),
        "--name".to_string(),
        name.to_string(),
    ];
    if let Some(interpreter) = spec.interpreter.as_deref()
        && !interpreter.trim().is_empty()
    {
        args.push("--interpreter".to_string());
        args.push(interpreter.to_string());
    }
    args.extend(spec.args.iter().cloned());
    Ok(args)
}

pub fn restart_args(name: &str) -> Result<Vec<String>> {
    validate_process_name(name)?;
    Ok(vec!["restart".to_string(), name.to_string()])
}
