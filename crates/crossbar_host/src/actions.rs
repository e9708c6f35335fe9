//! What happens when the user clicks a menu line.

use std::{path::Path, process::Stdio};

use anyhow::{bail, Context, Result};
use crossbar_protocol::MenuLine;
use tokio::task::JoinHandle;

/// The program used to open `href`s.
#[cfg(target_os = "macos")]
pub const PLATFORM_OPENER: &str = "open";
#[cfg(not(target_os = "macos"))]
pub const PLATFORM_OPENER: &str = "xdg-open";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOptions {
    /// Command line prefix that runs a command in a terminal, i.e. `["x-terminal-emulator", "-e"]`.
    pub terminal: Vec<String>,
    pub opener: String,
}

/// Everything that activating a single line does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionPlan {
    /// Commands to start, each given as its argv.
    pub commands: Vec<Vec<String>>,
    /// Whether the plugin should be run again afterwards.
    pub refresh: bool,
}

impl ActionPlan {
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && !self.refresh
    }
}

/// Figure out what activating a line does, without doing any of it.
pub fn plan(line: &MenuLine, options: &ActionOptions) -> ActionPlan {
    let mut commands = Vec::new();
    if let Some(href) = &line.attrs.href {
        commands.push(vec![options.opener.clone(), href.clone()]);
    }
    if let Some(bash) = &line.attrs.bash {
        let params = line.attrs.params();
        let mut argv = vec!["bash".to_string(), "-c".to_string()];
        if params.is_empty() {
            argv.push(bash.clone());
        } else {
            // params are passed as positional arguments, so they never get interpreted by the shell
            argv.push(format!("{} \"$@\"", bash));
            argv.push("bash".to_string());
            argv.extend(params.into_iter().map(str::to_string));
        }
        if line.attrs.opens_terminal() && !options.terminal.is_empty() {
            argv = options.terminal.iter().cloned().chain(argv).collect();
        }
        commands.push(argv);
    }
    ActionPlan { commands, refresh: line.attrs.wants_refresh() }
}

/// Start a command in the background. The returned handle finishes once the child exited and was reaped.
pub fn spawn_detached(argv: &[String], working_dir: &Path) -> Result<JoinHandle<()>> {
    let Some((program, args)) = argv.split_first() else { bail!("Cannot run an empty command") };
    log::info!("Running action: {}", argv.join(" "));
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to run {}", program))?;

    let program = program.clone();
    Ok(tokio::spawn(async move {
        match child.wait_with_output().await {
            Ok(output) if !output.status.success() => {
                log::warn!("Action {} exited with {}: {}", program, output.status, String::from_utf8_lossy(&output.stderr).trim());
            }
            Ok(_) => {}
            Err(err) => log::warn!("Failed to wait for action {}: {}", program, err),
        }
    }))
}
