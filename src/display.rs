use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use crate::config::{BacklightConfig, DisplayConfig};
use crate::photo::Dimensions;

/// Runs a shell command line and captures its output.
pub type CommandRunner = Arc<dyn Fn(&str) -> Result<CommandOutput> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayAction {
    Show,
    Message,
    PowerOn,
    PowerOff,
}

#[derive(Debug, Clone)]
pub struct CommandExecution {
    pub command: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct SysfsExecution {
    pub path: PathBuf,
    pub value: String,
    pub success: bool,
    pub error: Option<String>,
}

/// What the adapter did for one request.
#[derive(Debug, Clone)]
pub struct DisplayReport {
    pub action: DisplayAction,
    pub sysfs: Vec<SysfsExecution>,
    pub commands: Vec<CommandExecution>,
}

impl DisplayReport {
    fn new(action: DisplayAction) -> Self {
        Self {
            action,
            sysfs: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Nothing configured counts as success.
    pub fn success(&self) -> bool {
        self.sysfs.iter().all(|s| s.success) && self.commands.iter().all(|c| c.success)
    }
}

/// Drives the physical display through configured commands and sysfs.
#[derive(Clone)]
pub struct DisplayAdapter {
    inner: Arc<DisplayInner>,
}

struct DisplayInner {
    config: DisplayConfig,
    runner: CommandRunner,
    powered: AtomicBool,
}

impl fmt::Debug for DisplayAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayAdapter")
            .field("config", &self.inner.config)
            .field("powered", &self.inner.powered.load(Ordering::Relaxed))
            .finish()
    }
}

impl DisplayAdapter {
    pub fn new(config: DisplayConfig) -> Result<Self> {
        Self::with_runner(config, default_runner())
    }

    pub fn with_runner(config: DisplayConfig, runner: CommandRunner) -> Result<Self> {
        for (label, cmd) in [
            ("show-command", &config.show_command),
            ("message-command", &config.message_command),
            ("power-on-command", &config.power_on_command),
            ("power-off-command", &config.power_off_command),
        ] {
            if let Some(cmd) = cmd {
                ensure_not_blank(cmd, label)?;
            }
        }
        Ok(Self {
            inner: Arc::new(DisplayInner {
                config,
                runner,
                powered: AtomicBool::new(true),
            }),
        })
    }

    pub fn is_on(&self) -> bool {
        self.inner.powered.load(Ordering::Relaxed)
    }

    pub fn show_image(&self, path: &Path, mime: &str) -> DisplayReport {
        let mut report = DisplayReport::new(DisplayAction::Show);
        if let Some(template) = &self.inner.config.show_command {
            let command = template
                .replace("@FILE@", &shell_quote(&path.to_string_lossy()))
                .replace("@MIME@", &shell_quote(mime));
            report.commands.push(self.inner.run(&command));
        }
        report
    }

    /// Renders a text message full screen, or only logs it when no
    /// message command is configured.
    pub fn message(&self, text: &str, size: Dimensions) -> DisplayReport {
        let mut report = DisplayReport::new(DisplayAction::Message);
        match &self.inner.config.message_command {
            Some(template) => {
                let command = template
                    .replace("@TEXT@", &shell_quote(text))
                    .replace("@WIDTH@", &size.width.to_string())
                    .replace("@HEIGHT@", &size.height.to_string());
                report.commands.push(self.inner.run(&command));
            }
            None => debug!(text, "no message command configured"),
        }
        report
    }

    pub fn power(&self, on: bool) -> DisplayReport {
        let action = if on {
            DisplayAction::PowerOn
        } else {
            DisplayAction::PowerOff
        };
        let mut report = DisplayReport::new(action);
        if let Some(backlight) = &self.inner.config.backlight {
            report.sysfs.push(write_backlight(backlight, on));
        }
        let command = if on {
            &self.inner.config.power_on_command
        } else {
            &self.inner.config.power_off_command
        };
        if let Some(command) = command {
            report.commands.push(self.inner.run(command));
        }
        self.inner.powered.store(on, Ordering::Relaxed);
        report
    }
}

impl DisplayInner {
    fn run(&self, command: &str) -> CommandExecution {
        let execution = match (self.runner)(command) {
            Ok(output) => CommandExecution {
                command: command.to_string(),
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
            },
            Err(err) => CommandExecution {
                command: command.to_string(),
                success: false,
                exit_code: None,
                stdout: String::new(),
                stderr: err.to_string(),
            },
        };
        if execution.success {
            debug!(command, "display command succeeded");
        } else {
            let exit = execution
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            warn!(
                command,
                exit_code = exit,
                stderr = execution.stderr,
                "display command failed"
            );
        }
        execution
    }
}

fn write_backlight(backlight: &BacklightConfig, on: bool) -> SysfsExecution {
    let value = if on {
        &backlight.on_value
    } else {
        &backlight.off_value
    };
    match fs::write(&backlight.path, value) {
        Ok(()) => {
            debug!(path = %backlight.path.display(), value, "wrote backlight value");
            SysfsExecution {
                path: backlight.path.clone(),
                value: value.clone(),
                success: true,
                error: None,
            }
        }
        Err(err) => {
            warn!(
                path = %backlight.path.display(),
                value,
                error = %err,
                "failed to write backlight value"
            );
            SysfsExecution {
                path: backlight.path.clone(),
                value: value.clone(),
                success: false,
                error: Some(err.to_string()),
            }
        }
    }
}

/// Single-quotes `text` for `sh -c`.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn ensure_not_blank(value: &str, label: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(anyhow!("{label} must not be blank"))
    } else {
        Ok(())
    }
}

pub fn default_runner() -> CommandRunner {
    Arc::new(run_shell)
}

pub fn run_shell(command: &str) -> Result<CommandOutput> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .with_context(|| format!("failed to spawn shell for command: {command}"))?;

    Ok(CommandOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
