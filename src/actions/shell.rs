//! Shell command action.

use crate::core::{Action, ActionContext, ActionResult, Vars};
use crate::error::{Error, Result};
use crate::{slog_debug, slog_warn};
use futures::future::BoxFuture;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use tokio::process::Command;

#[cfg(windows)]
pub const DEFAULT_SHELL: &str = "cmd";
#[cfg(not(windows))]
pub const DEFAULT_SHELL: &str = "sh";

/// `${name}` references to run variables.
static VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.-]*)\}").expect("variable pattern is valid")
});

/// Replace every `${name}` in `template` with its value in `vars`.
pub fn interpolate(template: &str, vars: &Vars) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in VAR_RE.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = vars
            .get(name.as_str())
            .ok_or_else(|| Error::UndefinedVar(name.as_str().to_string()))?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Flag that makes `shell` read a command string.
fn command_flag(shell: &Path) -> &'static str {
    let name = shell
        .file_stem()
        .map(|s| s.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match name.as_str() {
        "cmd" => "/C",
        "powershell" | "pwsh" => "-Command",
        _ => "-c",
    }
}

/// Runs commands one after another through a shell.
///
/// The first command that exits non-zero fails the action with its stderr.
/// Cancelling the action kills the running child. With `capture` set, the
/// trimmed stdout of the last command is stored in that variable. The shell
/// is looked up on `PATH` each time the action runs.
#[derive(Debug, Clone)]
pub struct ShellAction {
    shell: String,
    commands: Arc<Vec<String>>,
    cwd: Option<PathBuf>,
    capture: Option<String>,
}

impl ShellAction {
    /// Create an action using the platform's default shell.
    pub fn new(commands: Vec<String>) -> Self {
        Self::with_shell(DEFAULT_SHELL, commands)
    }

    pub fn with_shell(shell: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            shell: shell.into(),
            commands: Arc::new(commands),
            cwd: None,
            capture: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_capture(mut self, var: impl Into<String>) -> Self {
        self.capture = Some(var.into());
        self
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Resolve the shell on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `ShellNotFound` if the shell is not on `PATH`.
    pub fn resolve_shell(&self) -> Result<PathBuf> {
        which::which(&self.shell).map_err(|_| Error::ShellNotFound(self.shell.clone()))
    }

    async fn run(self, ctx: ActionContext) -> Result<()> {
        let shell = self.resolve_shell()?;
        let last = self.commands.len().saturating_sub(1);
        for (i, template) in self.commands.iter().enumerate() {
            let command = interpolate(template, &ctx.vars)?;
            let capture = if i == last { self.capture.as_deref() } else { None };
            self.run_one(&shell, &ctx, &command, capture).await?;
        }
        Ok(())
    }

    async fn run_one(
        &self,
        shell: &Path,
        ctx: &ActionContext,
        command: &str,
        capture: Option<&str>,
    ) -> Result<()> {
        slog_debug!("task={} $ {}", ctx.task, command);
        let mut cmd = Command::new(shell);
        cmd.arg(command_flag(shell))
            .arg(command)
            .env("STOKE_TASK", ctx.task.as_str())
            .stdin(Stdio::null())
            .stdout(if capture.is_some() {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn()?;
        let output = tokio::select! {
            output = child.wait_with_output() => output?,
            _ = ctx.cancel.cancelled() => {
                slog_warn!("task={} cancelled, killing `{}`", ctx.task, command);
                return Err(Error::Cancelled(ctx.task.clone()));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(Error::CommandFailed {
                command: command.to_string(),
                code: output.status.code(),
                stderr: stderr.into_owned(),
            });
        }
        if !stderr.trim().is_empty() {
            eprint!("{}", stderr);
        }
        if let Some(var) = capture {
            let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
            slog_debug!("task={} captured {}={}", ctx.task, var, value);
            ctx.vars.set(var, value);
        }
        Ok(())
    }
}

impl Action for ShellAction {
    fn call(&self, ctx: ActionContext) -> BoxFuture<'static, ActionResult> {
        let action = self.clone();
        Box::pin(async move { action.run(ctx).await.map_err(Into::into) })
    }
}
