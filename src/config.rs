//! Task file (`stoke.toml`) loading and validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::actions::{JsonVarAction, ShellAction, DEFAULT_SHELL};
use crate::core::{Composition, ErrorPolicy, Task, TaskId, TaskRegistry, Vars};
use crate::orchestration::{Orchestrator, RunOptions, WatchBinding, DEFAULT_DEBOUNCE_MS};
use crate::{slog_debug, Error, Result};

pub const TASK_FILE_NAME: &str = "stoke.toml";

/// `[settings]`: defaults for every run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub max_parallel: Option<usize>,
    pub continue_on_error: bool,
    pub fail_fast: bool,
    pub timeout_secs: Option<u64>,
    pub debounce_ms: Option<u64>,
    pub shell: Option<String>,
}

impl Settings {
    pub fn run_options(&self) -> RunOptions {
        let defaults = RunOptions::default();
        RunOptions {
            max_parallel: self.max_parallel.unwrap_or(defaults.max_parallel),
            continue_on_error: self.continue_on_error,
            fail_fast: self.fail_fast,
            default_timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS))
    }

    pub fn effective_shell(&self) -> &str {
        self.shell.as_deref().unwrap_or(DEFAULT_SHELL)
    }
}

/// `run = "cmd"` or `run = ["cmd1", "cmd2"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Commands {
    One(String),
    Many(Vec<String>),
}

impl Commands {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Commands::One(cmd) => vec![cmd.clone()],
            Commands::Many(cmds) => cmds.clone(),
        }
    }
}

/// `json_var = { file, pointer, var, prefix }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JsonVarDef {
    pub file: String,
    pub pointer: String,
    pub var: String,
    #[serde(default)]
    pub prefix: String,
}

/// `[tasks.<id>]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskDef {
    pub description: Option<String>,
    pub deps: Vec<String>,
    pub mode: Composition,
    pub on_error: Option<ErrorPolicy>,
    pub timeout_secs: Option<u64>,
    pub run: Option<Commands>,
    pub cwd: Option<String>,
    pub capture: Option<String>,
    pub json_var: Option<JsonVarDef>,
}

/// `[[watch]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatchDef {
    pub glob: String,
    pub tasks: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawTaskFile {
    settings: Settings,
    vars: BTreeMap<String, String>,
    tasks: toml::Table,
    watch: Vec<WatchDef>,
}

/// A parsed and validated task file.
#[derive(Debug, Clone)]
pub struct TaskFile {
    /// Directory relative paths resolve against (the file's directory).
    pub base_dir: PathBuf,
    pub settings: Settings,
    pub vars: BTreeMap<String, String>,
    /// Task definitions in declaration order.
    pub tasks: Vec<(TaskId, TaskDef)>,
    pub watch: Vec<WatchDef>,
}

impl TaskFile {
    /// Find `stoke.toml` in `start` or the nearest ancestor.
    pub fn discover(start: &Path) -> Result<PathBuf> {
        slog_debug!("TaskFile::discover start={}", start.display());
        start
            .ancestors()
            .map(|dir| dir.join(TASK_FILE_NAME))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| Error::TaskFileNotFound {
                name: TASK_FILE_NAME.to_string(),
                start: start.display().to_string(),
            })
    }

    pub fn load(path: &Path) -> Result<Self> {
        slog_debug!("TaskFile::load path={}", path.display());
        let content = fs::read_to_string(path)?;
        let base_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::parse(&content, base_dir)
    }

    /// Parse and validate task file content.
    pub fn parse(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let raw: RawTaskFile = toml::from_str(content)?;
        let mut tasks = Vec::with_capacity(raw.tasks.len());
        for (id, value) in raw.tasks {
            let def: TaskDef = value.try_into()?;
            tasks.push((TaskId::new(id), def));
        }
        let file = Self {
            base_dir: base_dir.into(),
            settings: raw.settings,
            vars: raw.vars,
            tasks,
            watch: raw.watch,
        };
        file.validate()?;
        slog_debug!(
            "TaskFile parsed: {} tasks, {} watch bindings",
            file.tasks.len(),
            file.watch.len()
        );
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        if self.settings.max_parallel == Some(0) {
            return Err(Error::Validation(
                "settings.max_parallel must be at least 1".to_string(),
            ));
        }
        for (id, def) in &self.tasks {
            if id.as_str().trim().is_empty() {
                return Err(Error::Validation("task ids must not be empty".to_string()));
            }
            if def.run.is_some() && def.json_var.is_some() {
                return Err(Error::Validation(format!(
                    "task {} sets both run and json_var",
                    id
                )));
            }
            if def.capture.is_some() && def.run.is_none() {
                return Err(Error::Validation(format!(
                    "task {} sets capture without run",
                    id
                )));
            }
            if matches!(&def.run, Some(cmds) if cmds.to_vec().is_empty()) {
                return Err(Error::Validation(format!("task {} has an empty run list", id)));
            }
            if def.timeout_secs == Some(0) {
                return Err(Error::Validation(format!(
                    "task {} has a zero timeout",
                    id
                )));
            }
        }
        for binding in &self.watch {
            glob::Pattern::new(&binding.glob)?;
            if binding.tasks.is_empty() {
                return Err(Error::Validation(format!(
                    "watch binding {} names no tasks",
                    binding.glob
                )));
            }
            for task in &binding.tasks {
                if !self.tasks.iter().any(|(id, _)| id.as_str() == task) {
                    return Err(Error::UnknownTask(TaskId::new(task.as_str())));
                }
            }
        }
        Ok(())
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = expand_tilde(path);
        if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        }
    }

    fn build_task(&self, id: &TaskId, def: &TaskDef) -> Task {
        let mut task = Task::new(id.clone())
            .with_deps(def.deps.iter().map(String::as_str))
            .with_mode(def.mode);
        if let Some(description) = &def.description {
            task = task.with_description(description.clone());
        }
        if let Some(secs) = def.timeout_secs {
            task = task.with_timeout(Duration::from_secs(secs));
        }
        if let Some(policy) = def.on_error {
            task = task.with_error_policy(policy);
        }

        if let Some(commands) = &def.run {
            let cwd = match &def.cwd {
                Some(cwd) => self.resolve_path(cwd),
                None => self.base_dir.clone(),
            };
            let mut action =
                ShellAction::with_shell(self.settings.effective_shell(), commands.to_vec())
                    .with_cwd(cwd);
            if let Some(var) = &def.capture {
                action = action.with_capture(var.clone());
            }
            task = task.with_action(action);
        } else if let Some(json) = &def.json_var {
            let action = JsonVarAction::new(self.resolve_path(&json.file), &json.pointer, &json.var)
                .with_prefix(json.prefix.clone());
            task = task.with_action(action);
        }
        task
    }

    /// Register every task in declaration order.
    pub fn build_registry(&self) -> Result<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        for (id, def) in &self.tasks {
            registry.register(self.build_task(id, def))?;
        }
        Ok(registry)
    }

    pub fn initial_vars(&self) -> Vars {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }

    pub fn watch_bindings(&self) -> Result<Vec<WatchBinding>> {
        self.watch
            .iter()
            .map(|def| WatchBinding::new(&def.glob, def.tasks.iter().map(String::as_str)))
            .collect()
    }

    /// Orchestrator over this file's tasks, settings and variables.
    pub fn orchestrator(&self) -> Result<Orchestrator> {
        Ok(Orchestrator::new(self.build_registry()?)
            .with_options(self.settings.run_options())
            .with_vars(self.initial_vars()))
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
