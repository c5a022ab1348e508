//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Temporary project directories with a `stoke.toml`
//! - Tasks that record when their actions start and finish
//! - Predefined task graphs

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use stoke::core::{from_async, ActionError, Task, TaskRegistry};
use stoke::TaskFile;

/// A temporary project directory.
pub struct TestProject {
    /// Keeps the directory alive.
    pub temp_dir: TempDir,
    /// Project root.
    pub path: PathBuf,
}

impl TestProject {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir
            .path()
            .canonicalize()
            .expect("Failed to canonicalize temp directory");
        Self { temp_dir, path }
    }

    /// Write `content` to `relative`, creating parent directories.
    pub fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        std::fs::write(&path, content).expect("Failed to write file");
        path
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path.join(relative)).expect("Failed to read file")
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.path.join(relative).exists()
    }

    /// Write `stoke.toml` and load it.
    pub fn task_file(&self, content: &str) -> TaskFile {
        let path = self.write("stoke.toml", content);
        TaskFile::load(&path).expect("Failed to load task file")
    }

    pub fn root(&self) -> &Path {
        &self.path
    }
}

/// Shared log of action starts and ends.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|e| e == entry)
    }

    /// Position of `entry`; panics if it was never recorded.
    pub fn index_of(&self, entry: &str) -> usize {
        self.entries()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{} not in journal {:?}", entry, self.entries()))
    }

    /// Number of times the action of `id` started.
    pub fn starts(&self, id: &str) -> usize {
        let entry = format!("start:{}", id);
        self.entries().iter().filter(|e| **e == entry).count()
    }
}

/// Task whose action records `start:<id>`, sleeps, records `end:<id>`, and
/// optionally fails.
pub fn recorded_task(id: &str, journal: &Journal, delay: Duration, fail: bool) -> Task {
    let journal = journal.clone();
    let name = id.to_string();
    Task::new(id).with_action(from_async(move |_ctx| {
        let journal = journal.clone();
        let name = name.clone();
        async move {
            journal.push(format!("start:{}", name));
            tokio::time::sleep(delay).await;
            journal.push(format!("end:{}", name));
            if fail {
                Err::<(), ActionError>(format!("{} failed", name).into())
            } else {
                Ok(())
            }
        }
    }))
}

pub fn ok_task(id: &str, journal: &Journal) -> Task {
    recorded_task(id, journal, Duration::from_millis(5), false)
}

pub fn failing_task(id: &str, journal: &Journal) -> Task {
    recorded_task(id, journal, Duration::from_millis(5), true)
}

pub fn registry(tasks: Vec<Task>) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    for task in tasks {
        registry.register(task).expect("Failed to register task");
    }
    registry
}

/// The build graph of a small web extension:
///
/// ```text
/// prep    = series(clean, copy)
/// build   = series(prep, parallel(js, html, styles))
/// release = series(build, getVersion, zip)
/// ```
pub fn web_extension(journal: &Journal, failing: &[&str]) -> TaskRegistry {
    let task = |id: &str| {
        if failing.contains(&id) {
            failing_task(id, journal)
        } else {
            ok_task(id, journal)
        }
    };
    registry(vec![
        task("clean"),
        task("staticJS"),
        task("copy").with_deps(["staticJS"]),
        Task::new("prep").with_deps(["clean", "copy"]),
        task("js"),
        task("html"),
        task("styles"),
        Task::new("assets")
            .with_deps(["js", "html", "styles"])
            .parallel(),
        Task::new("build").with_deps(["prep", "assets"]),
        task("getVersion"),
        task("zip"),
        Task::new("release").with_deps(["build", "getVersion", "zip"]),
    ])
}
