//! Reads a value out of a JSON file into a run variable.

use crate::core::{Action, ActionContext, ActionResult};
use crate::error::{Error, Result};
use crate::slog_debug;
use futures::future::BoxFuture;
use serde_json::Value;
use std::path::PathBuf;

/// Stores `prefix + file[pointer]` in the variable `var`.
///
/// Typical use is deriving a release name from a manifest:
/// `{ file = "manifest.json", pointer = "/version", var = "version", prefix = "v" }`.
#[derive(Debug, Clone)]
pub struct JsonVarAction {
    file: PathBuf,
    pointer: String,
    var: String,
    prefix: String,
}

impl JsonVarAction {
    /// `pointer` is an RFC 6901 JSON pointer; a leading `/` is added if missing.
    pub fn new(file: impl Into<PathBuf>, pointer: &str, var: impl Into<String>) -> Self {
        let pointer = if pointer.starts_with('/') || pointer.is_empty() {
            pointer.to_string()
        } else {
            format!("/{}", pointer)
        };
        Self {
            file: file.into(),
            pointer,
            var: var.into(),
            prefix: String::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Read the file and extract the value without storing it.
    pub async fn read(&self) -> Result<String> {
        let content = tokio::fs::read_to_string(&self.file).await?;
        let json: Value = serde_json::from_str(&content)?;
        let value = json
            .pointer(&self.pointer)
            .ok_or_else(|| Error::JsonPointerNotFound {
                path: self.file.display().to_string(),
                pointer: self.pointer.clone(),
            })?;
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(format!("{}{}", self.prefix, text))
    }
}

impl Action for JsonVarAction {
    fn call(&self, ctx: ActionContext) -> BoxFuture<'static, ActionResult> {
        let action = self.clone();
        Box::pin(async move {
            let value = action.read().await?;
            slog_debug!("task={} {}={}", ctx.task, action.var, value);
            ctx.vars.set(action.var, value);
            Ok(())
        })
    }
}
