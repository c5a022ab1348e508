//! Built-in actions available to task files.
//!
//! Anything more specific than running commands or reading a value out of a
//! manifest is left to the commands themselves.

mod json_var;
mod shell;

pub use json_var::JsonVarAction;
pub use shell::{interpolate, ShellAction, DEFAULT_SHELL};
