//! `tasks` crate: the `ExecutableTask` trait and built-in task implementations.
//!
//! Every task, shell commands and test doubles alike, implements
//! [`ExecutableTask`]. The engine crate dispatches execution through this
//! trait object.

pub mod error;
pub mod traits;
pub mod template;
pub mod shell;
pub mod mock;

pub use error::TaskError;
pub use traits::{ExecutableTask, TaskContext};
pub use shell::{ShellTask, ShellTaskConfig};
