//! Task data model: levels, nested tasks, flat records, and input drafts.

pub mod codec;
pub mod draft;
pub mod task;

pub use draft::{NewTask, TaskEdit};
pub use task::{Forest, Level, ParseLevelError, Task, TaskId, TaskRecord, generate_id};
