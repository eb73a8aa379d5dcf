//! 调度：任务生命周期与单任务协调者

pub mod run;
pub mod task;

pub use run::{Services, TaskRun};
pub use task::{ConfirmationRequest, Task, TaskReport, TaskStatus};
