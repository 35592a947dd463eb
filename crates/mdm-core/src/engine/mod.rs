//! Cooperative task engine.
//!
//! All download work runs on one thread as [`Task`]s. The [`Scheduler`]
//! waits on an [`EventPoll`](crate::transfer::EventPoll), invokes every task
//! whose interest is satisfied, and routes errors back to the task that
//! raised them. Tasks never hold group references across invocations; they
//! carry a [`Gid`](crate::registry::Gid) and look the group up each time.

mod connection;
mod halt;
mod routine;
mod scheduler;
mod task;

pub use connection::ConnectionTask;
pub use halt::{HaltLatch, HaltStage};
pub use routine::{AutoSaveTask, ChunkedQueueTask, SleepTask};
pub use scheduler::Scheduler;
pub use task::{Interest, Task, TaskContext, TaskStatus};
