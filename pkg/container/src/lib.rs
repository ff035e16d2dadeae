//! Container lifecycle: the two-stage re-exec, overlay assembly, cgroup-v1
//! limits, exec-into-container, and running-container inspection.

pub mod cgroup;
pub mod exec;
pub mod inspect;
pub mod lifecycle;

pub use cgroup::Cgroups;
pub use inspect::RunningContainer;
pub use lifecycle::{ChildOptions, Limits, RunOptions};
