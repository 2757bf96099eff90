//! Runtime structures shared with generated code.

pub mod entrypoints;
pub mod gc;
pub mod indirect_ref;
pub mod method;
pub mod object;
pub mod thread;
pub mod thread_list;

pub use entrypoints::{QuickEntryPoints, QuickEntrypoint};
pub use thread::{ManagedThread, ThreadState};
pub use thread_list::{SuspendAllGuard, ThreadList};
