//! Coordinator
//!
//! Picks an idle node from the relay's directory, opens a direct channel to
//! it and dispatches programs over that channel.

mod core;
mod directory;
mod ids;
mod pending;
mod selection;

pub use self::core::{Coordinator, CoordinatorOptions, CoordinatorState, TaskReport};
pub use directory::{DirectoryCache, DirectorySnapshot};
pub use ids::TaskIdGenerator;
pub use pending::{PendingTasks, Resolution};
pub use selection::{NodeSelector, SelectionStrategy};
