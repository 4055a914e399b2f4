pub mod policy;
pub mod spawner;
pub mod state;
pub mod supervisor;

pub use policy::{decide, RestartDecision, MAX_RESTART_DELAY};
pub use spawner::{spawn_child, SpawnedChild, SPAWN_FAILURE_CODE};
pub use state::{LifecycleStatus, RestartReason, RuntimeState, StateSnapshot};
pub use supervisor::{spawn_app_loop, AppCommand, AppHandle};
