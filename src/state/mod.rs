pub mod store;
pub mod tracker;

pub use store::{RunEvent, TransitionEvent, TransitionStore};
pub use tracker::{StateTracker, TransitionDetail};
