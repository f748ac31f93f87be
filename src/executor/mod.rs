pub mod coordinator;
pub mod layer_run;

pub use coordinator::{EpicConfig, EpicCoordinator};
pub use layer_run::{run_layer, DispatchOptions, LayerResult, SprintOutcome};
