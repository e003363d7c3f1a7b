//! Pipeline runtime: the top-level controller, the deterministic direct
//! handler, and the restricted arithmetic evaluator.

mod controller;
mod direct;
mod evaluator;

pub use controller::{ControllerAction, PipelineController};
pub use direct::{DirectCommand, match_command};
