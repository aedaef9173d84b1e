pub mod engine;
pub mod evaluator;
pub mod membership;
pub mod registry;
mod state;
pub mod view_change;
