//! Activity execution: the replay/memoize/suspend core
//!
//! - [`executor`] - the core every primitive funnels into
//! - [`options`] - per-activity execution options
//! - [`step`] - the handle bodies receive while running

pub mod executor;
pub mod options;
pub mod step;

pub use executor::{ActivityBuilder, Recovery};
pub use options::ActivityOptions;
pub use step::ActivityStep;
