//! Supporting infrastructure shared by every stage.
//!
//! Error taxonomy, the bounded queue used between stages, and the time base /
//! clock types.

pub mod errors;
pub mod queue;
pub mod timing;
