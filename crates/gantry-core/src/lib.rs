//! Shared vocabulary for the gantry run engine: branded identifiers, the run
//! lifecycle enums, the streamed event types, and the helpers consumed by
//! downstream protocol bridges.

pub mod bridge;
pub mod events;
pub mod ids;
pub mod run;
