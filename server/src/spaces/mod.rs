//! Per-space state, fan-out, and ingress parsing.

pub mod broadcaster;
pub mod parser;

#[cfg(test)]
mod tests;

pub use broadcaster::{Presence, SpaceBroadcaster, SpaceQueue, SpaceUpdate};
pub use parser::ConnectionParser;
