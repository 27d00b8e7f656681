//! Scenarios spanning the state store, block log, fork database and
//! controller.

pub mod fixtures;

mod block_flow;
mod deferred;
mod forks;
mod protocol_features;
mod recovery;
