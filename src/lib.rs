pub mod config;
pub mod dist;
pub mod pass_graph;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod transport;
