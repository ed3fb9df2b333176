pub mod backup;
pub mod cluster;
pub mod cpuset;
pub mod error;
pub mod executor;
pub mod formatters;
pub mod irqbalance;
pub mod latency;
pub mod mcp;
pub mod models;
pub mod node_selector;
pub mod node_state;
pub mod pods;
pub mod poll;
pub mod profile;
pub mod sysconfig;
