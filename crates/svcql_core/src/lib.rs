pub mod cache;
pub mod condition;
pub mod config;
pub mod execution;
pub mod generator;
pub mod graph;
pub mod optimization;
pub mod protocol;
pub mod query;
pub mod service;
pub mod streaming;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod types;
