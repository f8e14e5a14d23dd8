//! Registries of running queries and shared streams.
pub mod executor;

pub use executor::{ExecutorCache, WindowKey};
