pub mod config;
pub mod content;
pub mod encoding;
pub mod entropy;
pub mod error;
pub mod flow;
pub mod models;
pub mod persist;
pub mod pipeline;
pub mod rules;
pub mod store;
pub mod transport;
pub mod views;

#[cfg(test)]
pub(crate) mod testutil;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
