//! kadnet node library
//!
//! Configuration loading and the wiring that turns a [`config::Config`] into
//! a running node.

pub mod config;
pub mod node;

pub use config::Config;
pub use node::{ping, Node};
