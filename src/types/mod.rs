//! Shared types
//!
//! Conversation turns, model descriptors, load configuration and sampling
//! parameters.

pub mod config;
pub mod message;
pub mod model;
pub mod sampling;
