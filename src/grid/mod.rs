//! Two-sided grid strategy components.
//!
//! This module exposes the high-level `GridRunner` session orchestrator
//! together with its building blocks: configuration, the pure pricing
//! policy, and the order lifecycle engine.

pub mod config;
pub mod engine;
pub mod policy;
pub mod runner;

pub use config::GridConfig;
pub use engine::GridEngine;
pub use policy::GridPolicy;
pub use runner::GridRunner;
