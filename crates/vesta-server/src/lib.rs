//! Vesta server library
//!
//! HTTP surface, configuration loading, logging bootstrap and engine wiring
//! for the configuration release engine.

pub mod api;
pub mod metrics;
pub mod model;
pub mod startup;
