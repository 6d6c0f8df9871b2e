//! MarketPulse - Library Root
//!
//! Re-exports all modules for integration tests.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod usecases;
