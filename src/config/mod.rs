//! Configuration
//!
//! - [`Settings`] - client-wide knobs (timeouts, TLS, persistence policy)
//! - [`StrategyConfig`] - named credential fields owned by one strategy

mod settings;
mod strategy;

pub use settings::Settings;
pub use strategy::{fields, StrategyConfig};
