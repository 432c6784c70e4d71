//! Configuration Module
//!
//! Configuration loading for the tick hub.

mod settings;

pub use settings::{
    ClientSettings, ConfigError, DEFAULT_TICKER_URL, FeedSettings, HubConfig, InstrumentDirectory,
    ServerSettings,
};
