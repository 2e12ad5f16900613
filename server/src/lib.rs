pub mod config;
pub mod controller;
pub mod error;
pub mod handlers;
pub mod health;
pub mod jobs;
pub mod lock;
pub mod metrics;
pub mod models;
pub mod realtime;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
