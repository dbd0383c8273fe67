pub mod api;
pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod translate;

pub use discovery::Discoverer;
pub use error::{Error, Result};
