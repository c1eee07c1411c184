pub mod config;
pub mod error;
pub mod policy;

pub use error::{HuskError, HuskResult};
