pub mod config;
pub mod error;
pub mod hj212;
pub mod models;
pub mod upload;

pub use error::{AppError, Result};
