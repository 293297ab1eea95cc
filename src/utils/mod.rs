//! Shared utilities: errors, background workers and subprocess helpers.

pub mod error;
pub mod process;
pub mod worker;

pub use error::{AppError, AppResult, ErrorResponse};
pub use worker::{CancelToken, Ticker, Worker};
