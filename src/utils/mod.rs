//! Utility modules: error taxonomy, filesystem helpers, logging.
pub mod errors;
pub mod fsutil;
pub mod logger;
