//! Utility modules: retry, timeout races, text truncation.

pub mod retry;
pub mod text;
pub mod timeout;
