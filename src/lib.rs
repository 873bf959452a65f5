//! Credit Market Library
//!
//! Trading and accounting core for binary YES/NO prediction markets priced by
//! an LMSR market maker and settled in play-money credits.

#[macro_use]
pub mod database;

pub mod accounts;
pub mod allowance;
pub mod config;
pub mod db_adapter;
pub mod error;
pub mod lmsr_core;
pub mod markets;
pub mod models;
pub mod money;
pub mod settlement;
pub mod stress;
pub mod suggestions;
pub mod trade_sizer;
pub mod trading;

#[cfg(test)]
mod tests;

#[cfg(test)]
mod integration_tests;

pub use config::Config;
pub use error::{EngineError, Result};
