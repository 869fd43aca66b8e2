#![warn(missing_docs)]

//! binvault management: configuration loading, store administration and the admin CLI.

pub mod admin;
pub mod cli;
pub mod config;

pub use admin::{Admin, StoreRow};
pub use config::MgmtConfig;
