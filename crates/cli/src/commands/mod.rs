//! CLI Commands

pub mod capabilities;
pub mod config;
pub mod dlt;
