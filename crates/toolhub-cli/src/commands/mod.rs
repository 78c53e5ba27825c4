//! CLI command implementations.

pub mod catalog;
pub mod config;
pub mod doctor;
pub mod output;
pub mod serve;
