//! CLI module

pub mod commands;

pub use commands::*;
