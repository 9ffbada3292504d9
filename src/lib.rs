#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

pub mod catalog;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod extensions;
pub mod log;
pub mod output;
pub mod runner;
pub mod sysinfo;
