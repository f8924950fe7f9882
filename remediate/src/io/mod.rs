//! Side-effecting adapters: the file-backed substrate, stores, child processes
//! and the production collaborators.

pub mod agent;
pub mod apply;
pub mod atomic;
pub mod config;
pub mod config_audit;
pub mod diagnostics;
pub mod file_fix;
pub mod inbox;
pub mod init;
pub mod journal;
pub mod notify;
pub mod paths;
pub mod process;
pub mod prompt;
pub mod store;
pub mod substrate;
