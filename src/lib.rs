pub mod config;
pub mod signaling;
