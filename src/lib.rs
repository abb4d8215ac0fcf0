pub mod config;
pub mod format;
pub mod monitor;
pub mod render;
pub mod system;
