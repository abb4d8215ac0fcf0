pub mod collector;
pub mod filter;
pub mod network;
pub mod platform;
pub mod process;
pub mod sampler;
pub mod snapshot;
pub mod source;
