pub mod calls;
pub mod config;

pub use calls::*;
pub use config::*;
