pub mod config;
pub mod conversation;

pub use self::config::*;
pub use conversation::*;
