//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod bitmap;
mod timer;
mod safetcp;

pub use error::ViewstampError;
pub use bitmap::ReplicaMap;
pub use timer::Timer;
pub use print::logger_init;

pub(crate) use safetcp::{safe_tcp_read, tcp_write_obj};
