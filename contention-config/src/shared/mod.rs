mod base;
mod connection;
mod harness;

pub use base::*;
pub use connection::*;
pub use harness::*;
