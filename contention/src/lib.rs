pub mod concurrency;
pub mod coordinator;
pub mod error;
mod macros;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod workers;
