//! Coordination primitives shared by the coordinator and its update workers.
//!
//! The harness uses a single broadcast-style cancellation signal instead of per-worker token
//! queues: once a stop is requested, every subscriber observes it, so there is no way for one
//! worker to consume the stop meant for a sibling.

pub mod cancellation;
