//! Utilities for tests exercising the harness against a real Postgres server.
//!
//! - [`database`] creates an isolated database holding a seeded record table.

pub mod database;
