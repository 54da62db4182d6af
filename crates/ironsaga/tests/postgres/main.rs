//! Integration tests against PostgreSQL.
//!
//! Requires `TEST_ADMIN_DATABASE_URL`; see `test_utils::db`.

#[path = "../support/mod.rs"]
mod support;

mod handler;
mod runtime;
mod store;
