//! Row structs, enums, and hand-written SQL queries against PostgreSQL.
//!
//! Migrations run at runtime via [`pool::run_migrations`], not the
//! compile-time `sqlx::migrate!()` macro, so this crate type-checks without
//! a live database.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
