//! Service plumbing shared by every route module: error envelope, state,
//! config, bootstrap, database pool, outbox and identity middleware.

pub mod aliases;
pub mod app_error;
pub mod app_state;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod middleware;
pub mod outbox;
pub mod swagger;
