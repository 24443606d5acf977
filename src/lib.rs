pub mod api;
pub mod core;
pub mod domain;
pub mod events;
pub mod gateway;
pub mod models;
pub mod notify;
pub mod routes;
pub mod schema;
pub mod settlement;
