pub mod config;
pub mod context;
pub mod credentials;
pub mod db;
pub mod error;
pub mod imap;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;

pub use context::AppContext;
