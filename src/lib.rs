// Graphdesk - schema-driven editing client for a graph database server

// Server contract - schema catalogue, label templates, validation
pub mod schema;

// Wire types shared by the API, cache and views
pub mod records;

// REST client with bearer-token session handling
pub mod api;

// Local summary cache with delta synchronization
pub mod cache;

// Editing - form state, input masks, relation and inline editors
pub mod form;

// Service layer tying API, cache and schema together
pub mod service;

// Presentation - plain-text views and the interactive shell
pub mod shell;
pub mod views;

// Common utilities
pub mod config;
pub mod error;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
