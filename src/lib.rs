//! A temporary file drop: upload a file, get a short link, and let it
//! expire on its own.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
