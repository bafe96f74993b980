//! REST API server: task intake, status lookups, and extraction results.

pub mod auth;
pub mod dto;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod state;
