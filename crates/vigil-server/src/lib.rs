//! REST API server: diagnostics, score snapshots, circuit administration
//! and OpenAPI documentation.

pub mod auth;
pub mod backend;
pub mod dto;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod state;
