//! Job API surface: handler trait, registry adapter, axum routes and a
//! reqwest client.

mod error;
pub use error::ApiError;

mod types;
pub use types::*;

mod handler;
pub use handler::ApiHandler;

mod adapter;
pub use adapter::RegistryAdapter;

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::HttpApi;

#[cfg(feature = "http")]
pub use axum;

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::{JobsClient, LogStream};
