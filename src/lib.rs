//! RouteForge HTTP edge.
//!
//! Thin axum front end over [`routeforge_core`]: translates HTTP requests
//! into `RequestDescriptor`s, drives a shared `Dispatcher`, and maps the
//! core's routing error codes onto HTTP status codes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;

pub use error::{Error, Result};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Setup tracing/logging, matching the existing convention: an `EnvFilter`
/// seeded from `RUST_LOG` (falling back to `level`), and a `fmt` layer that
/// switches to JSON when `format` is `"json"`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
