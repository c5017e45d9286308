//! Ready-made [`sctx::Component`] implementations wrapping common clients.
//!
//! Every component takes its registry key in `new(id)` and declares its
//! options as `<id>-<option>` flags, so two instances of the same type (say a
//! primary and a replica database) never collide in the namespace.

use thiserror::Error;

pub mod http_client;
pub mod http_server;
pub mod log;
#[cfg(feature = "otel")]
pub mod otel;
pub mod redis_client;
pub mod sql;

pub use http_client::{HttpClientComponent, HttpResponse, RequestOptions};
pub use http_server::HttpServerComponent;
pub use log::LogComponent;
#[cfg(feature = "otel")]
pub use otel::OtelComponent;
pub use redis_client::{RedisComponent, RedisConnection};
pub use sql::SqlComponent;

/// Errors raised by component accessors and option validation.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("component '{component}' is not active")]
    NotActive { component: String },

    #[error("component '{component}' is already serving")]
    AlreadyServing { component: String },

    #[error("invalid value for '{flag}': {reason}")]
    InvalidOption { flag: String, reason: String },
}

impl ComponentError {
    pub(crate) fn not_active(component: &str) -> Self {
        ComponentError::NotActive {
            component: component.to_string(),
        }
    }

    pub(crate) fn invalid(flag: &sctx::Flag<impl Sized>, reason: impl Into<String>) -> Self {
        ComponentError::InvalidOption {
            flag: flag.name().to_string(),
            reason: reason.into(),
        }
    }
}

/// `<id>-<option>`, the flag name every component option uses.
pub(crate) fn flag_name(id: &str, option: &str) -> String {
    format!("{id}-{option}")
}

/// Read an integer flag that must fit a non-negative target type.
pub(crate) fn non_negative<T: TryFrom<i64>>(
    flag: &sctx::Flag<i64>,
    value: i64,
) -> Result<T, ComponentError> {
    T::try_from(value).map_err(|_| ComponentError::invalid(flag, format!("{value} is out of range")))
}
