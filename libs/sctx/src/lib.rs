//! # sctx - Service Context
//!
//! A process-wide registry that binds independently implemented components
//! (database pools, caches, tracers, HTTP servers) into one deterministic
//! startup/shutdown sequence with a single command-line/environment
//! configuration surface.
//!
//! ## Features
//!
//! - **Ordered lifecycle**: components activate in registration order and shut
//!   down in reverse; a failed activation rolls back what was already started
//! - **One flag namespace**: every component option is a `--flag` and an
//!   `ENV_VAR` at the same time
//! - **Typed lookup**: retrieve activated components by key as their concrete
//!   type, `dyn Component`, or a declared capability trait object
//! - **outenv**: render the whole configuration surface as an env file
//!   without starting anything
//!
//! ## Example
//!
//! ```rust,ignore
//! use sctx::ServiceContext;
//!
//! let mut ctx = ServiceContext::builder()
//!     .with_name("orders")
//!     .with_component(LogComponent::new())
//!     .with_component(SqlComponent::new("db"))
//!     .with_component(HttpServerComponent::new("http"))
//!     .build()?;
//!
//! ctx.parse_from(std::env::args())?;
//! ctx.load().await?;
//!
//! let db = ctx.must_get::<SqlComponent>("db");
//! // ... serve ...
//!
//! ctx.stop().await?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod component;
pub mod context;
pub mod env;
pub mod flags;
pub mod registry;

pub use component::{Component, IntoRegistration, Registration};
pub use context::{LookupError, Phase, ServiceContext};
pub use env::EnvTemplate;
pub use flags::{env_name, ConfigError, Flag, FlagKind, FlagSet, FlagSpec, FlagType, FlagValue};
pub use registry::{ContextError, ServiceContextBuilder, ShutdownFailure};

#[cfg(test)]
mod tests;
