//! Service context builder and the registry error taxonomy.

use std::any::type_name;

use thiserror::Error;

use crate::component::{ComponentEntry, IntoRegistration};
use crate::context::{Phase, ServiceContext};
use crate::flags::{ConfigError, FlagSet};

/// Assembles a [`ServiceContext`] from a name and an ordered component list.
///
/// Each component's flags are registered as soon as it is appended, so the
/// namespace is complete when [`ServiceContextBuilder::build`] returns.
/// Problems (empty or duplicate keys) are collected and reported by `build`.
#[derive(Default)]
pub struct ServiceContextBuilder {
    name: String,
    entries: Vec<ComponentEntry>,
    flags: FlagSet,
    errors: Vec<String>,
}

impl ServiceContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append a component (or a [`crate::Registration`]) and register its flags.
    pub fn with_component<R: IntoRegistration>(mut self, component: R) -> Self {
        let registration = component.into_registration();
        let id = registration.id().to_string();

        if id.is_empty() {
            self.errors.push(format!(
                "Component of type '{}' has an empty id",
                type_name::<R::Component>()
            ));
            return self;
        }
        if self.entries.iter().any(|e| e.id == id) {
            self.errors
                .push(format!("Component '{id}' is already registered"));
            return self;
        }

        let entry = registration.register(&mut self.flags);
        tracing::debug!(component = %entry.id, flags = self.flags.len(), "Component registered");
        self.entries.push(entry);
        self
    }

    /// Finalize; fails on any construction problem before any I/O happens.
    pub fn build(self) -> Result<ServiceContext, ContextError> {
        if !self.errors.is_empty() {
            return Err(ContextError::InvalidConfiguration {
                errors: self.errors,
            });
        }

        tracing::info!(
            service = %self.name,
            components = ?self.entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            "Service context built"
        );

        Ok(ServiceContext::from_parts(self.name, self.entries, self.flags))
    }
}

impl std::fmt::Debug for ServiceContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.entries.iter().map(|e| e.id.as_str()).collect();
        f.debug_struct("ServiceContextBuilder")
            .field("name", &self.name)
            .field("components", &ids)
            .field("errors", &self.errors)
            .finish()
    }
}

/// One component whose shutdown failed.
#[derive(Debug)]
pub struct ShutdownFailure {
    pub component: String,
    pub error: anyhow::Error,
}

fn failed_ids(failures: &[ShutdownFailure]) -> String {
    failures
        .iter()
        .map(|f| f.component.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Structured errors for the service context.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid service context configuration:\n{errors:#?}")]
    InvalidConfiguration { errors: Vec<String> },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("activation failed for component '{component}'")]
    Activate {
        component: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("shutdown failed for component(s): {}", failed_ids(.failures))]
    Shutdown { failures: Vec<ShutdownFailure> },

    #[error("cannot {operation} a service context in phase '{phase}'")]
    InvalidState {
        operation: &'static str,
        phase: Phase,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Component;
    use crate::flags::Flag;

    /* --------------------------- Test helpers ------------------------- */
    struct Dummy {
        id: &'static str,
        flag: &'static str,
    }

    #[async_trait::async_trait]
    impl Component for Dummy {
        fn id(&self) -> &str {
            self.id
        }
        fn register_config(&mut self, flags: &mut FlagSet) {
            flags.string(self.flag, "x", "dummy option");
        }
        async fn activate(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /* ------------------------------- Tests ---------------------------- */

    #[test]
    fn build_keeps_registration_order_and_flags() {
        let ctx = ServiceContextBuilder::new()
            .with_name("svc")
            .with_component(Dummy { id: "b", flag: "b-opt" })
            .with_component(Dummy { id: "a", flag: "a-opt" })
            .build()
            .unwrap();

        assert_eq!(ctx.name(), "svc");
        assert_eq!(ctx.component_ids(), vec!["b", "a"]);
        let names: Vec<&str> = ctx.config().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["b-opt", "a-opt"]);
        assert_eq!(ctx.config().get(&Flag::<String>::new("a-opt")).unwrap(), "x");
    }

    #[test]
    fn duplicate_component_reported_in_configuration_errors() {
        let err = ServiceContextBuilder::new()
            .with_component(Dummy { id: "a", flag: "a-1" })
            .with_component(Dummy { id: "a", flag: "a-2" })
            .build()
            .unwrap_err();

        match err {
            ContextError::InvalidConfiguration { errors } => {
                assert!(
                    errors.iter().any(|e| e.contains("already registered")),
                    "expected duplicate registration error, got {errors:?}"
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_id_is_rejected() {
        let err = ServiceContextBuilder::new()
            .with_component(Dummy { id: "", flag: "x" })
            .build()
            .unwrap_err();
        assert!(matches!(err, ContextError::InvalidConfiguration { .. }));
        assert!(err.to_string().contains("empty id"));
    }

    #[test]
    fn shutdown_error_lists_components() {
        let err = ContextError::Shutdown {
            failures: vec![
                ShutdownFailure {
                    component: "c".into(),
                    error: anyhow::anyhow!("boom"),
                },
                ShutdownFailure {
                    component: "a".into(),
                    error: anyhow::anyhow!("bang"),
                },
            ],
        };
        assert_eq!(err.to_string(), "shutdown failed for component(s): c, a");
    }
}
