//! Service context - owns the components and drives their lifecycle.
//!
//! Lifecycle: `Built → Loading → Loaded → Stopping → Stopped`, with `Failed`
//! as the terminal state of a load that could not activate every component.
//! Activation runs in registration order; shutdown runs in reverse.

use std::any::type_name;
use std::ffi::OsString;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Instant;

use clap::{ArgMatches, Command};
use parking_lot::Mutex;
use thiserror::Error;

use crate::component::{Component, ComponentEntry};
use crate::env::EnvTemplate;
use crate::flags::FlagSet;
use crate::registry::{ContextError, ServiceContextBuilder, ShutdownFailure};

/// Lifecycle phase of a [`ServiceContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Built,
    Loading,
    Loaded,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Built => "built",
            Phase::Loading => "loading",
            Phase::Loaded => "loaded",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a typed lookup did not produce a component.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("component '{key}' is not registered")]
    NotFound { key: String },
    #[error("component '{key}' requested while the service context is {phase}")]
    NotLoaded { key: String, phase: Phase },
    #[error("component '{key}' is not activated yet; only components registered before the caller are available during load")]
    NotActivated { key: String },
    #[error("component '{key}' is a '{actual}' and does not provide '{expected}'")]
    WrongCapability {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },
}

#[derive(Debug)]
struct LifecycleState {
    phase: Phase,
    // Number of leading entries currently activated.
    activated: usize,
}

// Armed while `load` or `stop` runs. If that future is dropped early the
// context becomes `Failed` with its activated prefix intact, so a later
// `stop` can still shut those components down.
struct Interrupted<'a> {
    service: &'a str,
    state: &'a Mutex<LifecycleState>,
    armed: bool,
}

impl<'a> Interrupted<'a> {
    fn arm(service: &'a str, state: &'a Mutex<LifecycleState>) -> Self {
        Self {
            service,
            state,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Interrupted<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock();
        let phase = state.phase;
        state.phase = Phase::Failed;
        tracing::warn!(
            service = %self.service,
            %phase,
            pending = state.activated,
            "Lifecycle operation dropped before completion"
        );
    }
}

/// One process's composed service: an ordered set of components, the flag
/// namespace they declared, and the lifecycle state machine.
pub struct ServiceContext {
    name: String,
    entries: Vec<ComponentEntry>,
    flags: FlagSet,
    state: Mutex<LifecycleState>,
}

impl ServiceContext {
    pub fn builder() -> ServiceContextBuilder {
        ServiceContextBuilder::new()
    }

    pub(crate) fn from_parts(name: String, entries: Vec<ComponentEntry>, flags: FlagSet) -> Self {
        Self {
            name,
            entries,
            flags,
            state: Mutex::new(LifecycleState {
                phase: Phase::Built,
                activated: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// Component keys in registration order.
    pub fn component_ids(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.id.as_str()).collect()
    }

    /// The flag namespace; read-only once parsed.
    pub fn config(&self) -> &FlagSet {
        &self.flags
    }

    // ---------------------------------------------------------------------
    // configuration
    // ---------------------------------------------------------------------

    /// Add every registered flag to a caller-owned command.
    pub fn augment_command(&self, cmd: Command) -> Command {
        self.flags.augment_command(cmd)
    }

    /// Apply matches from a command built with [`ServiceContext::augment_command`].
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), ContextError> {
        self.ensure_built("parse flags of")?;
        self.flags.apply_matches(matches)?;
        Ok(())
    }

    /// Parse command-line arguments and the environment into the namespace.
    pub fn parse_from<I, T>(&mut self, args: I) -> Result<(), ContextError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        self.ensure_built("parse flags of")?;
        let bin_name = if self.name.is_empty() {
            "service".to_string()
        } else {
            self.name.clone()
        };
        self.flags.parse_from(&bin_name, args)?;
        Ok(())
    }

    /// Parse the environment only; no command-line arguments.
    pub fn parse_env(&mut self) -> Result<(), ContextError> {
        let bin_name = self.name.clone();
        self.parse_from([bin_name])
    }

    fn ensure_built(&mut self, operation: &'static str) -> Result<(), ContextError> {
        let phase = self.state.get_mut().phase;
        if phase != Phase::Built {
            return Err(ContextError::InvalidState { operation, phase });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // environment dump
    // ---------------------------------------------------------------------

    /// Print one `NAME=value` line per registered flag to stdout.
    ///
    /// Never activates a component; callable before [`ServiceContext::load`].
    pub fn out_env(&self) -> io::Result<()> {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        self.write_env(&mut lock)?;
        lock.flush()
    }

    pub fn write_env<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        self.env_template().write_to(out)
    }

    pub fn env_template(&self) -> EnvTemplate<'_> {
        self.flags.env_template()
    }

    // ---------------------------------------------------------------------
    // lifecycle
    // ---------------------------------------------------------------------

    /// Activate every component in registration order.
    ///
    /// On the first failure the components activated so far are shut down in
    /// reverse order, the context moves to [`Phase::Failed`] and the error
    /// names the failing component.
    ///
    /// Dropping the returned future part way also leaves the context
    /// [`Phase::Failed`]; [`ServiceContext::stop`] then shuts down whatever
    /// had already been activated.
    pub async fn load(&self) -> Result<(), ContextError> {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Built {
                return Err(ContextError::InvalidState {
                    operation: "load",
                    phase: state.phase,
                });
            }
            state.phase = Phase::Loading;
        }
        let guard = Interrupted::arm(&self.name, &self.state);

        tracing::info!(service = %self.name, components = self.entries.len(), "Phase: activate");

        for (idx, entry) in self.entries.iter().enumerate() {
            let started = Instant::now();
            tracing::debug!(component = %entry.id, "Activating component");

            if let Err(source) = entry.component.activate(self).await {
                tracing::error!(
                    component = %entry.id,
                    error = %source,
                    "Component activation failed; rolling back"
                );
                self.state.lock().activated = idx;
                let failures = self.shutdown_activated().await;
                if !failures.is_empty() {
                    tracing::warn!(
                        failed = failures.len(),
                        "Rollback finished with shutdown errors"
                    );
                }
                self.state.lock().phase = Phase::Failed;
                guard.disarm();
                return Err(ContextError::Activate {
                    component: entry.id.clone(),
                    source,
                });
            }

            self.state.lock().activated = idx + 1;
            tracing::info!(
                component = %entry.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Component activated"
            );
        }

        self.state.lock().phase = Phase::Loaded;
        guard.disarm();
        tracing::info!(service = %self.name, "Service context loaded");
        Ok(())
    }

    /// Shut every component down in reverse registration order.
    ///
    /// A failing shutdown never prevents the remaining ones; all failures are
    /// reported together. A no-op unless the context is loaded, or failed
    /// with components left over from an interrupted `load` or `stop`; the
    /// latter keeps the context `Failed`.
    pub async fn stop(&self) -> Result<(), ContextError> {
        let finished = {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Loaded => {
                    state.phase = Phase::Stopping;
                    Phase::Stopped
                }
                Phase::Failed if state.activated > 0 => {
                    state.phase = Phase::Stopping;
                    Phase::Failed
                }
                Phase::Loading => {
                    return Err(ContextError::InvalidState {
                        operation: "stop",
                        phase: state.phase,
                    })
                }
                phase => {
                    tracing::debug!(service = %self.name, %phase, "Stop is a no-op");
                    return Ok(());
                }
            }
        };
        let guard = Interrupted::arm(&self.name, &self.state);

        tracing::info!(service = %self.name, "Phase: shutdown");
        let failures = self.shutdown_activated().await;
        self.state.lock().phase = finished;
        guard.disarm();

        if failures.is_empty() {
            tracing::info!(service = %self.name, "Service context stopped");
            Ok(())
        } else {
            Err(ContextError::Shutdown { failures })
        }
    }

    // Shut down the activated prefix, last first.
    async fn shutdown_activated(&self) -> Vec<ShutdownFailure> {
        let activated = self.state.lock().activated;
        let mut failures = Vec::new();

        for entry in self.entries[..activated].iter().rev() {
            tracing::debug!(component = %entry.id, "Shutting down component");
            if let Err(error) = entry.component.shutdown().await {
                tracing::warn!(component = %entry.id, error = %error, "Failed to shut down component");
                failures.push(ShutdownFailure {
                    component: entry.id.clone(),
                    error,
                });
            }
            self.state.lock().activated -= 1;
        }

        failures
    }

    // ---------------------------------------------------------------------
    // lookup
    // ---------------------------------------------------------------------

    /// Typed lookup explaining why it failed.
    ///
    /// `T` is the concrete component type, `dyn Component`, or a capability
    /// added with [`crate::Registration::provides`].
    pub fn lookup<T>(&self, key: &str) -> Result<Arc<T>, LookupError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let (idx, entry) = self
            .entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.id == key)
            .ok_or_else(|| LookupError::NotFound {
                key: key.to_string(),
            })?;

        {
            let state = self.state.lock();
            match state.phase {
                Phase::Loaded => {}
                Phase::Loading if idx < state.activated => {}
                Phase::Loading => {
                    return Err(LookupError::NotActivated {
                        key: key.to_string(),
                    })
                }
                phase => {
                    return Err(LookupError::NotLoaded {
                        key: key.to_string(),
                        phase,
                    })
                }
            }
        }

        entry.view::<T>().ok_or_else(|| LookupError::WrongCapability {
            key: key.to_string(),
            expected: type_name::<T>(),
            actual: entry.type_name,
        })
    }

    /// Non-fatal typed lookup.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.lookup::<T>(key).ok()
    }

    /// Typed lookup for composition code. A missing key, an unloaded context
    /// or a wrong capability is a programming error and panics.
    #[track_caller]
    pub fn must_get<T>(&self, key: &str) -> Arc<T>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        match self.lookup::<T>(key) {
            Ok(component) => component,
            Err(e) => panic!("service context '{}': {e}", self.name),
        }
    }

    /// Untyped lookup.
    pub fn component(&self, key: &str) -> Option<Arc<dyn Component>> {
        self.get::<dyn Component>(key)
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("name", &self.name)
            .field("components", &self.component_ids())
            .field("flags", &self.flags.len())
            .field("phase", &self.phase())
            .finish()
    }
}
