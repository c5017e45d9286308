//! Process-level bootstrap shared by service context binaries and components:
//! the tracing subscriber and termination signal handling.

pub mod logging;
pub mod signals;

pub use logging::*;
pub use signals::*;
