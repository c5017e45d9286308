use anyhow::Result;
use tokio::signal;

/// The signal that ended [`wait_for_shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Wait for termination signals (Ctrl+C, SIGTERM).
///
/// Returns which one arrived so the caller can start stopping its service
/// context; a failure to install a handler is an error.
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    let ctrl_c = async {
        signal::ctrl_c().await?;
        Ok::<_, std::io::Error>(ShutdownSignal::Interrupt)
    };

    #[cfg(unix)]
    let terminate = async {
        let mut handler = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        handler.recv().await;
        Ok::<_, std::io::Error>(ShutdownSignal::Terminate)
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<ShutdownSignal>>();

    let received = tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    };

    match received {
        Ok(sig) => {
            tracing::info!(signal = %sig, "Shutdown signal received, initiating graceful shutdown");
            Ok(sig)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install signal handler");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names() {
        assert_eq!(ShutdownSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(ShutdownSignal::Terminate.to_string(), "SIGTERM");
    }
}
