//! OS signal handling.
//!
//! The first SIGINT/SIGTERM/SIGQUIT triggers the [`StopSignal`] so the
//! orchestrator can drain. A second signal means the operator gave up on the
//! graceful path and the process exits immediately.

use crate::lifecycle::StopSignal;

/// Bridge OS termination signals into `stop`.
///
/// Handlers are registered before this returns; failing to register them is
/// an error, since the process could then not be stopped gracefully.
/// Must be called from within a Tokio runtime.
pub fn install(stop: StopSignal) -> std::io::Result<()> {
    let mut signals = ShutdownSignals::register()?;
    tokio::spawn(async move {
        signals.recv().await;
        tracing::info!("Shutdown signal received, draining");
        stop.trigger();

        signals.recv().await;
        tracing::warn!("Second shutdown signal received, exiting immediately");
        std::process::exit(1);
    });
    Ok(())
}

/// Registered termination signal streams.
#[cfg(unix)]
pub struct ShutdownSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sigquit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    pub fn register() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    /// Waits for the next termination signal.
    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv() => {},
            _ = self.sigterm.recv() => {},
            _ = self.sigquit.recv() => {},
        }
    }
}

/// Registered termination signal streams.
#[cfg(windows)]
pub struct ShutdownSignals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(windows)]
impl ShutdownSignals {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    /// Waits for the next termination signal.
    pub async fn recv(&mut self) {
        self.ctrl_c.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_install_registers_without_stopping() {
        let stop = StopSignal::new();
        install(stop.clone()).unwrap();
        tokio::task::yield_now().await;
        assert!(!stop.is_triggered());
    }
}
