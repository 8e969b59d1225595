use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Owns the root cancellation token. SIGTERM or Ctrl+C cancels it; every
/// runtime task watches a clone or a child of it.
#[derive(Debug, Clone, Default)]
pub struct ShutdownGuard {
    token: CancellationToken,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing token, e.g. one the transport also cancels.
    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self, reason: &str) {
        if !self.token.is_cancelled() {
            tracing::info!(reason, "shutdown requested");
            self.token.cancel();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token on the first OS termination signal.
    pub fn spawn_signal_listener(&self) {
        let guard = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.token.cancelled() => {}
                reason = wait_for_signal() => guard.trigger(reason),
            }
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler");
            return match signal::ctrl_c().await {
                Ok(()) => "ctrl-c",
                Err(_) => std::future::pending().await,
            };
        }
    };
    tokio::select! {
        _ = sigterm.recv() => "sigterm",
        r = signal::ctrl_c() => match r {
            Ok(()) => "ctrl-c",
            Err(_) => std::future::pending().await,
        },
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    match signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(_) => std::future::pending().await,
    }
}
