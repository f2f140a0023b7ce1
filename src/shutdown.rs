//! Signal handling for a running sync.
//!
//! The first SIGINT, SIGTERM or SIGHUP cancels the returned token: the
//! pipeline stops admitting new items and lets in-flight transfers settle so
//! the ledger stays consistent. A second signal exits immediately.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Exit status for a forced stop (128 + SIGINT).
const FORCE_EXIT_CODE: i32 = 130;

pub(crate) fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    let handler_token = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut unix_signals = {
            use tokio::signal::unix::{signal, SignalKind};
            match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                (Ok(term), Ok(hup)) => Some((term, hup)),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(error = %e, "SIGTERM/SIGHUP unavailable, only Ctrl+C will stop the run");
                    None
                }
            }
        };

        loop {
            #[cfg(unix)]
            {
                match unix_signals.as_mut() {
                    Some((term, hup)) => {
                        tokio::select! {
                            _ = tokio::signal::ctrl_c() => {}
                            _ = term.recv() => {}
                            _ = hup.recv() => {}
                        }
                    }
                    None => {
                        if tokio::signal::ctrl_c().await.is_err() {
                            return;
                        }
                    }
                }
            }

            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
            }

            let prev = count.fetch_add(1, Ordering::SeqCst);
            if prev == 0 {
                tracing::info!("Received shutdown signal, finishing in-flight transfers...");
                tracing::info!("Press Ctrl+C again to force exit");
                handler_token.cancel();
            } else {
                tracing::warn!("Force exit requested; in-progress items will be re-claimed after the stall threshold");
                std::process::exit(FORCE_EXIT_CODE);
            }
        }
    });

    token
}
