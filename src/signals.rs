use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use facegate_core::errors::AppResult;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::SigId;
use tracing::debug;

/// Exit status used when a second signal arrives before the controller wound down.
pub const FORCED_SHUTDOWN_EXIT: i32 = 130;

/// SIGINT/SIGTERM handlers that raise a shared shutdown flag; unregistered on drop.
///
/// The first signal only raises the flag. A second one while the flag is still set terminates
/// the process, so a controller stuck in a device call can still be stopped.
pub struct ShutdownSignals {
    ids: Vec<SigId>,
}

impl ShutdownSignals {
    pub fn register(flag: &Arc<AtomicBool>) -> AppResult<Self> {
        let mut ids = Vec::with_capacity(4);
        for signal in [SIGINT, SIGTERM] {
            // Registered first so it sees the flag as it was before this delivery.
            ids.push(signal_hook::flag::register_conditional_shutdown(
                signal,
                FORCED_SHUTDOWN_EXIT,
                Arc::clone(flag),
            )?);
            ids.push(signal_hook::flag::register(signal, Arc::clone(flag))?);
        }
        debug!("installed shutdown signal handlers");
        Ok(Self { ids })
    }
}

impl Drop for ShutdownSignals {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
