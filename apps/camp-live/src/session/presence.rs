use std::sync::Arc;
use std::time::Duration;

use stream_registry::{Heartbeat, SessionRegistry};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::model::CaptureFlags;

/// Periodic registry heartbeat for an owned session.
///
/// The first beat goes out one interval after start. A failed beat is logged
/// and tolerated; `budget` consecutive failures report exhaustion once and
/// stop the monitor.
pub struct PresenceMonitor {
    handle: JoinHandle<()>,
}

impl PresenceMonitor {
    pub fn start(
        registry: Arc<dyn SessionRegistry>,
        session_id: String,
        flags: watch::Receiver<CaptureFlags>,
        interval: Duration,
        budget: u32,
        exhausted: mpsc::UnboundedSender<u32>,
    ) -> Self {
        let handle = tokio::spawn(run(registry, session_id, flags, interval, budget.max(1), exhausted));
        Self { handle }
    }

    /// Cancel the timer and wait for any in-flight beat to be dropped.
    pub async fn stop(self) {
        self.handle.abort();
        let _ = self.handle.await;
    }
}

async fn run(
    registry: Arc<dyn SessionRegistry>,
    session_id: String,
    flags: watch::Receiver<CaptureFlags>,
    interval: Duration,
    budget: u32,
    exhausted: mpsc::UnboundedSender<u32>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        ticker.tick().await;
        let current = flags.borrow().clone();
        let heartbeat = Heartbeat {
            session_id: session_id.clone(),
            mic_on: current.mic_on,
            cam_on: current.cam_on,
            screen_on: current.screen_on,
            share_target: current.share_target,
        };

        // A hung request counts as a failed beat.
        let result = match tokio::time::timeout(interval, registry.heartbeat(&heartbeat)).await {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(_) => Err("heartbeat timed out".to_string()),
        };

        match result {
            Ok(()) => {
                if failures > 0 {
                    tracing::info!(
                        target = "camp_live::presence",
                        session = %session_id,
                        after = failures,
                        "heartbeat recovered"
                    );
                }
                failures = 0;
                tracing::trace!(target = "camp_live::presence", session = %session_id, "heartbeat sent");
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(
                    target = "camp_live::presence",
                    session = %session_id,
                    failures,
                    budget,
                    error = %err,
                    "heartbeat failed"
                );
                if failures >= budget {
                    let _ = exhausted.send(failures);
                    return;
                }
            }
        }
    }
}
