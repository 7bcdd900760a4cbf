use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{LocalMedia, LocalTrack, MediaDevices};
use crate::error::MediaError;
use crate::model::{Capability, CaptureFlags};

/// Device backend that hands out silent tracks. Individual capabilities can
/// be marked missing to exercise acquisition failures.
#[derive(Default)]
pub struct SyntheticDevices {
    missing: Mutex<Vec<Capability>>,
    issued: Mutex<Vec<Arc<LocalTrack>>>,
}

impl SyntheticDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_available(&self, capability: Capability, available: bool) {
        let mut missing = self.missing.lock();
        missing.retain(|cap| *cap != capability);
        if !available {
            missing.push(capability);
        }
    }

    /// Tracks handed out and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        self.issued
            .lock()
            .iter()
            .filter(|track| !track.is_stopped())
            .count()
    }

    pub fn issued_tracks(&self) -> usize {
        self.issued.lock().len()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, request: &CaptureFlags) -> Result<LocalMedia, MediaError> {
        let mut wanted = vec![
            (Capability::Microphone, request.mic_on),
            (Capability::Camera, request.cam_on),
        ];
        if request.screen_on {
            wanted.push((Capability::Screen, true));
        }

        {
            let missing = self.missing.lock();
            if let Some((capability, _)) = wanted.iter().find(|(cap, _)| missing.contains(cap)) {
                return Err(MediaError::DeviceUnavailable(
                    *capability,
                    "no synthetic device".into(),
                ));
            }
        }

        let stream_id = format!("synthetic-{}", uuid::Uuid::new_v4());
        let tracks: Vec<Arc<LocalTrack>> = wanted
            .into_iter()
            .map(|(capability, enabled)| Arc::new(LocalTrack::new(capability, &stream_id, enabled)))
            .collect();
        self.issued.lock().extend(tracks.iter().cloned());
        tracing::debug!(
            target = "camp_live::session",
            tracks = tracks.len(),
            "synthetic media acquired"
        );
        Ok(LocalMedia::new(tracks, request.share_target.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn camera_and_mic_always_acquired() {
        let devices = SyntheticDevices::new();
        let media = devices
            .acquire(&CaptureFlags::default())
            .await
            .expect("acquire");
        assert_eq!(media.tracks().len(), 2);
        assert!(media.track(Capability::Screen).is_none());
        assert_eq!(devices.live_tracks(), 2);
        media.release();
        assert_eq!(devices.live_tracks(), 0);
    }

    #[tokio::test]
    async fn missing_device_fails_without_issuing() {
        let devices = SyntheticDevices::new();
        devices.set_available(Capability::Screen, false);
        let request = CaptureFlags {
            screen_on: true,
            ..CaptureFlags::default()
        };
        assert!(matches!(
            devices.acquire(&request).await,
            Err(MediaError::DeviceUnavailable(Capability::Screen, _))
        ));
        assert_eq!(devices.issued_tracks(), 0);
    }
}
