//! Local capture tracks.
//!
//! The controller owns [`LocalMedia`] for the lifetime of a session and lends
//! the tracks to peer links; links add them to their transports but never stop
//! them. Toggling a capability only flips enablement, so no renegotiation is
//! needed.

pub mod synthetic;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaError;
use crate::model::{Capability, CaptureFlags};

pub use synthetic::SyntheticDevices;

/// Source of capture tracks. Real device backends and the synthetic one used
/// in tests implement this.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire tracks for `request`. Camera and microphone are always
    /// acquired (enabled per the flags) so they can be toggled later; screen
    /// capture is acquired only when requested.
    async fn acquire(&self, request: &CaptureFlags) -> Result<LocalMedia, MediaError>;
}

pub struct LocalTrack {
    capability: Capability,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(capability: Capability, stream_id: &str, enabled: bool) -> Self {
        let codec = match capability {
            Capability::Microphone => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            Capability::Camera | Capability::Screen => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90_000,
                ..Default::default()
            },
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            format!("{capability}-{}", uuid::Uuid::new_v4()),
            stream_id.to_string(),
        ));
        Self {
            capability,
            enabled: AtomicBool::new(enabled),
            stopped: AtomicBool::new(false),
            rtc,
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn id(&self) -> &str {
        self.rtc.id()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtc.clone()
    }

    /// Push one encoded frame. Disabled or stopped tracks swallow samples.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), MediaError> {
        if !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }
        self.rtc
            .write_sample(sample)
            .await
            .map_err(|err| MediaError::Write(err.to_string()))
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
        self.stopped.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("capability", &self.capability)
            .field("id", &self.id())
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug)]
pub struct LocalMedia {
    tracks: Vec<Arc<LocalTrack>>,
    share_target: Option<String>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<LocalTrack>>, share_target: Option<String>) -> Self {
        Self {
            tracks,
            share_target,
        }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn track(&self, capability: Capability) -> Option<&Arc<LocalTrack>> {
        self.tracks
            .iter()
            .find(|track| track.capability() == capability)
    }

    /// Flip enablement of an acquired track. `None` when the capability was
    /// never acquired.
    pub fn toggle(&self, capability: Capability) -> Option<bool> {
        let track = self.track(capability)?;
        if track.is_stopped() {
            return None;
        }
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        Some(enabled)
    }

    pub fn flags(&self) -> CaptureFlags {
        let mut flags = CaptureFlags {
            share_target: self.share_target.clone(),
            ..CaptureFlags::default()
        };
        for track in &self.tracks {
            if track.is_enabled() {
                flags.set(track.capability(), true);
            }
        }
        if !flags.screen_on {
            flags.share_target = None;
        }
        flags
    }

    /// Stop every track. Safe to call more than once.
    pub fn release(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media(screen: bool) -> LocalMedia {
        let mut tracks = vec![
            Arc::new(LocalTrack::new(Capability::Microphone, "s", false)),
            Arc::new(LocalTrack::new(Capability::Camera, "s", true)),
        ];
        if screen {
            tracks.push(Arc::new(LocalTrack::new(Capability::Screen, "s", true)));
        }
        LocalMedia::new(tracks, Some("editor".into()))
    }

    #[test]
    fn toggle_flips_only_acquired_tracks() {
        let media = media(false);
        assert_eq!(media.toggle(Capability::Microphone), Some(true));
        assert_eq!(media.toggle(Capability::Screen), None);
        let flags = media.flags();
        assert!(flags.mic_on && flags.cam_on && !flags.screen_on);
        assert_eq!(flags.share_target, None);
    }

    #[test]
    fn share_target_reported_with_screen() {
        let flags = media(true).flags();
        assert!(flags.screen_on);
        assert_eq!(flags.share_target.as_deref(), Some("editor"));
    }

    #[test]
    fn release_is_idempotent_and_blocks_toggle() {
        let media = media(true);
        media.release();
        media.release();
        assert!(media.tracks().iter().all(|track| track.is_stopped()));
        assert_eq!(media.toggle(Capability::Camera), None);
        assert_eq!(media.flags(), CaptureFlags::default());
    }

    #[tokio::test]
    async fn disabled_tracks_swallow_samples() {
        let track = LocalTrack::new(Capability::Camera, "s", false);
        track.write_sample(&Sample::default()).await.unwrap();
        track.stop();
        track.write_sample(&Sample::default()).await.unwrap();
    }
}
