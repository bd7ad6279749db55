use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use voxmesh_core::models::{CaptureWindow, DeviceInfo, DeviceKind, DisplayCaptureOptions, TrackKind};
use voxmesh_core::{Error, LocalTrack, MediaErrorReason, Result, TrackEndReason};

use super::SessionCoordinator;
use crate::events::{SessionEvent, SessionState};
use crate::link::PeerLink;

impl SessionCoordinator {
    /// Flip the mute flag. Only gates the voice source; links are untouched.
    pub async fn toggle_mute(&self) -> bool {
        let _guard = self.transition.lock().await;
        let (muted, deafened) = {
            let mut session = self.session.write();
            session.muted = !session.muted;
            (session.muted, session.deafened)
        };
        self.tracks.apply_voice_gate(muted, deafened);
        self.publish_flags().await;
        self.emit(SessionEvent::MuteChanged(muted));
        muted
    }

    /// Flip the deafen flag. Deafened participants also send no voice.
    pub async fn toggle_deafen(&self) -> bool {
        let _guard = self.transition.lock().await;
        let (muted, deafened) = {
            let mut session = self.session.write();
            session.deafened = !session.deafened;
            (session.muted, session.deafened)
        };
        self.tracks.apply_voice_gate(muted, deafened);
        self.publish_flags().await;
        self.emit(SessionEvent::DeafenChanged(deafened));
        deafened
    }

    /// Applies to the live voice source and to later acquisitions
    pub async fn set_noise_suppression(&self, enabled: bool) {
        let _guard = self.transition.lock().await;
        self.session.write().noise_suppression = enabled;
        if let Some(voice) = self.tracks.get(TrackKind::Voice) {
            voice.set_noise_suppression(enabled);
        }
        debug!(enabled, "Noise suppression changed");
    }

    /// Returns whether the camera is on afterwards
    pub async fn toggle_camera(&self) -> Result<bool> {
        let _guard = self.transition.lock().await;
        let intent = self.require_active()?;

        if self.tracks.is_active(TrackKind::Camera) {
            self.remove_source(TrackKind::Camera, intent, true).await;
            self.publish_flags().await;
            return Ok(false);
        }

        let device = self.session.read().video_device.clone();
        let track = self
            .acquire(TrackKind::Camera, self.devices.acquire_video_input(device.as_deref()))
            .await?;
        self.start_source(track, intent).await?;
        Ok(true)
    }

    /// Returns whether soundpad playback is on afterwards
    pub async fn toggle_soundpad(&self) -> Result<bool> {
        let _guard = self.transition.lock().await;
        let intent = self.require_active()?;

        if self.tracks.is_active(TrackKind::Soundpad) {
            self.remove_source(TrackKind::Soundpad, intent, true).await;
            return Ok(false);
        }

        let track = self
            .acquire(TrackKind::Soundpad, self.devices.create_soundpad_track())
            .await?;
        self.start_source(track, intent).await?;
        Ok(true)
    }

    /// Play `track` on the soundpad slot. A live soundpad source is swapped
    /// in place; otherwise the slot is attached and links renegotiate.
    pub async fn set_soundpad_source(&self, track: LocalTrack) -> Result<()> {
        if track.kind() != TrackKind::Soundpad {
            return Err(Error::InvalidState(format!("{} track on the soundpad slot", track.kind())));
        }
        let _guard = self.transition.lock().await;
        let intent = match self.require_active() {
            Ok(intent) => intent,
            Err(e) => {
                track.stop();
                return Err(e);
            }
        };

        if self.tracks.is_active(TrackKind::Soundpad) {
            self.swap_source(track, intent).await;
            return Ok(());
        }
        self.start_source(track, intent).await
    }

    /// Share the whole screen, or stop sharing. Returns whether a share is
    /// active afterwards.
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        if self.tracks.is_active(TrackKind::Screen) {
            self.stop_screen_share().await?;
            Ok(false)
        } else {
            self.start_screen_share(DisplayCaptureOptions::default()).await?;
            Ok(true)
        }
    }

    /// Start sharing, or switch an active share to a new target without
    /// renegotiating
    pub async fn start_screen_share(&self, options: DisplayCaptureOptions) -> Result<()> {
        let _guard = self.transition.lock().await;
        let intent = self.require_active()?;

        let track = self
            .acquire(TrackKind::Screen, self.devices.acquire_display_capture(&options))
            .await?;
        info!(
            window = options.window.as_ref().map(|w| w.title.as_str()),
            application_audio = options.application_audio.is_some(),
            "Screen share starting"
        );

        if self.tracks.is_active(TrackKind::Screen) {
            if !self.is_current(intent) {
                track.stop();
                return Err(Error::InvalidState("session changed".to_string()));
            }
            self.swap_source(track, intent).await;
            return Ok(());
        }
        self.start_source(track, intent).await
    }

    pub async fn stop_screen_share(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        let intent = self.require_active()?;
        if self.remove_source(TrackKind::Screen, intent, true).await {
            self.publish_flags().await;
        }
        Ok(())
    }

    /// Switch the input device of `kind`. The live source, if any, is swapped
    /// on every link without renegotiation where possible. The choice is kept
    /// for later acquisitions either way.
    pub async fn on_device_changed(&self, kind: DeviceKind, device_id: &str) -> Result<()> {
        let _guard = self.transition.lock().await;

        let track_kind = {
            let mut session = self.session.write();
            match kind {
                DeviceKind::AudioInput => {
                    session.audio_device = Some(device_id.to_string());
                    TrackKind::Voice
                }
                DeviceKind::VideoInput => {
                    session.video_device = Some(device_id.to_string());
                    TrackKind::Camera
                }
                DeviceKind::AudioOutput => {
                    debug!(device_id, "Audio output is chosen by the playback layer");
                    return Ok(());
                }
            }
        };

        let Some(current) = self.tracks.get(track_kind) else {
            return Ok(());
        };
        if current.device_id() == Some(device_id) {
            debug!(device_id, kind = %track_kind, "Device unchanged");
            return Ok(());
        }

        let intent = self.current_intent();
        let track = match track_kind {
            TrackKind::Voice => {
                let noise_suppression = self.session.read().noise_suppression;
                self.acquire(
                    track_kind,
                    self.devices.acquire_audio_input(Some(device_id), noise_suppression),
                )
                .await?
            }
            _ => {
                self.acquire(track_kind, self.devices.acquire_video_input(Some(device_id)))
                    .await?
            }
        };
        if !self.is_current(intent) || self.tracks.get(track_kind).is_none() {
            track.stop();
            return Ok(());
        }

        self.swap_source(track, intent).await;
        if track_kind == TrackKind::Voice {
            let (muted, deafened) = {
                let session = self.session.read();
                (session.muted, session.deafened)
            };
            self.tracks.apply_voice_gate(muted, deafened);
        }
        info!(device_id, kind = %track_kind, "Input device switched");
        Ok(())
    }

    pub async fn list_capture_windows(&self) -> Result<Vec<CaptureWindow>> {
        self.devices.list_capture_windows().await
    }

    pub async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.devices.enumerate_devices().await
    }

    fn require_active(&self) -> Result<u64> {
        if self.session.read().state != SessionState::Active {
            return Err(Error::InvalidState("not in a voice session".to_string()));
        }
        Ok(self.current_intent())
    }

    /// Await an acquisition, reporting failures to the UI
    async fn acquire(
        &self,
        kind: TrackKind,
        acquisition: impl std::future::Future<Output = Result<LocalTrack>>,
    ) -> Result<LocalTrack> {
        match acquisition.await {
            Ok(track) => Ok(track),
            Err(e) => {
                warn!(%kind, error = %e, "Media acquisition failed");
                let e = match e {
                    e @ Error::MediaAcquisition { .. } => e,
                    other => Error::media(kind, MediaErrorReason::Other(other.to_string())),
                };
                self.report_media_error(&e);
                Err(e)
            }
        }
    }

    async fn start_source(&self, track: LocalTrack, intent: u64) -> Result<()> {
        if !self.is_current(intent) {
            track.stop();
            return Err(Error::InvalidState("session changed".to_string()));
        }
        self.add_source(track, intent).await;
        self.publish_flags().await;
        Ok(())
    }

    /// Put a new source on its slot and on every link, renegotiating links
    /// whose slot changed
    async fn add_source(&self, track: LocalTrack, intent: u64) {
        let kind = track.kind();
        if let Some(previous) = self.tracks.set(track.clone()) {
            previous.stop();
        }
        self.watch_track(&track);

        let results = self.tracks.broadcast_attach(kind, &self.links()).await;
        self.renegotiate_changed(results, intent).await;
        self.emit(SessionEvent::LocalTrackChanged { kind, active: true });
    }

    /// Detach and stop the source of `kind`. Returns false if none was active.
    pub(crate) async fn remove_source(&self, kind: TrackKind, intent: u64, renegotiate: bool) -> bool {
        let Some(track) = self.tracks.take(kind) else {
            return false;
        };
        let results = self.tracks.broadcast_detach(kind, &self.links()).await;
        if renegotiate {
            self.renegotiate_changed(results, intent).await;
        }
        track.stop();
        self.emit(SessionEvent::LocalTrackChanged { kind, active: false });
        true
    }

    /// Swap the source of an occupied slot in place. Links that refuse the
    /// replacement fall back to detach, attach and renegotiate.
    async fn swap_source(&self, track: LocalTrack, intent: u64) {
        let kind = track.kind();
        let previous = self.tracks.set(track.clone());
        self.watch_track(&track);

        let results = self.tracks.broadcast_replace(kind, &self.links()).await;
        for (link, result) in results {
            if result.is_ok() || link.is_closed() {
                continue;
            }
            debug!(remote = %link.remote(), %kind, "Falling back to renegotiation");
            let fallback = async {
                link.detach_track(kind).await?;
                link.attach_track(kind, &track).await
            };
            match fallback.await {
                Ok(_) => self.send_offer(&link, intent).await,
                Err(e) => self.fail_link(&link, &e).await,
            }
        }

        if let Some(previous) = previous {
            previous.stop();
        }
        self.emit(SessionEvent::LocalTrackChanged { kind, active: true });
    }

    pub(crate) async fn renegotiate_changed(&self, results: Vec<(Arc<PeerLink>, Result<bool>)>, intent: u64) {
        let mut changed = Vec::new();
        for (link, result) in results {
            match result {
                Ok(true) => changed.push(link),
                Ok(false) => {}
                Err(e) if !link.is_closed() => self.fail_link(&link, &e).await,
                Err(_) => {}
            }
        }
        join_all(changed.iter().map(|link| self.send_offer(link, intent))).await;
    }

    /// Follow a source until it ends; revocations are handled like an
    /// explicit stop
    pub(crate) fn watch_track(&self, track: &LocalTrack) {
        let Some(tasks) = self.session.read().tasks.clone() else {
            return;
        };
        let weak = self.weak_self.clone();
        let track = track.clone();

        tokio::spawn(async move {
            let reason = tokio::select! {
                () = tasks.cancelled() => return,
                reason = track.ended() => reason,
            };
            if reason != TrackEndReason::Revoked {
                return;
            }
            if let Some(this) = weak.upgrade() {
                this.on_track_revoked(track).await;
            }
        });
    }

    async fn on_track_revoked(&self, track: LocalTrack) {
        let _guard = self.transition.lock().await;
        let kind = track.kind();
        if self.tracks.get(kind).as_ref() != Some(&track) {
            return;
        }
        warn!(%kind, track = %track.id(), "Capture revoked");
        self.report_media_error(&Error::media(kind, MediaErrorReason::Revoked));

        // A lost microphone keeps the session; peers hear silence
        if kind == TrackKind::Voice {
            return;
        }
        let intent = self.current_intent();
        self.remove_source(kind, intent, true).await;
        self.publish_flags().await;
    }
}
