use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::MediaDevices;
use crate::error::{Error, MediaErrorReason, Result};
use crate::models::{
    CaptureWindow, DeviceInfo, DeviceKind, DisplayCaptureOptions, LoopbackAudio, TrackId, TrackKind,
};

/// How a local track ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEndReason {
    /// Stopped by us
    Stopped,
    /// Ended out of band (OS revoked the capture, device unplugged)
    Revoked,
}

/// Handle to a live local capture source.
///
/// Clones share the same source. `enabled` gates whether media flows without
/// touching negotiation; ending is one-way.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

struct LocalTrackInner {
    id: TrackId,
    kind: TrackKind,
    device_id: Option<String>,
    label: String,
    loopback: Option<LoopbackAudio>,
    enabled: AtomicBool,
    noise_suppression: AtomicBool,
    ended: CancellationToken,
    end_reason: Mutex<Option<TrackEndReason>>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, device_id: Option<String>, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(LocalTrackInner {
                id: TrackId::new(),
                kind,
                device_id,
                label: label.into(),
                loopback: None,
                enabled: AtomicBool::new(true),
                noise_suppression: AtomicBool::new(false),
                ended: CancellationToken::new(),
                end_reason: Mutex::new(None),
            }),
        }
    }

    /// Screen capture carrying application audio
    pub fn with_loopback(label: impl Into<String>, loopback: Option<LoopbackAudio>) -> Self {
        Self {
            inner: Arc::new(LocalTrackInner {
                id: TrackId::new(),
                kind: TrackKind::Screen,
                device_id: None,
                label: label.into(),
                loopback,
                enabled: AtomicBool::new(true),
                noise_suppression: AtomicBool::new(false),
                ended: CancellationToken::new(),
                end_reason: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &TrackId {
        &self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    #[must_use]
    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[must_use]
    pub fn loopback(&self) -> Option<LoopbackAudio> {
        self.inner.loopback
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn noise_suppression(&self) -> bool {
        self.inner.noise_suppression.load(Ordering::Acquire)
    }

    /// Toggle the processing stage in front of the encoder; the outbound
    /// track stays the same
    pub fn set_noise_suppression(&self, on: bool) {
        self.inner.noise_suppression.store(on, Ordering::Release);
    }

    /// Release the capture source. Idempotent.
    pub fn stop(&self) {
        self.end(TrackEndReason::Stopped);
    }

    /// Simulate the platform ending the capture behind our back
    pub fn revoke(&self) {
        self.end(TrackEndReason::Revoked);
    }

    fn end(&self, reason: TrackEndReason) {
        {
            let mut end_reason = self.inner.end_reason.lock();
            if end_reason.is_some() {
                return;
            }
            *end_reason = Some(reason);
        }
        self.inner.enabled.store(false, Ordering::Release);
        self.inner.ended.cancel();
        debug!(track_id = %self.inner.id, kind = %self.inner.kind, ?reason, "Local track ended");
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.inner.ended.is_cancelled()
    }

    #[must_use]
    pub fn end_reason(&self) -> Option<TrackEndReason> {
        *self.inner.end_reason.lock()
    }

    /// Resolves once the track has ended
    pub async fn ended(&self) -> TrackEndReason {
        self.inner.ended.cancelled().await;
        self.end_reason().unwrap_or(TrackEndReason::Stopped)
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for LocalTrack {}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("device_id", &self.inner.device_id)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// In-process `MediaDevices` for tests and the demo.
///
/// Input devices are exclusive: acquiring a device that still backs a live
/// track fails with `DeviceBusy`, the way a real capture stack would.
pub struct SyntheticDevices {
    devices: RwLock<Vec<DeviceInfo>>,
    windows: RwLock<Vec<CaptureWindow>>,
    failures: Mutex<HashMap<TrackKind, MediaErrorReason>>,
    acquisitions: Mutex<HashMap<TrackKind, usize>>,
    issued: Mutex<Vec<LocalTrack>>,
    last_display_options: Mutex<Option<DisplayCaptureOptions>>,
}

impl SyntheticDevices {
    /// One default microphone, one default camera and one speaker
    #[must_use]
    pub fn new() -> Self {
        Self::with_devices(vec![
            DeviceInfo::new("mic-default", DeviceKind::AudioInput, "Built-in Microphone").as_default(),
            DeviceInfo::new("cam-default", DeviceKind::VideoInput, "Built-in Camera").as_default(),
            DeviceInfo::new("speaker-default", DeviceKind::AudioOutput, "Speakers").as_default(),
        ])
    }

    #[must_use]
    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices: RwLock::new(devices),
            windows: RwLock::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            acquisitions: Mutex::new(HashMap::new()),
            issued: Mutex::new(Vec::new()),
            last_display_options: Mutex::new(None),
        }
    }

    pub fn add_device(&self, device: DeviceInfo) {
        self.devices.write().push(device);
    }

    /// Load windows from process-enumerator output (`pid;handle;title`)
    pub fn set_capture_windows(&self, enumerator_output: &str) {
        *self.windows.write() = CaptureWindow::parse_list(enumerator_output);
    }

    /// Make every acquisition of `kind` fail until cleared
    pub fn fail(&self, kind: TrackKind, reason: MediaErrorReason) {
        self.failures.lock().insert(kind, reason);
    }

    pub fn clear_failure(&self, kind: TrackKind) {
        self.failures.lock().remove(&kind);
    }

    /// Successful acquisitions of `kind` so far
    #[must_use]
    pub fn acquisitions(&self, kind: TrackKind) -> usize {
        self.acquisitions.lock().get(&kind).copied().unwrap_or(0)
    }

    /// Issued tracks of `kind` that have not ended
    #[must_use]
    pub fn live_tracks(&self, kind: TrackKind) -> Vec<LocalTrack> {
        self.issued
            .lock()
            .iter()
            .filter(|t| t.kind() == kind && !t.is_ended())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn last_display_options(&self) -> Option<DisplayCaptureOptions> {
        self.last_display_options.lock().clone()
    }

    fn check_failure(&self, kind: TrackKind) -> Result<()> {
        match self.failures.lock().get(&kind) {
            Some(reason) => Err(Error::media(kind, reason.clone())),
            None => Ok(()),
        }
    }

    fn resolve_device(&self, kind: TrackKind, device_kind: DeviceKind, device_id: Option<&str>) -> Result<DeviceInfo> {
        let devices = self.devices.read();
        let found = match device_id {
            Some(id) => devices.iter().find(|d| d.kind == device_kind && d.device_id == id),
            None => devices
                .iter()
                .find(|d| d.kind == device_kind && d.is_default)
                .or_else(|| devices.iter().find(|d| d.kind == device_kind)),
        };
        found
            .cloned()
            .ok_or_else(|| Error::media(kind, MediaErrorReason::DeviceNotFound))
    }

    fn issue(&self, track: LocalTrack) -> Result<LocalTrack> {
        let mut issued = self.issued.lock();
        issued.retain(|t| !t.is_ended());
        if let Some(device_id) = track.device_id() {
            if issued.iter().any(|t| t.device_id() == Some(device_id)) {
                return Err(Error::media(track.kind(), MediaErrorReason::DeviceBusy));
            }
        }
        issued.push(track.clone());
        *self.acquisitions.lock().entry(track.kind()).or_insert(0) += 1;
        info!(track_id = %track.id(), kind = %track.kind(), label = track.label(), "Capture source acquired");
        Ok(track)
    }
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire_audio_input(&self, device_id: Option<&str>, noise_suppression: bool) -> Result<LocalTrack> {
        self.check_failure(TrackKind::Voice)?;
        let device = self.resolve_device(TrackKind::Voice, DeviceKind::AudioInput, device_id)?;
        let track = LocalTrack::new(TrackKind::Voice, Some(device.device_id), device.label);
        track.set_noise_suppression(noise_suppression);
        self.issue(track)
    }

    async fn acquire_video_input(&self, device_id: Option<&str>) -> Result<LocalTrack> {
        self.check_failure(TrackKind::Camera)?;
        let device = self.resolve_device(TrackKind::Camera, DeviceKind::VideoInput, device_id)?;
        self.issue(LocalTrack::new(TrackKind::Camera, Some(device.device_id), device.label))
    }

    async fn acquire_display_capture(&self, options: &DisplayCaptureOptions) -> Result<LocalTrack> {
        self.check_failure(TrackKind::Screen)?;
        let label = match &options.window {
            Some(window) => {
                let known = self
                    .windows
                    .read()
                    .iter()
                    .any(|w| w.window_handle == window.window_handle);
                if !known {
                    return Err(Error::media(TrackKind::Screen, MediaErrorReason::DeviceNotFound));
                }
                window.title.clone()
            }
            None => "Entire screen".to_string(),
        };
        *self.last_display_options.lock() = Some(options.clone());
        self.issue(LocalTrack::with_loopback(label, options.application_audio))
    }

    async fn create_soundpad_track(&self) -> Result<LocalTrack> {
        self.check_failure(TrackKind::Soundpad)?;
        self.issue(LocalTrack::new(TrackKind::Soundpad, None, "Soundpad"))
    }

    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.devices.read().clone())
    }

    async fn list_capture_windows(&self) -> Result<Vec<CaptureWindow>> {
        Ok(self.windows.read().clone())
    }
}
