use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical media source of a participant. Each kind maps to its own outbound
/// slot on every peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone
    Voice,
    /// Auxiliary local playback mixed into its own audio track
    Soundpad,
    /// Screen or window capture
    Screen,
    /// Camera
    Camera,
}

impl TrackKind {
    /// Fixed order in which active tracks are attached to a new link
    pub const ATTACH_ORDER: [Self; 4] = [Self::Voice, Self::Soundpad, Self::Screen, Self::Camera];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Voice => "voice",
            Self::Soundpad => "soundpad",
            Self::Screen => "screen",
            Self::Camera => "camera",
        }
    }

    /// Slot index on a peer link
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Voice => 0,
            Self::Soundpad => 1,
            Self::Screen => 2,
            Self::Camera => 3,
        }
    }

    #[must_use]
    pub const fn media_kind(&self) -> MediaKind {
        match self {
            Self::Voice | Self::Soundpad => MediaKind::Audio,
            Self::Screen | Self::Camera => MediaKind::Video,
        }
    }

    /// Kinds whose capture device can be swapped in place
    #[must_use]
    pub const fn has_device(&self) -> bool {
        matches!(self, Self::Voice | Self::Camera)
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "voice" => Ok(Self::Voice),
            "soundpad" => Ok(Self::Soundpad),
            "screen" => Ok(Self::Screen),
            "camera" => Ok(Self::Camera),
            _ => Err(format!("Unknown track kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    AudioOutput,
}

/// An entry of the local device enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub label: String,
    #[serde(default)]
    pub is_default: bool,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, kind: DeviceKind, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            label: label.into(),
            is_default: false,
        }
    }

    #[must_use]
    pub const fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// A top-level window that can be targeted by screen capture.
///
/// The platform process enumerator reports one window per line as
/// `pid;handle;title`. Titles may themselves contain `;`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureWindow {
    pub process_id: u32,
    pub window_handle: u64,
    pub title: String,
}

impl CaptureWindow {
    /// Parse a single `pid;handle;title` line. Lines without a title are
    /// rejected, matching the enumerator which skips untitled windows.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(3, ';');
        let process_id = parts.next()?.trim().parse().ok()?;
        let window_handle = parts.next()?.trim().parse().ok()?;
        let title = parts.next()?;
        if title.trim().is_empty() || process_id == 0 {
            return None;
        }
        Some(Self {
            process_id,
            window_handle,
            title: title.to_string(),
        })
    }

    /// Parse the full enumerator output, dropping malformed lines
    #[must_use]
    pub fn parse_list(output: &str) -> Vec<Self> {
        output.lines().filter_map(Self::parse_line).collect()
    }
}

/// Whether application loopback captures only the target process tree or
/// everything except it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopbackMode {
    #[default]
    Include,
    Exclude,
}

impl FromStr for LoopbackMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "include" => Ok(Self::Include),
            "exclude" => Ok(Self::Exclude),
            _ => Err(format!("Unknown loopback mode: {s}")),
        }
    }
}

/// Per-process audio captured alongside a screen share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackAudio {
    pub process_id: u32,
    #[serde(default)]
    pub mode: LoopbackMode,
}

/// What a screen share captures
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayCaptureOptions {
    /// Specific window; `None` lets the platform picker decide
    pub window: Option<CaptureWindow>,
    /// Application audio to mix into the share
    pub application_audio: Option<LoopbackAudio>,
}

impl DisplayCaptureOptions {
    /// Share a window together with the audio of the process owning it
    #[must_use]
    pub fn window_with_audio(window: CaptureWindow) -> Self {
        let application_audio = Some(LoopbackAudio {
            process_id: window.process_id,
            mode: LoopbackMode::Include,
        });
        Self {
            window: Some(window),
            application_audio,
        }
    }
}
