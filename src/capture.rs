//! Camera and microphone acquisition.
//!
//! Platform media APIs sit behind [`MediaPlatform`] so the permission and
//! device-label dance can be swapped out in tests. [`CaptureAdapter`] owns at
//! most one live stream at a time and remembers the selected devices through a
//! [`PreferenceStore`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDevice {
    pub device_id: String,
    pub kind: DeviceKind,
    /// Empty until the platform has granted media access once
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoConstraints {
    pub device_id: Option<String>,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub frame_rate: u32,
    pub facing_mode: Option<FacingMode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioConstraints {
    pub device_id: Option<String>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub sample_rate: u32,
    pub channel_count: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaConstraints {
    pub video: VideoConstraints,
    pub audio: AudioConstraints,
}

impl MediaConstraints {
    /// Constraints for a speaking-to-camera recording on the given devices
    pub fn for_devices(video_id: Option<&str>, audio_id: Option<&str>) -> Self {
        Self {
            video: VideoConstraints {
                device_id: video_id.map(str::to_string),
                ideal_width: 1280,
                ideal_height: 720,
                max_width: 1920,
                max_height: 1080,
                frame_rate: 30,
                facing_mode: video_id.is_none().then_some(FacingMode::User),
            },
            audio: AudioConstraints {
                device_id: audio_id.map(str::to_string),
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
                sample_rate: 44_100,
                channel_count: 2,
            },
        }
    }
}

/// A live audio/video stream
pub trait MediaStreamHandle: Send + Sync {
    fn id(&self) -> &str;
    fn video_tracks(&self) -> usize;
    fn audio_tracks(&self) -> usize;
    /// Stop every track and release the devices
    fn stop(&self);
}

/// Capability interface over the platform media APIs
#[async_trait]
pub trait MediaPlatform: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, CaptureError>;
    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Box<dyn MediaStreamHandle>, CaptureError>;
}

/// Remembered camera and microphone selection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePreference {
    pub video_device_id: Option<String>,
    pub audio_device_id: Option<String>,
}

impl DevicePreference {
    /// Drop ids that no longer match an enumerated device
    pub fn revalidate(&self, devices: &[MediaDevice]) -> DevicePreference {
        let known = |id: &Option<String>, kind: DeviceKind| {
            id.as_ref()
                .filter(|id| devices.iter().any(|d| d.kind == kind && &d.device_id == *id))
                .cloned()
        };
        DevicePreference {
            video_device_id: known(&self.video_device_id, DeviceKind::VideoInput),
            audio_device_id: known(&self.audio_device_id, DeviceKind::AudioInput),
        }
    }
}

pub trait PreferenceStore: Send + Sync {
    fn load(&self) -> DevicePreference;
    fn save(&self, preference: &DevicePreference);
}

/// Preference stored as a JSON file, missing or unreadable files load as default
pub struct JsonFilePreferenceStore {
    path: PathBuf,
}

impl JsonFilePreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PreferenceStore for JsonFilePreferenceStore {
    fn load(&self) -> DevicePreference {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(_) => return DevicePreference::default(),
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(
                "Ignoring unreadable device preference '{}': {}",
                self.path.display(),
                e
            );
            DevicePreference::default()
        })
    }

    fn save(&self, preference: &DevicePreference) {
        let result = serde_json::to_string_pretty(preference)
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(&self.path, json).map_err(|e| e.to_string()));
        if let Err(e) = result {
            warn!(
                "Failed to save device preference '{}': {}",
                self.path.display(),
                e
            );
        }
    }
}

#[derive(Default)]
pub struct MemoryPreferenceStore {
    inner: Mutex<DevicePreference>,
}

impl MemoryPreferenceStore {
    pub fn new(preference: DevicePreference) -> Self {
        Self {
            inner: Mutex::new(preference),
        }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn load(&self) -> DevicePreference {
        self.inner
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn save(&self, preference: &DevicePreference) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner = preference.clone();
        }
    }
}

fn fallback_label(device: &MediaDevice) -> String {
    let short_id: String = device.device_id.chars().take(8).collect();
    match device.kind {
        DeviceKind::VideoInput => format!("Camera {}", short_id),
        DeviceKind::AudioInput => format!("Microphone {}", short_id),
    }
}

/// Owner of the single live capture stream
pub struct CaptureAdapter {
    platform: Arc<dyn MediaPlatform>,
    preferences: Box<dyn PreferenceStore>,
    preference: DevicePreference,
    stream: Option<Box<dyn MediaStreamHandle>>,
    devices: Vec<MediaDevice>,
    has_permissions: bool,
    labels_probed: bool,
    last_error: Option<CaptureError>,
}

impl CaptureAdapter {
    pub fn new(platform: Arc<dyn MediaPlatform>, preferences: Box<dyn PreferenceStore>) -> Self {
        let preference = preferences.load();
        Self {
            platform,
            preferences,
            preference,
            stream: None,
            devices: Vec::new(),
            has_permissions: false,
            labels_probed: false,
            last_error: None,
        }
    }

    /// Enumerate inputs, unlocking labels with a throwaway stream the first time
    pub async fn list_devices(&mut self) -> Result<Vec<MediaDevice>, CaptureError> {
        let mut devices = self.platform.enumerate_devices().await?;

        if !self.labels_probed && devices.iter().any(|d| d.label.is_empty()) {
            self.labels_probed = true;
            match self
                .platform
                .get_user_media(&MediaConstraints::for_devices(None, None))
                .await
            {
                Ok(probe) => {
                    probe.stop();
                    devices = self.platform.enumerate_devices().await?;
                }
                Err(e) => warn!("Could not unlock device labels: {}", e),
            }
        }

        for device in devices.iter_mut() {
            if device.label.is_empty() {
                device.label = fallback_label(device);
            }
        }
        self.devices = devices.clone();
        Ok(devices)
    }

    /// Acquire a live stream, releasing any previous one first
    ///
    /// `preferred` replaces the remembered selection; either way the ids are
    /// checked against the current devices and stale ones are cleared.
    pub async fn initialize(
        &mut self,
        preferred: Option<DevicePreference>,
    ) -> Result<(), CaptureError> {
        self.stop();

        let devices = match self.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device enumeration failed: {}", e);
                Vec::new()
            }
        };
        let requested = preferred.unwrap_or_else(|| self.preference.clone());
        let preference = requested.revalidate(&devices);
        if preference != requested {
            debug!("Cleared stale device ids from preference");
        }

        let constraints = MediaConstraints::for_devices(
            preference.video_device_id.as_deref(),
            preference.audio_device_id.as_deref(),
        );
        let result = match self.platform.get_user_media(&constraints).await {
            Ok(stream) if stream.video_tracks() == 0 => {
                stream.stop();
                Err(CaptureError::MissingTrack("video"))
            }
            Ok(stream) if stream.audio_tracks() == 0 => {
                stream.stop();
                Err(CaptureError::MissingTrack("audio"))
            }
            Ok(stream) => Ok(stream),
            Err(e) => Err(e),
        };

        match result {
            Ok(stream) => {
                info!("Capture stream {} started", stream.id());
                self.stream = Some(stream);
                self.has_permissions = true;
                self.last_error = None;
                self.preferences.save(&preference);
                self.preference = preference;
                Ok(())
            }
            Err(e) => {
                warn!("Camera/microphone unavailable: {}", e);
                self.has_permissions = false;
                self.last_error = Some(e.clone());
                self.preference = preference;
                Err(e)
            }
        }
    }

    pub async fn switch_devices(
        &mut self,
        video_device_id: Option<String>,
        audio_device_id: Option<String>,
    ) -> Result<(), CaptureError> {
        self.initialize(Some(DevicePreference {
            video_device_id,
            audio_device_id,
        }))
        .await
    }

    /// Stop the live stream, if any
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!("Stopping capture stream {}", stream.id());
            stream.stop();
        }
    }

    pub fn stream(&self) -> Option<&dyn MediaStreamHandle> {
        self.stream.as_deref()
    }

    pub fn has_permissions(&self) -> bool {
        self.has_permissions
    }

    pub fn preference(&self) -> &DevicePreference {
        &self.preference
    }

    pub fn devices(&self) -> &[MediaDevice] {
        &self.devices
    }

    pub fn last_error(&self) -> Option<&CaptureError> {
        self.last_error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeStream {
        id: String,
        video: usize,
        audio: usize,
        live: Arc<AtomicUsize>,
    }

    impl MediaStreamHandle for FakeStream {
        fn id(&self) -> &str {
            &self.id
        }
        fn video_tracks(&self) -> usize {
            self.video
        }
        fn audio_tracks(&self) -> usize {
            self.audio
        }
        fn stop(&self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct FakePlatform {
        live: Arc<AtomicUsize>,
        opened: AtomicUsize,
        granted: Mutex<bool>,
        deny: bool,
        video_tracks: usize,
        requests: Mutex<Vec<MediaConstraints>>,
    }

    impl FakePlatform {
        fn new() -> Self {
            Self {
                live: Arc::new(AtomicUsize::new(0)),
                opened: AtomicUsize::new(0),
                granted: Mutex::new(false),
                deny: false,
                video_tracks: 1,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MediaPlatform for FakePlatform {
        async fn enumerate_devices(&self) -> Result<Vec<MediaDevice>, CaptureError> {
            let granted = *self.granted.lock().unwrap();
            let label = |l: &str| if granted { l.to_string() } else { String::new() };
            Ok(vec![
                MediaDevice {
                    device_id: "cam-0123456789".to_string(),
                    kind: DeviceKind::VideoInput,
                    label: label("FaceTime HD"),
                },
                MediaDevice {
                    device_id: "mic-abcdefghij".to_string(),
                    kind: DeviceKind::AudioInput,
                    label: label("Built-in Mic"),
                },
            ])
        }

        async fn get_user_media(
            &self,
            constraints: &MediaConstraints,
        ) -> Result<Box<dyn MediaStreamHandle>, CaptureError> {
            self.requests.lock().unwrap().push(constraints.clone());
            if self.deny {
                return Err(CaptureError::PermissionDenied);
            }
            *self.granted.lock().unwrap() = true;
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            self.live.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeStream {
                id: format!("stream-{}", n),
                video: self.video_tracks,
                audio: 1,
                live: self.live.clone(),
            }))
        }
    }

    fn adapter(platform: Arc<FakePlatform>, preference: DevicePreference) -> CaptureAdapter {
        CaptureAdapter::new(platform, Box::new(MemoryPreferenceStore::new(preference)))
    }

    #[tokio::test]
    async fn label_probe_stream_is_released() {
        let platform = Arc::new(FakePlatform::new());
        let mut capture = adapter(platform.clone(), DevicePreference::default());
        let devices = capture.list_devices().await.unwrap();
        assert_eq!(devices[0].label, "FaceTime HD");
        assert_eq!(platform.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn switching_devices_never_leaves_two_live_streams() {
        let platform = Arc::new(FakePlatform::new());
        let mut capture = adapter(platform.clone(), DevicePreference::default());
        capture.initialize(None).await.unwrap();
        assert_eq!(platform.live.load(Ordering::SeqCst), 1);
        capture
            .switch_devices(Some("cam-0123456789".to_string()), None)
            .await
            .unwrap();
        assert_eq!(platform.live.load(Ordering::SeqCst), 1);
        assert_eq!(
            capture.preference().video_device_id.as_deref(),
            Some("cam-0123456789")
        );
        capture.stop();
        assert_eq!(platform.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stale_preference_is_cleared() {
        let platform = Arc::new(FakePlatform::new());
        let mut capture = adapter(
            platform.clone(),
            DevicePreference {
                video_device_id: Some("unplugged-camera".to_string()),
                audio_device_id: Some("mic-abcdefghij".to_string()),
            },
        );
        capture.initialize(None).await.unwrap();
        assert_eq!(capture.preference().video_device_id, None);
        assert_eq!(
            capture.preference().audio_device_id.as_deref(),
            Some("mic-abcdefghij")
        );
        let last = platform.requests.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.video.facing_mode, Some(FacingMode::User));
    }

    #[tokio::test]
    async fn denied_access_leaves_no_stream() {
        let mut platform = FakePlatform::new();
        platform.deny = true;
        let platform = Arc::new(platform);
        let mut capture = adapter(platform.clone(), DevicePreference::default());
        let err = capture.initialize(None).await.unwrap_err();
        assert_eq!(err, CaptureError::PermissionDenied);
        assert!(!capture.has_permissions());
        assert!(capture.stream().is_none());
        let devices = capture.devices();
        assert_eq!(devices[0].label, "Camera cam-0123");
        assert_eq!(devices[1].label, "Microphone mic-abcd");
    }

    #[tokio::test]
    async fn stream_without_video_is_stopped() {
        let mut platform = FakePlatform::new();
        platform.video_tracks = 0;
        let platform = Arc::new(platform);
        let mut capture = adapter(platform.clone(), DevicePreference::default());
        let err = capture.initialize(None).await.unwrap_err();
        assert_eq!(err, CaptureError::MissingTrack("video"));
        assert!(!capture.has_permissions());
        assert_eq!(platform.live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn constraints_prefer_user_camera_only_without_id() {
        let c = MediaConstraints::for_devices(Some("cam"), Some("mic"));
        assert_eq!(c.video.facing_mode, None);
        assert_eq!((c.video.ideal_width, c.video.ideal_height), (1280, 720));
        assert_eq!(c.audio.sample_rate, 44_100);
        assert!(c.audio.echo_cancellation && c.audio.noise_suppression);
    }

    #[test]
    fn json_preference_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        let preference = DevicePreference {
            video_device_id: Some("cam".to_string()),
            audio_device_id: None,
        };
        JsonFilePreferenceStore::new(&path).save(&preference);
        assert_eq!(JsonFilePreferenceStore::new(&path).load(), preference);

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(
            JsonFilePreferenceStore::new(&path).load(),
            DevicePreference::default()
        );
    }
}
