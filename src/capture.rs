use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Exclusive token for an open native capture resource. Giving it back to the
/// backend is the only way to release it, so it cannot be released twice.
#[derive(Debug, PartialEq, Eq)]
pub struct CaptureHandle {
    id: u64,
    location: PathBuf,
}

impl CaptureHandle {
    pub fn new(id: u64, location: PathBuf) -> Self {
        Self { id, location }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn location(&self) -> &Path {
        &self.location
    }
}

/// Durable result of a finished recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedAudio {
    pub location: PathBuf,
    pub mime: String,
    pub data: Vec<u8>,
}

impl CapturedAudio {
    pub fn filename(&self) -> String {
        self.location
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| "recording.m4a".into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("microphone permission was not granted")]
    PermissionDenied,
    #[error("no recording is in progress")]
    NoActiveCapture,
    #[error("cannot apply {event} while {state}")]
    InvalidTransition {
        state: CaptureState,
        event: &'static str,
    },
    #[error("capture device error: {0}")]
    Device(String),
    #[error("captured audio could not be stored: {0}")]
    Storage(String),
}

/// Native recorder seam. `finish` and `discard` consume the handle and must release it.
pub trait CaptureBackend {
    fn permission_granted(&mut self) -> bool;
    fn open(&mut self) -> Result<CaptureHandle, CaptureError>;
    fn finish(&mut self, handle: CaptureHandle) -> Result<CapturedAudio, CaptureError>;
    fn discard(&mut self, handle: CaptureHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Recording,
    Stopping,
    Transcribing,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureState::Idle => write!(f, "idle"),
            CaptureState::Recording => write!(f, "recording"),
            CaptureState::Stopping => write!(f, "stopping"),
            CaptureState::Transcribing => write!(f, "transcribing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Start,
    Stop,
    Transcribed(String),
    TranscriptionFailed(String),
    Discard,
}

impl CaptureEvent {
    fn label(&self) -> &'static str {
        match self {
            CaptureEvent::Start => "start",
            CaptureEvent::Stop => "stop",
            CaptureEvent::Transcribed(_) => "transcribed",
            CaptureEvent::TranscriptionFailed(_) => "transcription-failed",
            CaptureEvent::Discard => "discard",
        }
    }
}

enum Stage {
    Idle,
    Recording(CaptureHandle),
    Stopping,
    Transcribing(CapturedAudio),
}

impl Stage {
    fn state(&self) -> CaptureState {
        match self {
            Stage::Idle => CaptureState::Idle,
            Stage::Recording(_) => CaptureState::Recording,
            Stage::Stopping => CaptureState::Stopping,
            Stage::Transcribing(_) => CaptureState::Transcribing,
        }
    }
}

/// Lifecycle of one capture session at a time. All state changes go through `transition`.
pub struct CaptureMachine {
    backend: Box<dyn CaptureBackend>,
    stage: Stage,
    fallback_transcript: String,
    result_transcript: Option<String>,
}

impl CaptureMachine {
    pub fn new(backend: Box<dyn CaptureBackend>, fallback_transcript: impl Into<String>) -> Self {
        Self {
            backend,
            stage: Stage::Idle,
            fallback_transcript: fallback_transcript.into(),
            result_transcript: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.stage.state()
    }

    pub fn result_transcript(&self) -> Option<&str> {
        self.result_transcript.as_deref()
    }

    /// Audio waiting for transcription, if any.
    pub fn captured(&self) -> Option<&CapturedAudio> {
        match &self.stage {
            Stage::Transcribing(audio) => Some(audio),
            _ => None,
        }
    }

    /// Begin recording, tearing down any recording already in progress.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        self.transition(CaptureEvent::Start)
    }

    /// Stop recording and keep the audio for transcription.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        self.transition(CaptureEvent::Stop)
    }

    /// Abandon the session from any state.
    pub fn discard(&mut self) {
        if let Err(err) = self.transition(CaptureEvent::Discard) {
            warn!(error = %err, "discard failed");
        }
    }

    /// Finish the transcribing stage; failures resolve to the fallback transcript.
    pub fn complete<E: fmt::Display>(&mut self, outcome: Result<String, E>) -> String {
        let event = match outcome {
            Ok(text) => CaptureEvent::Transcribed(text),
            Err(err) => CaptureEvent::TranscriptionFailed(err.to_string()),
        };
        match self.transition(event) {
            Ok(()) => self
                .result_transcript
                .clone()
                .unwrap_or_else(|| self.fallback_transcript.clone()),
            Err(err) => {
                warn!(error = %err, "transcription result arrived outside a session");
                self.fallback_transcript.clone()
            }
        }
    }

    /// Every exit from a stage that holds the handle gives it back to the backend
    /// before the next stage is entered.
    pub fn transition(&mut self, event: CaptureEvent) -> Result<(), CaptureError> {
        let previous = std::mem::replace(&mut self.stage, Stage::Idle);
        let from = previous.state();
        let label = event.label();
        let result = match (previous, event) {
            (Stage::Idle | Stage::Stopping, CaptureEvent::Start) => self.enter_recording(),
            (Stage::Recording(handle), CaptureEvent::Start) => {
                debug!(handle = handle.id(), "tearing down active capture before restart");
                self.backend.discard(handle);
                self.enter_recording()
            }
            (Stage::Transcribing(_), CaptureEvent::Start) => self.enter_recording(),
            (Stage::Recording(handle), CaptureEvent::Stop) => {
                self.stage = Stage::Stopping;
                match self.backend.finish(handle) {
                    Ok(audio) => {
                        info!(location = %audio.location.display(), bytes = audio.data.len(), "capture stopped");
                        self.stage = Stage::Transcribing(audio);
                        Ok(())
                    }
                    Err(err) => {
                        self.stage = Stage::Idle;
                        Err(err)
                    }
                }
            }
            (Stage::Recording(handle), CaptureEvent::Discard) => {
                self.backend.discard(handle);
                Ok(())
            }
            (Stage::Transcribing(_), CaptureEvent::Transcribed(text)) => {
                self.result_transcript = Some(text);
                Ok(())
            }
            (Stage::Transcribing(_), CaptureEvent::TranscriptionFailed(reason)) => {
                warn!(reason = %reason, "transcription failed; using fallback transcript");
                self.result_transcript = Some(self.fallback_transcript.clone());
                Ok(())
            }
            (Stage::Idle | Stage::Stopping | Stage::Transcribing(_), CaptureEvent::Discard) => {
                Ok(())
            }
            (stage @ (Stage::Idle | Stage::Stopping | Stage::Transcribing(_)), CaptureEvent::Stop) => {
                self.stage = stage;
                Err(CaptureError::NoActiveCapture)
            }
            (
                stage @ (Stage::Idle | Stage::Stopping | Stage::Recording(_)),
                CaptureEvent::Transcribed(_) | CaptureEvent::TranscriptionFailed(_),
            ) => {
                self.stage = stage;
                Err(CaptureError::InvalidTransition { state: from, event: label })
            }
        };
        debug!(from = %from, to = %self.state(), event = label, "capture transition");
        result
    }

    fn enter_recording(&mut self) -> Result<(), CaptureError> {
        if !self.backend.permission_granted() {
            return Err(CaptureError::PermissionDenied);
        }
        let handle = self.backend.open()?;
        self.result_transcript = None;
        self.stage = Stage::Recording(handle);
        Ok(())
    }
}

impl Drop for CaptureMachine {
    fn drop(&mut self) {
        if let Stage::Recording(handle) = std::mem::replace(&mut self.stage, Stage::Idle) {
            self.backend.discard(handle);
        }
    }
}

impl fmt::Debug for CaptureMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureMachine")
            .field("state", &self.state())
            .field("result_transcript", &self.result_transcript)
            .finish()
    }
}

/// Backend that "records" a pre-recorded audio file.
#[derive(Debug)]
pub struct FileCapture {
    source: PathBuf,
    next_id: u64,
    open_handles: usize,
}

impl FileCapture {
    pub fn new(source: PathBuf) -> Self {
        Self {
            source,
            next_id: 1,
            open_handles: 0,
        }
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles
    }

    fn release(&mut self, handle: CaptureHandle) {
        self.open_handles = self.open_handles.saturating_sub(1);
        debug!(handle = handle.id(), "released capture handle");
    }
}

impl CaptureBackend for FileCapture {
    fn permission_granted(&mut self) -> bool {
        true
    }

    fn open(&mut self) -> Result<CaptureHandle, CaptureError> {
        let metadata = fs::metadata(&self.source).map_err(|err| {
            CaptureError::Device(format!("{}: {err}", self.source.display()))
        })?;
        if !metadata.is_file() {
            return Err(CaptureError::Device(format!(
                "{} is not a file",
                self.source.display()
            )));
        }
        let handle = CaptureHandle::new(self.next_id, self.source.clone());
        self.next_id += 1;
        self.open_handles += 1;
        Ok(handle)
    }

    fn finish(&mut self, handle: CaptureHandle) -> Result<CapturedAudio, CaptureError> {
        let location = handle.location().to_path_buf();
        self.release(handle);
        let data = fs::read(&location)
            .map_err(|err| CaptureError::Storage(format!("{}: {err}", location.display())))?;
        if data.is_empty() {
            return Err(CaptureError::Storage(format!(
                "{} is empty",
                location.display()
            )));
        }
        let mime = detect_audio_mime(&data, &location);
        Ok(CapturedAudio {
            location,
            mime,
            data,
        })
    }

    fn discard(&mut self, handle: CaptureHandle) {
        self.release(handle);
    }
}

fn detect_audio_mime(data: &[u8], location: &Path) -> String {
    if let Some(kind) = infer::get(data) {
        if kind.mime_type().starts_with("audio/") {
            return kind.mime_type().to_string();
        }
    }
    let extension = location
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("wav") => "audio/wav".into(),
        Some("mp3") => "audio/mpeg".into(),
        Some("ogg") => "audio/ogg".into(),
        Some("webm") => "audio/webm".into(),
        _ => "audio/m4a".into(),
    }
}
