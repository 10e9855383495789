pub mod capture;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod journal;
pub mod resolver;
pub mod services;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod testing;

use std::path::PathBuf;

use anyhow::Result;
use serde_json::Value;
use tracing::{info, warn};

use crate::capture::{CaptureBackend, CaptureError, CaptureMachine, CaptureState};
use crate::config::{ClientSettings, Platform, default_config_path};
use crate::conversation::{ConversationState, ConversationTurn};
use crate::dispatch::{CandidateMetricsEntry, DispatchReport, Dispatcher};
use crate::error::{DispatchError, TransportError};
use crate::http::{BackendHttp, BlockingBackendHttp};
use crate::journal::{DispatchJournal, JournalEntry};
use crate::resolver::{Discovery, EndpointCandidate};
use crate::services::{
    ChatPrompt, ChatReply, ConnectionReport, SpeechOutcome, SpeechReply, Transcript,
};
use crate::transport::{Encoding, LogicalRequest, MediaAttachment, TransportResponse};

/// Single client context: owns the sticky candidate, the conversation and the capture session.
pub struct AssistantClient<H: BackendHttp> {
    settings: ClientSettings,
    http: H,
    dispatcher: Dispatcher,
    conversation: ConversationState,
    capture: Option<CaptureMachine>,
    journal: Option<DispatchJournal>,
}

impl AssistantClient<BlockingBackendHttp> {
    /// Load configuration from the default path (or an override) and build a networked client.
    pub fn bootstrap(config_path_override: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path_override {
            Some(path) => path,
            None => default_config_path()?,
        };
        let settings = ClientSettings::load_or_default(&config_path)?;
        Self::connect(settings)
    }

    /// Build a networked client from already-loaded settings.
    pub fn connect(settings: ClientSettings) -> Result<Self> {
        let http = BlockingBackendHttp::new(&settings.transport)?;
        Self::new(settings, http)
    }
}

impl<H: BackendHttp> AssistantClient<H> {
    pub fn new(settings: ClientSettings, http: H) -> Result<Self> {
        for issue in settings.validate() {
            warn!(issue = %issue, "configuration issue");
        }
        let journal = if settings.journal.enabled {
            Some(DispatchJournal::new(settings.resolve_journal_path()?))
        } else {
            None
        };
        Ok(Self {
            dispatcher: Dispatcher::from_settings(&settings),
            conversation: ConversationState::new(settings.conversation.max_turns),
            capture: None,
            journal,
            settings,
            http,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn http(&self) -> &H {
        &self.http
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    pub fn platform(&self) -> Platform {
        self.dispatcher.platform()
    }

    /// Send a chat prompt with the recent context window attached.
    pub fn chat(
        &mut self,
        prompt: &str,
        image: Option<MediaAttachment>,
        advice_type: Option<&str>,
    ) -> Result<ChatExchange, DispatchError> {
        let history = self
            .conversation
            .history_json(self.settings.conversation.context_turns);
        let advice_type = advice_type
            .unwrap_or(&self.settings.conversation.default_advice_type)
            .to_string();
        let request = ChatPrompt::new(prompt, advice_type)
            .with_history(history)
            .with_image(image)
            .to_request();
        self.conversation.append(ConversationTurn::user(prompt));

        let (outcome, report) = self.send_with_report(&request);
        let response = outcome?;
        let reply: ChatReply = response
            .json()
            .map_err(|err| unusable_reply(&report, err))?;
        self.conversation
            .append(ConversationTurn::assistant(reply.response.clone()));
        self.conversation
            .set_conversation_id(reply.conversation_id.clone());
        Ok(ChatExchange {
            reply,
            candidate: response.candidate,
            encoding: response.encoding,
        })
    }

    /// Request synthesized speech. Failures degrade to `SpeechOutcome::NoAudio`.
    pub fn speak(&mut self, text: &str) -> SpeechOutcome {
        let request = services::speech_request(text);
        match self.send(&request) {
            Ok(response) => match response.json::<SpeechReply>() {
                Ok(reply) => reply.into_outcome(&response.candidate),
                Err(err) => {
                    warn!(error = %err, "speech reply unreadable");
                    SpeechOutcome::NoAudio {
                        reason: "speech reply could not be read".into(),
                    }
                }
            },
            Err(err) => SpeechOutcome::NoAudio {
                reason: err.user_message().to_string(),
            },
        }
    }

    /// Call the test-connection endpoint and report where (or whether) the backend answered.
    pub fn test_connection(&mut self) -> ConnectionReport {
        let request = services::test_connection_request();
        match self.send(&request) {
            Ok(response) => ConnectionReport {
                reachable: true,
                url: Some(response.candidate.to_string()),
                detail: response.json::<Value>().ok(),
                error: None,
            },
            Err(err) => ConnectionReport {
                reachable: false,
                url: None,
                detail: None,
                error: Some(err.user_message().to_string()),
            },
        }
    }

    /// Probe the current ordering until one candidate answers.
    pub fn discover(&self) -> Discovery {
        self.dispatcher.resolver().discover(
            &self.http,
            self.dispatcher.platform(),
            self.dispatcher.last_known_good(),
        )
    }

    /// Install the recorder used for voice input, tearing down any session in progress.
    pub fn attach_capture(&mut self, backend: Box<dyn CaptureBackend>) {
        self.capture = Some(CaptureMachine::new(
            backend,
            self.settings.capture.fallback_transcript.clone(),
        ));
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture
            .as_ref()
            .map(CaptureMachine::state)
            .unwrap_or(CaptureState::Idle)
    }

    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        match self.capture.as_mut() {
            Some(machine) => machine.start(),
            None => Err(CaptureError::Device("no capture backend attached".into())),
        }
    }

    pub fn discard_capture(&mut self) {
        if let Some(machine) = self.capture.as_mut() {
            machine.discard();
        }
    }

    /// Stop recording and transcribe. Always yields text: the fallback transcript on any failure.
    pub fn stop_and_transcribe(&mut self) -> String {
        let fallback = self.settings.capture.fallback_transcript.clone();
        let request = {
            let Some(machine) = self.capture.as_mut() else {
                warn!("no capture session to stop");
                return fallback;
            };
            if let Err(err) = machine.stop() {
                warn!(error = %err, "capture stop failed");
                return fallback;
            }
            machine
                .captured()
                .map(|audio| services::transcription_request(audio, &self.settings.capture.audio_source))
        };

        let outcome = match request {
            Some(request) => self.transcribe(&request),
            None => Err("no captured audio".to_string()),
        };
        match self.capture.as_mut() {
            Some(machine) => machine.complete(outcome),
            None => fallback,
        }
    }

    fn transcribe(&mut self, request: &LogicalRequest) -> Result<String, String> {
        let response = self.send(request).map_err(|err| err.to_string())?;
        let transcript: Transcript = response.json().map_err(|err| err.to_string())?;
        if let Some(confidence) = transcript.confidence {
            info!(confidence, language = ?transcript.language, "transcription received");
        }
        transcript
            .into_text()
            .ok_or_else(|| "transcription was empty".to_string())
    }

    /// Forget the conversation and abandon any capture in progress.
    pub fn new_session(&mut self) {
        self.conversation.clear();
        self.discard_capture();
        info!("started a fresh session");
    }

    pub fn recent_dispatches(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let journal = match &self.journal {
            Some(journal) => journal.clone(),
            None => DispatchJournal::new(self.settings.resolve_journal_path()?),
        };
        journal.read_recent(limit)
    }

    /// Snapshot of discovery and pipeline state without touching the network.
    pub fn diagnostics(&self) -> Result<DiagnosticsReport> {
        Ok(DiagnosticsReport {
            platform: self.dispatcher.platform(),
            candidate_order: self.dispatcher.candidate_order(),
            sticky: self.dispatcher.last_known_good().cloned(),
            metrics: self.dispatcher.candidate_metrics(),
            issues: self.settings.validate(),
            conversation_turns: self.conversation.len(),
            conversation_id: self.conversation.conversation_id().map(str::to_string),
            capture: self.capture_state(),
            journal: self
                .journal
                .as_ref()
                .map(|journal| journal.log_path().to_path_buf()),
            trace: telemetry::trace_report(&self.settings.telemetry)?,
        })
    }

    fn send(&mut self, request: &LogicalRequest) -> Result<TransportResponse, DispatchError> {
        self.send_with_report(request).0
    }

    fn send_with_report(
        &mut self,
        request: &LogicalRequest,
    ) -> (Result<TransportResponse, DispatchError>, DispatchReport) {
        let (outcome, report) = self.dispatcher.dispatch_with_report(&self.http, request);
        if let Some(journal) = &self.journal {
            let entry = JournalEntry::from_dispatch(&report, &outcome);
            if let Err(err) = journal.append(&entry) {
                warn!(error = %err, "failed to append dispatch journal");
            }
        }
        (outcome, report)
    }
}

fn unusable_reply(report: &DispatchReport, error: TransportError) -> DispatchError {
    warn!(error = %error, "backend reply unreadable");
    DispatchError::AggregatedFailure {
        attempted: report.candidates_tried(),
        last: Some(error),
    }
}

/// A successful chat round trip.
#[derive(Debug, Clone)]
pub struct ChatExchange {
    pub reply: ChatReply,
    pub candidate: EndpointCandidate,
    pub encoding: Encoding,
}

#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub platform: Platform,
    pub candidate_order: Vec<EndpointCandidate>,
    pub sticky: Option<EndpointCandidate>,
    pub metrics: Vec<CandidateMetricsEntry>,
    pub issues: Vec<String>,
    pub conversation_turns: usize,
    pub conversation_id: Option<String>,
    pub capture: CaptureState,
    pub journal: Option<PathBuf>,
    pub trace: telemetry::TraceReport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FileCapture;
    use crate::config::PlatformRoute;
    use crate::http::{HttpFailure, HttpReply};
    use crate::testing::StubHttp;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    const EMU: &str = "http://10.0.2.2:8000";
    const HOST: &str = "http://127.0.0.1:8000";
    const REMOTE: &str = "https://api.agrilink.app";

    fn settings() -> ClientSettings {
        let mut settings = ClientSettings::default();
        settings.platform = Some(Platform::Android);
        settings.discovery.routes = vec![PlatformRoute {
            platform: Platform::Android,
            addresses: vec![EMU.into(), HOST.into()],
        }];
        settings.discovery.remote_fallback = REMOTE.into();
        settings
    }

    fn chat_reply(text: &str) -> Result<HttpReply, HttpFailure> {
        Ok(HttpReply::ok_json(&json!({
            "response": text,
            "model_used": "agri-model",
            "timestamp": "2026-01-01T00:00:00Z",
            "has_image": false,
            "conversation_id": "conv-1",
        })))
    }

    fn last_form_field(http: &StubHttp, name: &str) -> Option<String> {
        http.calls()
            .iter()
            .rev()
            .find_map(|call| call.form.as_ref())
            .and_then(|form| form.text_value(name).map(str::to_string))
    }

    #[test]
    fn chat_appends_turns_and_sends_prior_context_only() {
        let http = StubHttp::new()
            .healthy(HOST)
            .on(&format!("{HOST}/api/assistant/chat"), chat_reply("plant after rain"));
        let mut client = AssistantClient::new(settings(), http).unwrap();

        let first = client.chat("when to plant maize?", None, None).expect("first chat");
        assert_eq!(first.reply.response, "plant after rain");
        assert_eq!(first.candidate.base(), HOST);
        assert_eq!(client.conversation().len(), 2);
        assert_eq!(client.conversation().conversation_id(), Some("conv-1"));
        assert_eq!(
            last_form_field(client.http(), "conversation_history").as_deref(),
            Some("[]")
        );
        assert_eq!(
            last_form_field(client.http(), "advice_type").as_deref(),
            Some("general")
        );

        client.chat("and beans?", None, Some("planting")).expect("second chat");
        let history: Value =
            serde_json::from_str(&last_form_field(client.http(), "conversation_history").unwrap())
                .unwrap();
        assert_eq!(history.as_array().map(Vec::len), Some(2));
        assert_eq!(history[0]["content"], "when to plant maize?");
        assert_eq!(client.conversation().len(), 4);
        assert_eq!(client.dispatcher().last_known_good().map(|c| c.base()), Some(HOST));
    }

    #[test]
    fn chat_failure_surfaces_aggregated_failure() {
        let mut client = AssistantClient::new(settings(), StubHttp::new()).unwrap();
        let err = client.chat("hello", None, None).unwrap_err();
        assert!(matches!(err, DispatchError::AggregatedFailure { attempted: 3, .. }));
        assert_eq!(
            err.user_message(),
            "The assistant is temporarily unavailable. Please try again in a moment."
        );
        assert_eq!(client.conversation().len(), 1);
    }

    #[test]
    fn unreadable_chat_reply_counts_only_tried_candidates() {
        let http = StubHttp::new().healthy(HOST).on(
            &format!("{HOST}/api/assistant/chat"),
            Ok(HttpReply::ok_json(&json!({ "unexpected": 1 }))),
        );
        let mut client = AssistantClient::new(settings(), http).unwrap();
        let err = client.chat("hello", None, None).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::AggregatedFailure {
                attempted: 2,
                last: Some(TransportError::Malformed { .. })
            }
        ));
        assert_eq!(client.conversation().len(), 1);
    }

    #[test]
    fn voice_capture_transcribes_through_inline_fallback() {
        let dir = tempdir().unwrap();
        let audio = dir.path().join("question.wav");
        fs::write(&audio, b"RIFF\x24\x00\x00\x00WAVEfmt ").unwrap();

        let http = StubHttp::new()
            .healthy(HOST)
            .on(&format!("{HOST}/api/transcribe-audio/"), Ok(HttpReply::new(415, "")))
            .on(
                &format!("{HOST}/api/transcribe-audio-base64/"),
                Ok(HttpReply::ok_json(&json!({
                    "text": "my tomato leaves are curling",
                    "confidence": 0.91,
                    "language": "en",
                }))),
            );
        let mut client = AssistantClient::new(settings(), http).unwrap();
        client.attach_capture(Box::new(FileCapture::new(audio)));

        client.start_capture().expect("start");
        assert_eq!(client.capture_state(), CaptureState::Recording);
        let transcript = client.stop_and_transcribe();
        assert_eq!(transcript, "my tomato leaves are curling");
        assert_eq!(client.capture_state(), CaptureState::Idle);

        let inline = client
            .http()
            .calls()
            .into_iter()
            .find_map(|call| call.json)
            .expect("inline body");
        assert_eq!(inline["metadata"]["source"], "mobile_app");
        assert_eq!(inline["metadata"]["format"], "wav");
    }

    #[test]
    fn transcription_failure_degrades_to_fallback() {
        let dir = tempdir().unwrap();
        let audio = dir.path().join("question.m4a");
        fs::write(&audio, b"not really audio").unwrap();

        let mut client = AssistantClient::new(settings(), StubHttp::new()).unwrap();
        client.attach_capture(Box::new(FileCapture::new(audio)));
        client.start_capture().expect("start");
        let transcript = client.stop_and_transcribe();
        assert_eq!(transcript, "I need advice about my crops.");
        assert_eq!(client.capture_state(), CaptureState::Idle);
    }

    #[test]
    fn oversized_inline_audio_degrades_to_fallback() {
        let dir = tempdir().unwrap();
        let audio = dir.path().join("question.wav");
        fs::write(&audio, b"RIFF\x24\x00\x00\x00WAVEfmt ").unwrap();

        let mut settings = settings();
        settings.transport.inline_max_chars = 3;
        let http = StubHttp::new()
            .healthy(HOST)
            .on(&format!("{HOST}/api/transcribe-audio/"), Ok(HttpReply::new(415, "")))
            .on(
                &format!("{HOST}/api/transcribe-audio-base64/"),
                Ok(HttpReply::ok_json(&json!({ "text": "never sent" }))),
            );
        let mut client = AssistantClient::new(settings, http).unwrap();
        client.attach_capture(Box::new(FileCapture::new(audio)));

        client.start_capture().expect("start");
        assert_eq!(client.stop_and_transcribe(), "I need advice about my crops.");
        assert_eq!(client.capture_state(), CaptureState::Idle);
        assert_eq!(
            client.http().posted(),
            vec![format!("{HOST}/api/transcribe-audio/")]
        );
    }

    #[test]
    fn stop_without_backend_returns_fallback() {
        let mut client = AssistantClient::new(settings(), StubHttp::new()).unwrap();
        assert!(client.start_capture().is_err());
        assert_eq!(client.stop_and_transcribe(), "I need advice about my crops.");
    }

    #[test]
    fn speech_audio_url_resolves_against_answering_candidate() {
        let http = StubHttp::new().healthy(HOST).on(
            &format!("{HOST}/api/text-to-speech/"),
            Ok(HttpReply::ok_json(&json!({
                "success": true,
                "audio_url": "/static/audio/tts_1.mp3",
                "audio_filename": "tts_1.mp3",
            }))),
        );
        let mut client = AssistantClient::new(settings(), http).unwrap();
        let outcome = client.speak("Water the seedlings in the evening.");
        assert_eq!(
            outcome,
            SpeechOutcome::Audio {
                url: format!("{HOST}/static/audio/tts_1.mp3"),
                filename: Some("tts_1.mp3".into()),
            }
        );
    }

    #[test]
    fn speech_failure_produces_no_audio() {
        let mut client = AssistantClient::new(settings(), StubHttp::new()).unwrap();
        assert!(matches!(client.speak("hi"), SpeechOutcome::NoAudio { .. }));
    }

    #[test]
    fn test_connection_reports_answering_url() {
        let http = StubHttp::new().healthy(EMU).on(
            &format!("{EMU}/api/assistant/test-connection"),
            Ok(HttpReply::ok_json(&json!({ "status": "ok" }))),
        );
        let mut client = AssistantClient::new(settings(), http).unwrap();
        let report = client.test_connection();
        assert!(report.reachable);
        assert_eq!(report.url.as_deref(), Some(EMU));
        assert_eq!(report.detail, Some(json!({ "status": "ok" })));

        let mut offline = AssistantClient::new(settings(), StubHttp::new()).unwrap();
        let report = offline.test_connection();
        assert!(!report.reachable);
        assert!(report.error.is_some());
    }

    #[test]
    fn dispatches_are_journaled_when_enabled() {
        let dir = tempdir().unwrap();
        let mut settings = settings();
        settings.journal.enabled = true;
        settings.journal.path = Some(dir.path().join("dispatch.jsonl"));
        let http = StubHttp::new()
            .healthy(HOST)
            .on(&format!("{HOST}/api/assistant/chat"), chat_reply("ok"));
        let mut client = AssistantClient::new(settings, http).unwrap();

        client.chat("hello", None, None).expect("chat");
        client.speak("hello");

        let entries = client.recent_dispatches(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].succeeded);
        assert_eq!(entries[0].request, "chat");
        assert_eq!(entries[0].candidate.as_deref(), Some(HOST));
        assert!(!entries[1].succeeded);
    }

    #[test]
    fn new_session_resets_conversation() {
        let http = StubHttp::new()
            .healthy(HOST)
            .on(&format!("{HOST}/api/assistant/chat"), chat_reply("ok"));
        let mut client = AssistantClient::new(settings(), http).unwrap();
        client.chat("hello", None, None).expect("chat");
        client.new_session();
        assert!(client.conversation().is_empty());
        assert_eq!(client.conversation().conversation_id(), None);

        let report = client.diagnostics().unwrap();
        assert_eq!(report.sticky.map(|c| c.base().to_string()), Some(HOST.to_string()));
        assert_eq!(report.candidate_order.len(), 3);
        assert_eq!(report.conversation_turns, 0);
    }
}
