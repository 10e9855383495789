use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::config::{ClientSettings, Platform};
use crate::error::{DispatchError, TransportError};
use crate::http::BackendHttp;
use crate::resolver::{CandidateResolver, EndpointCandidate, ProbeResult};
use crate::transport::{ENCODING_ORDER, Encoding, LogicalRequest, TransportAdapter, TransportResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Success,
    TransportError,
    Timeout,
    Rejected,
    ServerError,
    PayloadTooLarge,
}

impl From<&TransportError> for AttemptOutcome {
    fn from(error: &TransportError) -> Self {
        match error {
            TransportError::Timeout { .. } => AttemptOutcome::Timeout,
            TransportError::Rejected { .. } => AttemptOutcome::Rejected,
            TransportError::Server { .. } | TransportError::Malformed { .. } => {
                AttemptOutcome::ServerError
            }
            TransportError::PayloadTooLarge { .. } => AttemptOutcome::PayloadTooLarge,
            TransportError::Unreachable { .. } | TransportError::Transport { .. } => {
                AttemptOutcome::TransportError
            }
        }
    }
}

/// One send of one encoding to one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub candidate: String,
    pub encoding: Encoding,
    pub outcome: AttemptOutcome,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Trail of a single logical request; dropped once the caller is done with it.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub request_id: Uuid,
    pub request: &'static str,
    pub started_at: DateTime<Utc>,
    pub candidates: usize,
    pub probes: Vec<ProbeResult>,
    pub attempts: Vec<DispatchAttempt>,
}

impl DispatchReport {
    fn new(request: &'static str, candidates: usize) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            request,
            started_at: Utc::now(),
            candidates,
            probes: Vec::new(),
            attempts: Vec::new(),
        }
    }

    /// Distinct candidates that were probed or sent to.
    pub fn candidates_tried(&self) -> usize {
        let mut seen: Vec<&str> = Vec::new();
        let probed = self.probes.iter().map(|probe| probe.candidate.base());
        let sent = self.attempts.iter().map(|attempt| attempt.candidate.as_str());
        for address in probed.chain(sent) {
            if !seen.contains(&address) {
                seen.push(address);
            }
        }
        seen.len()
    }
}

/// Tries candidates strictly in order, one probe+send cycle each, remembering the last good one.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    resolver: CandidateResolver,
    transport: TransportAdapter,
    platform: Platform,
    probe_before_send: bool,
    last_known_good: Option<EndpointCandidate>,
    metrics: CandidateMetrics,
}

impl Dispatcher {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(
            CandidateResolver::from_settings(&settings.discovery),
            TransportAdapter::from_settings(&settings.transport),
            settings.effective_platform(),
            settings.discovery.probe_before_send,
        )
    }

    pub fn new(
        resolver: CandidateResolver,
        transport: TransportAdapter,
        platform: Platform,
        probe_before_send: bool,
    ) -> Self {
        Self {
            resolver,
            transport,
            platform,
            probe_before_send,
            last_known_good: None,
            metrics: CandidateMetrics::default(),
        }
    }

    pub fn resolver(&self) -> &CandidateResolver {
        &self.resolver
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn last_known_good(&self) -> Option<&EndpointCandidate> {
        self.last_known_good.as_ref()
    }

    /// Ordering the next dispatch will use.
    pub fn candidate_order(&self) -> Vec<EndpointCandidate> {
        self.resolver
            .ordered(self.platform, self.last_known_good.as_ref())
    }

    pub fn candidate_metrics(&self) -> Vec<CandidateMetricsEntry> {
        self.metrics.snapshot()
    }

    pub fn dispatch<H: BackendHttp>(
        &mut self,
        http: &H,
        request: &LogicalRequest,
    ) -> Result<TransportResponse, DispatchError> {
        self.dispatch_with_report(http, request).0
    }

    pub fn dispatch_with_report<H: BackendHttp>(
        &mut self,
        http: &H,
        request: &LogicalRequest,
    ) -> (Result<TransportResponse, DispatchError>, DispatchReport) {
        let candidates = self.candidate_order();
        let mut report = DispatchReport::new(request.name, candidates.len());
        let span = info_span!(
            "dispatch.request",
            request = request.name,
            id = %report.request_id,
            candidates = candidates.len()
        );
        let _span_guard = span.enter();

        let mut last_error: Option<TransportError> = None;
        for candidate in &candidates {
            let sticky = self
                .last_known_good
                .as_ref()
                .is_some_and(|known| known.same_location(candidate));

            if self.probe_before_send && !sticky {
                let probe = self
                    .resolver
                    .probe(http, candidate, self.resolver.probe_timeout());
                let reachable = probe.reachable;
                let reason = probe.detail.clone().unwrap_or_else(|| "probe failed".into());
                report.probes.push(probe);
                if !reachable {
                    warn!(candidate = %candidate, reason = %reason, "candidate unreachable");
                    let error = TransportError::Unreachable {
                        address: candidate.to_string(),
                        reason,
                    };
                    self.metrics.record_failure(candidate, &error);
                    last_error = Some(error);
                    continue;
                }
            }

            match self.try_encodings(http, candidate, request, &mut report) {
                Ok(response) => {
                    self.metrics.record_success(candidate, response.latency_ms);
                    info!(
                        candidate = %candidate,
                        encoding = %response.encoding,
                        latency_ms = response.latency_ms,
                        "request dispatched"
                    );
                    self.last_known_good = Some(candidate.clone());
                    return (Ok(response), report);
                }
                Err(TransportError::PayloadTooLarge { size, cap }) => {
                    warn!(size, cap, "inline payload exceeds cap; aborting dispatch");
                    return (Err(DispatchError::PayloadTooLarge { size, cap }), report);
                }
                Err(error) => {
                    if sticky {
                        self.last_known_good = None;
                    }
                    self.metrics.record_failure(candidate, &error);
                    last_error = Some(error);
                }
            }
        }

        warn!(
            attempted = candidates.len(),
            "all candidates failed for {}", request.name
        );
        (
            Err(DispatchError::AggregatedFailure {
                attempted: candidates.len(),
                last: last_error,
            }),
            report,
        )
    }

    /// Encodings in order against one candidate, stopping at success or a non-encoding failure.
    fn try_encodings<H: BackendHttp>(
        &self,
        http: &H,
        candidate: &EndpointCandidate,
        request: &LogicalRequest,
        report: &mut DispatchReport,
    ) -> Result<TransportResponse, TransportError> {
        let mut last_error = None;
        for encoding in ENCODING_ORDER
            .iter()
            .copied()
            .filter(|encoding| encoding.applies_to(request))
        {
            let started = Instant::now();
            match self.transport.send(http, candidate, request, encoding) {
                Ok(response) => {
                    report.attempts.push(DispatchAttempt {
                        candidate: candidate.to_string(),
                        encoding,
                        outcome: AttemptOutcome::Success,
                        latency_ms: response.latency_ms,
                        error: None,
                    });
                    return Ok(response);
                }
                Err(error) => {
                    warn!(candidate = %candidate, %encoding, error = %error, "attempt failed");
                    report.attempts.push(DispatchAttempt {
                        candidate: candidate.to_string(),
                        encoding,
                        outcome: AttemptOutcome::from(&error),
                        latency_ms: started.elapsed().as_millis() as u64,
                        error: Some(error.to_string()),
                    });
                    let fallback = error.permits_encoding_fallback();
                    last_error = Some(error);
                    if !fallback {
                        break;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| TransportError::Transport {
            address: candidate.to_string(),
            reason: "no applicable encoding".into(),
        }))
    }
}

#[derive(Debug, Clone, Default)]
struct CandidateMetrics {
    inner: HashMap<String, CandidateStats>,
}

#[derive(Debug, Clone, Default)]
struct CandidateStats {
    successes: u64,
    failures: u64,
    last_latency_ms: Option<u64>,
    last_error: Option<String>,
    last_success: Option<DateTime<Utc>>,
}

impl CandidateMetrics {
    fn record_success(&mut self, candidate: &EndpointCandidate, latency_ms: u64) {
        let entry = self.inner.entry(candidate.to_string()).or_default();
        entry.successes += 1;
        entry.last_latency_ms = Some(latency_ms);
        entry.last_success = Some(Utc::now());
    }

    fn record_failure(&mut self, candidate: &EndpointCandidate, error: &TransportError) {
        let entry = self.inner.entry(candidate.to_string()).or_default();
        entry.failures += 1;
        entry.last_error = Some(error.to_string());
    }

    fn snapshot(&self) -> Vec<CandidateMetricsEntry> {
        let mut entries: Vec<CandidateMetricsEntry> = self
            .inner
            .iter()
            .map(|(address, stats)| CandidateMetricsEntry {
                address: address.clone(),
                successes: stats.successes,
                failures: stats.failures,
                last_latency_ms: stats.last_latency_ms,
                last_error: stats.last_error.clone(),
                last_success: stats.last_success,
            })
            .collect();
        entries.sort_by(|a, b| a.address.cmp(&b.address));
        entries
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CandidateMetricsEntry {
    pub address: String,
    pub successes: u64,
    pub failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
}
