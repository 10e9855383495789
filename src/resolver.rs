use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::config::{DiscoverySettings, Platform};
use crate::error::ErrorKind;
use crate::http::{BackendHttp, HttpFailure};

/// One network location the backend may be reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointCandidate {
    pub address: Url,
    pub platform_affinity: Platform,
    pub priority: u32,
}

impl EndpointCandidate {
    /// Address without a trailing slash, used as the base for endpoint paths.
    pub fn base(&self) -> &str {
        self.address.as_str().trim_end_matches('/')
    }

    pub fn endpoint(&self, path: &str) -> String {
        join_endpoint(self.base(), path)
    }

    pub fn same_location(&self, other: &EndpointCandidate) -> bool {
        self.address == other.address
    }
}

impl fmt::Display for EndpointCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base())
    }
}

pub(crate) fn join_endpoint(base: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    }
}

/// Outcome of one liveness check.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub candidate: EndpointCandidate,
    pub reachable: bool,
    pub latency_ms: u64,
    pub error: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of probing an ordering until something answers.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub selected: Option<EndpointCandidate>,
    pub probes: Vec<ProbeResult>,
}

/// Builds platform orderings and probes candidates. Holds no mutable state.
#[derive(Debug, Clone)]
pub struct CandidateResolver {
    discovery: DiscoverySettings,
}

impl CandidateResolver {
    pub fn from_settings(settings: &DiscoverySettings) -> Self {
        Self {
            discovery: settings.clone(),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        self.discovery.probe_timeout()
    }

    /// Candidates for a platform in priority order, ending with the shared remote fallback.
    pub fn resolve(&self, platform: Platform) -> Vec<EndpointCandidate> {
        let addresses = self.discovery.addresses_for(platform);

        let mut candidates: Vec<EndpointCandidate> = Vec::with_capacity(addresses.len() + 1);
        let all = addresses
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.discovery.remote_fallback.as_str()));
        for raw in all {
            let address = match Url::parse(raw) {
                Ok(url) => url,
                Err(err) => {
                    warn!(%platform, address = raw, error = %err, "skipping invalid candidate address");
                    continue;
                }
            };
            if candidates.iter().any(|existing| existing.address == address) {
                continue;
            }
            candidates.push(EndpointCandidate {
                address,
                platform_affinity: platform,
                priority: candidates.len() as u32,
            });
        }
        candidates
    }

    /// Platform ordering with `preferred` moved to the front when it is still part of it.
    pub fn ordered(
        &self,
        platform: Platform,
        preferred: Option<&EndpointCandidate>,
    ) -> Vec<EndpointCandidate> {
        let mut candidates = self.resolve(platform);
        if let Some(preferred) = preferred {
            if let Some(index) = candidates
                .iter()
                .position(|candidate| candidate.same_location(preferred))
            {
                let sticky = candidates.remove(index);
                candidates.insert(0, sticky);
            }
        }
        candidates
    }

    /// Issue one liveness call against a candidate.
    pub fn probe<H: BackendHttp>(
        &self,
        http: &H,
        candidate: &EndpointCandidate,
        timeout: Duration,
    ) -> ProbeResult {
        let url = candidate.endpoint(&self.discovery.health_path);
        let started = Instant::now();
        let outcome = http.get(&url, timeout);
        let latency_ms = started.elapsed().as_millis() as u64;

        let (reachable, error, detail) = match outcome {
            Ok(reply) if reply.is_success() => (true, None, None),
            Ok(reply) => (
                false,
                Some(ErrorKind::Unreachable),
                Some(format!("health check returned status {}", reply.status)),
            ),
            Err(HttpFailure::Timeout) => (
                false,
                Some(ErrorKind::Timeout),
                Some(format!("no answer within {} ms", timeout.as_millis())),
            ),
            Err(failure) => (false, Some(ErrorKind::Unreachable), Some(failure.to_string())),
        };

        debug!(candidate = %candidate, reachable, latency_ms, "probed candidate");
        ProbeResult {
            candidate: candidate.clone(),
            reachable,
            latency_ms,
            error,
            detail,
        }
    }

    /// Probe each candidate at most once, stopping at the first reachable one.
    pub fn discover<H: BackendHttp>(
        &self,
        http: &H,
        platform: Platform,
        preferred: Option<&EndpointCandidate>,
    ) -> Discovery {
        let mut probes = Vec::new();
        for candidate in self.ordered(platform, preferred) {
            let result = self.probe(http, &candidate, self.probe_timeout());
            let reachable = result.reachable;
            probes.push(result);
            if reachable {
                return Discovery {
                    selected: Some(candidate),
                    probes,
                };
            }
        }
        Discovery {
            selected: None,
            probes,
        }
    }
}
