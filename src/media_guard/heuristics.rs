//! Client plausibility checks and the rapid-repeat detector.

use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

/// User agents shorter than this are treated as fabricated.
pub const MIN_USER_AGENT_LEN: usize = 10;

/// Signals needed before the header-shape check rejects a client.
const SIGNAL_THRESHOLD: usize = 2;

/// Lowercase substrings of user agents sent by HTTP libraries and crawlers.
const AUTOMATION_SIGNATURES: &[&str] = &[
    "curl/",
    "wget/",
    "python-requests",
    "python-urllib",
    "aiohttp",
    "httpx",
    "scrapy",
    "go-http-client",
    "java/",
    "apache-httpclient",
    "libwww-perl",
    "okhttp",
    "httpie",
    "postmanruntime",
    "node-fetch",
    "axios/",
    "bot",
    "spider",
    "crawler",
];

const HEADLESS_MARKERS: &[&str] = &["headlesschrome", "phantomjs", "puppeteer", "playwright", "selenium"];

/// The header facts the plausibility checks look at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHints<'a> {
    pub user_agent: Option<&'a str>,
    pub has_accept: bool,
    pub has_accept_language: bool,
    pub has_accept_encoding: bool,
    /// `X-Requested-With` was set (AJAX).
    pub requested_with: bool,
    pub has_referer: bool,
}

/// Why a client was judged implausible. Only ever logged, never sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Implausible {
    MissingUserAgent,
    ShortUserAgent,
    AutomationTool(&'static str),
    Signals(Vec<&'static str>),
}

impl Implausible {
    pub fn describe(&self) -> String {
        match self {
            Implausible::MissingUserAgent => "missing user agent".to_string(),
            Implausible::ShortUserAgent => "user agent too short".to_string(),
            Implausible::AutomationTool(sig) => format!("automation signature {sig}"),
            Implausible::Signals(signals) => format!("automation signals: {}", signals.join(",")),
        }
    }
}

pub fn check_client(hints: &ClientHints<'_>) -> Result<(), Implausible> {
    let ua = match hints.user_agent.map(str::trim) {
        None | Some("") => return Err(Implausible::MissingUserAgent),
        Some(ua) if ua.len() < MIN_USER_AGENT_LEN => return Err(Implausible::ShortUserAgent),
        Some(ua) => ua.to_ascii_lowercase(),
    };

    if let Some(sig) = AUTOMATION_SIGNATURES.iter().find(|sig| ua.contains(*sig)) {
        return Err(Implausible::AutomationTool(*sig));
    }

    let mut signals = Vec::new();
    if !hints.has_accept && !hints.has_accept_language && !hints.has_accept_encoding {
        signals.push("no_accept_headers");
    }
    if HEADLESS_MARKERS.iter().any(|m| ua.contains(m)) {
        signals.push("headless_browser");
    }
    if hints.requested_with && !hints.has_referer {
        signals.push("ajax_without_referer");
    }

    if signals.len() >= SIGNAL_THRESHOLD {
        return Err(Implausible::Signals(signals));
    }
    Ok(())
}

/// RepeatTracker
///
/// Recent fetch times per `(fingerprint, resource)`. Reports when the same resource was fetched
/// `count` times inside `window`; the history is then reset so one burst yields one flag.
#[derive(Debug, Default)]
pub struct RepeatTracker {
    hits: HashMap<(String, String), Vec<Instant>>,
}

impl RepeatTracker {
    pub fn observe(
        &mut self,
        fingerprint: &str,
        resource: &str,
        count: u32,
        window: Duration,
        now: Instant,
    ) -> bool {
        let hits = self
            .hits
            .entry((fingerprint.to_string(), resource.to_string()))
            .or_default();
        hits.retain(|at| now.saturating_duration_since(*at) < window);
        hits.push(now);
        if count > 0 && hits.len() >= count as usize {
            hits.clear();
            return true;
        }
        false
    }

    pub fn prune(&mut self, window: Duration, now: Instant) -> usize {
        let before = self.hits.len();
        self.hits.retain(|_, hits| {
            hits.retain(|at| now.saturating_duration_since(*at) < window);
            !hits.is_empty()
        });
        before - self.hits.len()
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }
}
