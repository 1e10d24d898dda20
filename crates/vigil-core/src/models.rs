use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// HTTP methods the reliability layer issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound request to a third-party target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Per-request timeout; the transport's default applies when absent.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            timeout: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Head, url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A fully received response. Header names are stored lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// `Retry-After` in its delay-seconds form. HTTP-date values are ignored.
    ///
    /// Values too large for a `Duration` saturate to `Duration::MAX`.
    pub fn retry_after(&self) -> Option<Duration> {
        let raw = self.header("retry-after")?.trim();
        let secs: f64 = raw.parse().ok()?;
        if secs.is_finite() && secs >= 0.0 {
            Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        } else {
            None
        }
    }

    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// Why a probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    Timeout,
    Captcha,
    HttpError,
}

impl fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeErrorKind::Timeout => write!(f, "timeout"),
            ProbeErrorKind::Captcha => write!(f, "captcha"),
            ProbeErrorKind::HttpError => write!(f, "http_error"),
        }
    }
}

/// Counters from a live or synthetic search against a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOutcome {
    pub items_found: u32,
    pub items_used: u32,
    pub hoster_checked: u32,
    pub hoster_reachable: u32,
}

impl SearchOutcome {
    pub fn new(items_found: u32, items_used: u32) -> Self {
        Self {
            items_found,
            items_used,
            ..Default::default()
        }
    }

    pub fn with_hosters(mut self, checked: u32, reachable: u32) -> Self {
        self.hoster_checked = checked;
        self.hoster_reachable = reachable.min(checked);
        self
    }
}

/// Result of a single probe invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub ok: bool,
    pub error_kind: Option<ProbeErrorKind>,
    pub http_status: Option<u16>,
    pub captcha_detected: bool,
    #[serde(default)]
    pub outcome: SearchOutcome,
}

impl ProbeResult {
    /// Build a result from a received status code.
    pub fn from_status(
        started_at: DateTime<Utc>,
        elapsed: Duration,
        status: u16,
        captcha_detected: bool,
    ) -> Self {
        let ok = status < 400 && !captcha_detected;
        let error_kind = if captcha_detected {
            Some(ProbeErrorKind::Captcha)
        } else if !ok {
            Some(ProbeErrorKind::HttpError)
        } else {
            None
        };
        Self {
            started_at,
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            ok,
            error_kind,
            http_status: Some(status),
            captcha_detected,
            outcome: SearchOutcome::default(),
        }
    }

    /// Build a failed result that never received a status code.
    pub fn failed(started_at: DateTime<Utc>, elapsed: Duration, kind: ProbeErrorKind) -> Self {
        Self {
            started_at,
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            ok: false,
            error_kind: Some(kind),
            http_status: None,
            captcha_detected: kind == ProbeErrorKind::Captcha,
            outcome: SearchOutcome::default(),
        }
    }

    /// Attach search counters when the probe doubled as a synthetic search.
    pub fn with_outcome(mut self, outcome: SearchOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.duration_ms.max(0.0) / 1000.0).unwrap_or_default()
    }
}
