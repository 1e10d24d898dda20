//! Anti-bot challenge detection.
//!
//! Distinguishes "the target is behind a wall" from "the target is gone".
//! Only 403 and 503 responses can be challenges; a 200 page that merely
//! mentions a marker is a normal page.

use crate::models::HttpResponse;

/// Body fragments of known interstitials (lowercase).
pub const CHALLENGE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf_chl_opt",
    "/cdn-cgi/challenge-platform/",
    "cf-challenge-running",
    "attention required! | cloudflare",
    "<title>just a moment...</title>",
    "cf-turnstile",
    "challenges.cloudflare.com/turnstile",
    "ddos-guard",
    "_incapsula_resource",
    "captcha-delivery.com",
];

/// Response headers that identify a CDN / WAF front.
const CDN_HEADERS: &[&str] = &["cf-ray", "cf-mitigated", "x-sucuri-id", "x-iinfo"];

/// `Server` header values of CDN / WAF fronts (lowercase).
const CDN_SERVERS: &[&str] = &["cloudflare", "ddos-guard", "sucuri"];

fn is_challenge_status(status: u16) -> bool {
    matches!(status, 403 | 503)
}

/// True if `status` is 403/503 and `body` carries a challenge marker.
pub fn is_challenge(status: u16, body: &str) -> bool {
    if !is_challenge_status(status) {
        return false;
    }
    let body = body.to_ascii_lowercase();
    CHALLENGE_MARKERS.iter().any(|marker| body.contains(marker))
}

/// Weaker check for bodiless (HEAD) responses: 403/503 from a CDN front.
pub fn is_challenge_head(response: &HttpResponse) -> bool {
    if !is_challenge_status(response.status) {
        return false;
    }
    let cdn_header = CDN_HEADERS.iter().any(|h| response.header(h).is_some());
    let cdn_server = response.header("server").is_some_and(|server| {
        let server = server.to_ascii_lowercase();
        CDN_SERVERS.iter().any(|s| server.contains(s))
    });
    cdn_header || cdn_server
}
