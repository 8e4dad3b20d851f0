//! Inbound webhook signature verification.
//!
//! Providers push events with a signature header of the form
//! `t=<unix-seconds>,v1=<base64 HMAC-SHA-256>` computed over
//! `"{timestamp}.{raw body}"`. Verification runs upstream of any credential
//! access: a handler may only trust a payload that passed here.
//!
//! Rejections carry a reason for internal logging, but the HTTP-facing
//! response must stay a generic 401/400 - the reason never leaves the
//! process.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Default replay window: signed requests older (or newer) than this many
/// seconds are rejected even when the signature is valid.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// A webhook payload that passed signature and replay checks.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedEvent {
    /// Timestamp the provider signed the delivery with
    pub timestamp: DateTime<Utc>,
    /// The raw body, now safe to parse and process
    pub body: Vec<u8>,
}

/// Why an inbound webhook was rejected. All variants collapse to the same
/// generic response at the HTTP boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    /// Header missing, not `t=...,v1=...`, or timestamp/signature unparseable
    MalformedHeader,
    /// Timestamp outside the replay window
    ReplayWindowExceeded,
    /// HMAC mismatch
    SignatureMismatch,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::MalformedHeader => write!(f, "malformed signature header"),
            RejectReason::ReplayWindowExceeded => write!(f, "timestamp outside replay window"),
            RejectReason::SignatureMismatch => write!(f, "signature mismatch"),
        }
    }
}

/// Signs a body the way providers do, producing a complete header value.
///
/// Used for outbound deliveries and for constructing test requests.
pub fn sign(body: &[u8], secret: &[u8], timestamp: DateTime<Utc>) -> String {
    let ts = timestamp.timestamp();
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(ts.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("t={},v1={}", ts, BASE64.encode(mac.finalize().into_bytes()))
}

/// Verifies an inbound webhook delivery.
///
/// Checks, in order: header shape, HMAC over `"{timestamp}.{body}"` with a
/// constant-time comparison, then the replay window `|now - t| <= tolerance`.
/// A validly-signed but replayed request is still rejected.
pub fn verify(
    raw_body: &[u8],
    header: &str,
    secret: &[u8],
    now: DateTime<Utc>,
    tolerance_secs: i64,
) -> Result<VerifiedEvent, RejectReason> {
    let (timestamp, signature) = parse_header(header)?;

    let sig_bytes = BASE64
        .decode(signature)
        .map_err(|_| RejectReason::MalformedHeader)?;

    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| RejectReason::SignatureMismatch)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);

    // Constant-time comparison
    if mac.verify_slice(&sig_bytes).is_err() {
        debug!("Webhook rejected: signature mismatch");
        return Err(RejectReason::SignatureMismatch);
    }

    // Saturating: an extreme header timestamp must reject, not overflow
    if now.timestamp().saturating_sub(timestamp).saturating_abs() > tolerance_secs {
        debug!(timestamp, "Webhook rejected: outside replay window");
        return Err(RejectReason::ReplayWindowExceeded);
    }

    let timestamp = DateTime::from_timestamp(timestamp, 0).ok_or(RejectReason::MalformedHeader)?;

    Ok(VerifiedEvent {
        timestamp,
        body: raw_body.to_vec(),
    })
}

/// Verifies with the default 5-minute replay window.
pub fn verify_now(
    raw_body: &[u8],
    header: &str,
    secret: &[u8],
) -> Result<VerifiedEvent, RejectReason> {
    verify(raw_body, header, secret, Utc::now(), DEFAULT_TOLERANCE_SECS)
}

/// Parses `t=<unix-seconds>,v1=<signature>`.
fn parse_header(header: &str) -> Result<(i64, &str), RejectReason> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse::<i64>().map_err(|_| RejectReason::MalformedHeader)?);
            }
            Some(("v1", value)) => signature = Some(value),
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(s)) if !s.is_empty() => Ok((t, s)),
        _ => Err(RejectReason::MalformedHeader),
    }
}
