//! Request to channel resolution.
//!
//! # Responsibilities
//! - Extract the channel host key from an incoming request
//! - Distinguish malformed requests from requests for unknown channels
//!
//! # Design Decisions
//! - Host header first, URI authority as fallback (HTTP/2 `:authority`)
//! - Port is stripped; channels are addressed by name, not by port
//! - Case-insensitive, matching how the table normalizes keys

use axum::http::{header, Request};
use thiserror::Error;

/// Why a request could not be mapped to a channel host.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedRequest {
    #[error("request carries no host")]
    MissingHost,

    #[error("invalid host: {0}")]
    InvalidHost(String),
}

/// Extract the normalized channel host from a request.
pub fn channel_host<B>(req: &Request<B>) -> Result<String, MalformedRequest> {
    let raw = match req.headers().get(header::HOST) {
        Some(value) => value
            .to_str()
            .map_err(|_| MalformedRequest::InvalidHost("non-ascii host header".into()))?
            .to_string(),
        None => req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or(MalformedRequest::MissingHost)?,
    };

    parse_host(&raw)
}

fn parse_host(raw: &str) -> Result<String, MalformedRequest> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(MalformedRequest::MissingHost);
    }

    // Drop userinfo and port.
    let host = raw.rsplit('@').next().unwrap_or(raw);
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        Some(_) => return Err(MalformedRequest::InvalidHost(raw.to_string())),
        None => host,
    };

    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
    if !valid {
        return Err(MalformedRequest::InvalidHost(raw.to_string()));
    }

    Ok(host.trim_end_matches('.').to_ascii_lowercase())
}
