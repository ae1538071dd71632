use std::time::Duration;

use reqwest::Client;

use crate::error::{RelayError, RelayErrorCode};

pub(super) fn join_url(base_url: &str, path: &str) -> String {
    if base_url.ends_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

pub(super) fn build_http_client(base_url: &str, timeout: Duration) -> Result<Client, RelayError> {
    let mut builder = Client::builder().timeout(timeout);
    if is_loopback_base_url(base_url) {
        builder = builder.no_proxy();
    }
    builder.build().map_err(|error| {
        RelayError::new(
            RelayErrorCode::UpstreamUnavailable,
            format!("HTTP client initialization failed: {error}"),
        )
    })
}

pub(super) fn is_loopback_base_url(base_url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1"
}

/// Maps a non-success HTTP status to the error kind the loop reports upstream.
pub(super) fn http_status_error(provider: &str, status: u16, body: &str) -> RelayError {
    let code = match status {
        429 => RelayErrorCode::RateLimited,
        401 | 403 => RelayErrorCode::ProviderAuthMissing,
        500..=599 => RelayErrorCode::UpstreamUnavailable,
        _ => RelayErrorCode::ProviderHttp,
    };
    RelayError::new(code, format!("{provider} HTTP {status}: {body}"))
}

pub(super) fn transport_error(provider: &str, error: reqwest::Error) -> RelayError {
    let reason = if error.is_timeout() {
        "timed out"
    } else {
        "transport failed"
    };
    RelayError::new(
        RelayErrorCode::UpstreamUnavailable,
        format!("{provider} {reason}: {error}"),
    )
}
