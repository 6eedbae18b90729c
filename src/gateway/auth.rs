//! Gateway credentials and the HTTP header guard.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Header every control API request through the gateway must carry.
pub const LOCALAPI_HEADER: &str = "sec-embednet";
pub const LOCALAPI_HEADER_VALUE: &str = "localapi";

const CREDENTIAL_BYTES: usize = 16;

/// A fresh random credential, hex-encoded.
pub fn generate_credential() -> String {
    let mut bytes = [0u8; CREDENTIAL_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compare a presented credential without leaking where it first differs.
pub fn credential_matches(given: &[u8], expected: &[u8]) -> bool {
    given.ct_eq(expected).into()
}

/// Reject requests without `Sec-Embednet: localapi` before they reach the API.
pub async fn require_localapi_header(request: Request, next: Next) -> Response {
    let present = request
        .headers()
        .get(LOCALAPI_HEADER)
        .and_then(|value| value.to_str().ok())
        == Some(LOCALAPI_HEADER_VALUE);
    if !present {
        return (
            StatusCode::FORBIDDEN,
            format!("missing required header {LOCALAPI_HEADER}: {LOCALAPI_HEADER_VALUE}\n"),
        )
            .into_response();
    }
    next.run(request).await
}
