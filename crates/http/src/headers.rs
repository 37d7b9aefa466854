//! Header rewriting for upstream requests and proxied responses

use axum::http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING, AUTHORIZATION, CONNECTION,
    CONTENT_ENCODING, CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
};
use paf_core::{EndpointProfile, Family};
use url::Url;

const X_API_KEY: HeaderName = HeaderName::from_static("x-api-key");
const ANTHROPIC_VERSION: HeaderName = HeaderName::from_static("anthropic-version");
const OPENAI_ORGANIZATION: HeaderName = HeaderName::from_static("openai-organization");

/// Headers never copied from the inbound request
fn is_stripped_request_header(name: &HeaderName) -> bool {
    *name == HOST || *name == CONTENT_LENGTH || *name == AUTHORIZATION || *name == X_API_KEY
}

/// Build the header set for the upstream request
///
/// Starts from the inbound headers minus host/content-length/credentials,
/// points `host` at the upstream, injects the profile's credentials (falling
/// back to client credentials when the profile carries none), applies the
/// Anthropic-family adjustments, and drops `accept-encoding` so the upstream
/// answers uncompressed and the response can be streamed back verbatim.
pub fn build_upstream_headers(
    inbound: &HeaderMap,
    profile: &EndpointProfile,
    family: Family,
    target: &Url,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if !is_stripped_request_header(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    if let Some(host) = target.host_str() {
        let host_value = match target.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&host_value) {
            headers.insert(HOST, value);
        }
    }

    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

    // Credential injection: profile api_key wins, then profile auth_token,
    // then whatever the client sent.
    if let Some(key) = profile.api_key.as_deref() {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
            headers.insert(AUTHORIZATION, value);
        }
        if !headers.contains_key(&X_API_KEY) {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert(X_API_KEY.clone(), value);
            }
        }
    } else if let Some(token) = profile.auth_token.as_deref() {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
            headers.insert(AUTHORIZATION, value);
        }
    } else {
        if let Some(value) = inbound.get(AUTHORIZATION) {
            headers.insert(AUTHORIZATION, value.clone());
        }
        if let Some(value) = inbound.get(&X_API_KEY) {
            headers.insert(X_API_KEY.clone(), value.clone());
        }
    }

    // Client-supplied routing headers survive the credential rewrite.
    if !headers.contains_key(&X_API_KEY) {
        if let Some(value) = inbound.get(&X_API_KEY) {
            headers.insert(X_API_KEY.clone(), value.clone());
        }
    }
    if let Some(value) = inbound.get(&OPENAI_ORGANIZATION) {
        headers.insert(OPENAI_ORGANIZATION.clone(), value.clone());
    }

    if family == Family::Claude {
        if !headers.contains_key(&X_API_KEY) {
            if let Some(token) = bearer_token(&headers) {
                if let Ok(value) = HeaderValue::from_str(&token) {
                    headers.insert(X_API_KEY.clone(), value);
                }
            }
        }
        if !headers.contains_key(&ANTHROPIC_VERSION) {
            headers.insert(ANTHROPIC_VERSION.clone(), HeaderValue::from_static("2023-06-01"));
        }
    }

    headers.remove(ACCEPT_ENCODING);

    headers
}

/// Filter upstream response headers before returning them to the client
///
/// The upstream was asked not to compress, and the body length may change
/// while streaming, so the framing headers must not leak through.
pub fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.iter() {
        if *name == CONTENT_ENCODING
            || *name == CONTENT_LENGTH
            || *name == TRANSFER_ENCODING
            || *name == CONNECTION
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Token part of a `Bearer` authorization header, if any
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    (!token.is_empty()).then(|| token.to_string())
}
