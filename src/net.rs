use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::warn;

use crate::digest::DIGEST_HEADER;

pub const USER_AGENT_VALUE: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    " (reqwest/0.12)"
);
pub const API_VERSION: &str = "1.0";

pub fn build_client(insecure_tls: bool) -> reqwest::Result<Client> {
    let mut builder = Client::builder();
    if insecure_tls {
        warn!("TLS certificate and hostname verification disabled for middleware");
        builder = builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    builder.build()
}

/// POSTs a signed JSON body and returns the status with the raw response text.
///
/// Headers are assembled per call, so a new digest never sits next to a stale one.
pub async fn post_signed(
    client: &Client,
    url: &str,
    body: String,
    digest: &str,
) -> reqwest::Result<(StatusCode, String)> {
    let response = client
        .post(url)
        .header(CONTENT_TYPE, "application/json")
        .header(USER_AGENT, USER_AGENT_VALUE)
        .header("X-Version", API_VERSION)
        .header(DIGEST_HEADER, digest)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    let text = response.text().await?;
    Ok((status, text))
}

/// Extracts a readable message from a middleware error body.
///
/// Never fails: an unparsable body yields the parser's own message.
pub fn parse_exception(body: &str) -> String {
    let json: Value = match serde_json::from_str(body) {
        Ok(json) => json,
        Err(e) => return e.to_string(),
    };

    if let Some(exception) = json.get("exception").filter(|v| !v.is_null()) {
        format!(
            "{}: {}",
            text_of(exception.get("type")),
            text_of(exception.get("message"))
        )
    } else if let Some(response) = json.get("response").filter(|v| !v.is_null()) {
        format!("Server-Error: {}", text_of(Some(response)))
    } else {
        "missing exception".to_string()
    }
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
