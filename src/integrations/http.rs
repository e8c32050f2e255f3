//! Shared HTTP plumbing for REST integrations.
//!
//! One fetch path with exponential backoff on rate limiting (2s, 4s, 8s),
//! mapping of transport conditions to [`SourceError`] values, and a JSON
//! decode step that reports upstream garbage as `UpstreamMalformed`.

use reqwest::{RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use super::types::SourceError;

/// Backoff schedule applied between rate-limited attempts, in seconds.
pub const BACKOFF_SECS: [u64; 3] = [2, 4, 8];

/// Execute a request, decode JSON, and back off on HTTP 429.
///
/// After the backoff schedule is exhausted the call returns
/// `RateLimited` rather than blocking further; callers surface that as a
/// degraded result, never as a hang.
pub async fn fetch_json(source_id: &str, builder: RequestBuilder) -> Result<Value, SourceError> {
    for (attempt, delay_secs) in BACKOFF_SECS
        .iter()
        .map(|&s| Some(s))
        .chain(std::iter::once(None))
        .enumerate()
    {
        let request = builder
            .try_clone()
            .ok_or_else(|| SourceError::transport("request body is not cloneable"))?;

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Err(SourceError::timeout(format!("{source_id}: {err}")))
            }
            Err(err) => return Err(SourceError::transport(format!("{source_id}: {err}"))),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            match delay_secs {
                Some(secs) => {
                    warn!(source_id, attempt, delay_secs = secs, "rate limited, backing off");
                    sleep(Duration::from_secs(secs)).await;
                    continue;
                }
                None => {
                    return Err(SourceError::rate_limited(format!(
                        "{source_id}: still rate limited after {} attempts",
                        BACKOFF_SECS.len() + 1
                    )))
                }
            }
        }

        let body = response
            .text()
            .await
            .map_err(|err| SourceError::transport(format!("{source_id}: {err}")))?;

        if !status.is_success() {
            return Err(SourceError::transport(format!(
                "{source_id}: HTTP {status}: {}",
                truncate(&body, 300)
            )));
        }

        return serde_json::from_str(&body).map_err(|err| {
            SourceError::malformed(format!("{source_id}: undecodable JSON: {err}"))
        });
    }
    unreachable!("backoff loop always returns")
}

/// Whether an upstream reply looks like a refusal of a composite boolean
/// query: a 4xx rejection mentioning the query, or an explicit error body.
pub fn looks_like_boolean_refusal(error: &SourceError) -> bool {
    let message = error.message.to_lowercase();
    message.contains("http 400") || message.contains("invalid query") || message.contains("syntax")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(BACKOFF_SECS, [2, 4, 8]);
    }

    #[test]
    fn test_boolean_refusal_detection() {
        assert!(looks_like_boolean_refusal(&SourceError::transport(
            "media: HTTP 400 Bad Request: too many phrases"
        )));
        assert!(looks_like_boolean_refusal(&SourceError::transport(
            "jobs: invalid query syntax"
        )));
        assert!(!looks_like_boolean_refusal(&SourceError::transport(
            "media: HTTP 500: upstream exploded"
        )));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("ok", 300), "ok");
    }
}
