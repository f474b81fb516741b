//! Best-effort sentiment annotation via the external AI collaborator.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use parlor_types::models::Sentiment;

/// Annotation must never hold up message persistence; anything slower than
/// this is treated as a miss and defaults to neutral.
const ANALYZE_TIMEOUT: Duration = Duration::from_millis(800);

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnalyzeResponse {
    sentiment: Option<String>,
}

/// Client for the sentiment endpoint of the AI service. Constructed without
/// a base URL it annotates everything neutral, which is also the behavior
/// on any timeout or error.
#[derive(Clone)]
pub struct SentimentClient {
    inner: Option<Arc<Inner>>,
}

struct Inner {
    http: reqwest::Client,
    base_url: String,
}

impl SentimentClient {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            inner: base_url.map(|base_url| {
                Arc::new(Inner {
                    http: reqwest::Client::new(),
                    base_url,
                })
            }),
        }
    }

    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Tag `text`; infallible by contract, neutral on any failure.
    pub async fn analyze(&self, text: &str) -> Sentiment {
        let Some(inner) = &self.inner else {
            return Sentiment::Neutral;
        };

        let response = inner
            .http
            .post(format!("{}/analyze-sentiment", inner.base_url))
            .timeout(ANALYZE_TIMEOUT)
            .json(&AnalyzeRequest { text })
            .send()
            .await;

        match response {
            Ok(resp) => match resp.json::<AnalyzeResponse>().await {
                Ok(body) => Sentiment::parse(body.sentiment.as_deref().unwrap_or("neutral")),
                Err(err) => {
                    debug!("sentiment response unreadable: {err}");
                    Sentiment::Neutral
                }
            },
            Err(err) => {
                debug!("sentiment request failed: {err}");
                Sentiment::Neutral
            }
        }
    }
}
