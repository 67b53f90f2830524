// =============================================================================
// Sentiment sources — text streams pulled over HTTP
// =============================================================================
//
// Three source kinds (forum, news feed, social) behind one enum. Each fetch
// returns plain text snippets; transport failures degrade to an empty batch
// so one dead source never poisons the aggregate.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// One configured text stream.
#[derive(Debug, Clone)]
pub enum FeedSource {
    /// Forum JSON listing (posts under data.children[].data.title/selftext).
    Forum { name: String, url: String },
    /// News headline feed (array of objects with a `title` field).
    News { name: String, url: String },
    /// Social firehose sample (array of objects with a `text` field).
    Social { name: String, url: String },
}

impl FeedSource {
    pub fn name(&self) -> &str {
        match self {
            Self::Forum { name, .. } | Self::News { name, .. } | Self::Social { name, .. } => name,
        }
    }

    /// Weight-lookup key for the configured `source_weights` map.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Forum { .. } => "forum",
            Self::News { .. } => "news",
            Self::Social { .. } => "social",
        }
    }

    /// Pull the latest batch of texts. A failed fetch returns an empty batch
    /// after logging; the aggregator simply sees zero samples.
    pub async fn fetch(&self, client: &reqwest::Client) -> Vec<String> {
        match self.try_fetch(client).await {
            Ok(texts) => {
                debug!(source = self.name(), count = texts.len(), "sentiment texts fetched");
                texts
            }
            Err(e) => {
                warn!(source = self.name(), error = %e, "sentiment source fetch failed");
                Vec::new()
            }
        }
    }

    async fn try_fetch(&self, client: &reqwest::Client) -> Result<Vec<String>> {
        let url = match self {
            Self::Forum { url, .. } | Self::News { url, .. } | Self::Social { url, .. } => url,
        };

        let body: serde_json::Value = client
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?
            .json()
            .await
            .context("response body is not JSON")?;

        Ok(self.extract_texts(&body))
    }

    /// Pull text snippets out of the source-specific JSON shape.
    pub fn extract_texts(&self, body: &serde_json::Value) -> Vec<String> {
        let mut texts = Vec::new();
        match self {
            Self::Forum { .. } => {
                if let Some(children) = body["data"]["children"].as_array() {
                    for child in children {
                        let data = &child["data"];
                        let title = data["title"].as_str().unwrap_or_default();
                        let selftext = data["selftext"].as_str().unwrap_or_default();
                        let combined = format!("{title} {selftext}").trim().to_string();
                        if !combined.is_empty() {
                            texts.push(combined);
                        }
                    }
                }
            }
            Self::News { .. } => {
                if let Some(items) = body.as_array() {
                    for item in items {
                        if let Some(title) = item["title"].as_str() {
                            texts.push(title.to_string());
                        }
                    }
                }
            }
            Self::Social { .. } => {
                if let Some(items) = body.as_array() {
                    for item in items {
                        if let Some(text) = item["text"].as_str() {
                            texts.push(text.to_string());
                        }
                    }
                }
            }
        }
        texts
    }
}

/// The default source set used when none are configured explicitly.
pub fn default_sources() -> Vec<FeedSource> {
    vec![
        FeedSource::Forum {
            name: "cryptoforum".to_string(),
            url: "https://www.reddit.com/r/CryptoCurrency/hot.json?limit=25".to_string(),
        },
        FeedSource::News {
            name: "newswire".to_string(),
            url: "https://api.coingecko.com/api/v3/news".to_string(),
        },
    ]
}
