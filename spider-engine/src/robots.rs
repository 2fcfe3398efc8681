//! robots.txt fetching and evaluation.
//!
//! Fetched once per host and cached for the session. Fetch failures and
//! non-200 responses allow everything, matching crawler convention.

use dashmap::DashMap;
use proxy_core::client::{UpstreamClient, UpstreamOptions};
use proxy_common::Headers;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

const ROBOTS_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed rules for one host.
#[derive(Debug, Default)]
pub struct RobotsRules {
    /// (allow, path-prefix) pairs for the matched user-agent group.
    rules: Vec<(bool, String)>,
}

impl RobotsRules {
    /// Longest matching prefix wins; allow on no match.
    pub fn allows(&self, path: &str) -> bool {
        let mut best: Option<(usize, bool)> = None;
        for (allow, prefix) in &self.rules {
            if prefix.is_empty() {
                continue;
            }
            if path.starts_with(prefix.as_str()) {
                let len = prefix.len();
                if best.map_or(true, |(best_len, _)| len > best_len) {
                    best = Some((len, *allow));
                }
            }
        }
        best.map_or(true, |(_, allow)| allow)
    }

    /// Parse the groups that apply to `user_agent` (or `*`).
    pub fn parse(text: &str, user_agent: &str) -> Self {
        let ua = user_agent.to_ascii_lowercase();
        let mut rules = Vec::new();
        let mut group_applies = false;
        let mut in_group_header = false;

        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    let agent = value.to_ascii_lowercase();
                    let applies = agent == "*" || ua.contains(&agent);
                    if in_group_header {
                        group_applies = group_applies || applies;
                    } else {
                        group_applies = applies;
                    }
                    in_group_header = true;
                }
                "disallow" => {
                    in_group_header = false;
                    if group_applies && !value.is_empty() {
                        rules.push((false, value.to_string()));
                    }
                }
                "allow" => {
                    in_group_header = false;
                    if group_applies && !value.is_empty() {
                        rules.push((true, value.to_string()));
                    }
                }
                _ => {
                    in_group_header = false;
                }
            }
        }

        Self { rules }
    }
}

/// Per-host robots cache shared by the crawl workers.
pub struct RobotsCache {
    client: UpstreamClient,
    user_agent: String,
    cache: DashMap<String, Arc<RobotsRules>>,
}

impl RobotsCache {
    pub fn new(client: UpstreamClient, user_agent: impl Into<String>) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
            cache: DashMap::new(),
        }
    }

    /// Robots verdict for a URL. The host's robots.txt is fetched at most
    /// once.
    pub async fn allows(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return true;
        };
        let origin = format!("{}://{}", url.scheme(), host);

        let rules = if let Some(rules) = self.cache.get(&origin) {
            rules.clone()
        } else {
            let fetched = Arc::new(self.fetch(&origin).await);
            self.cache.insert(origin.clone(), fetched.clone());
            fetched
        };

        rules.allows(url.path())
    }

    async fn fetch(&self, origin: &str) -> RobotsRules {
        let robots_url = format!("{}/robots.txt", origin);
        let options = UpstreamOptions {
            timeout: ROBOTS_TIMEOUT,
            follow_redirects: true,
        };
        let mut headers = Headers::new();
        headers.push("User-Agent", self.user_agent.clone());

        match self
            .client
            .send("GET", &robots_url, &headers, Vec::new(), &options)
            .await
        {
            Ok(response) if response.status().as_u16() == 200 => {
                match response.text().await {
                    Ok(text) => RobotsRules::parse(&text, &self.user_agent),
                    Err(_) => RobotsRules::default(),
                }
            }
            Ok(response) => {
                debug!(origin, status = response.status().as_u16(), "no usable robots.txt");
                RobotsRules::default()
            }
            Err(e) => {
                debug!(origin, error = %e, "robots.txt fetch failed, allowing");
                RobotsRules::default()
            }
        }
    }
}
