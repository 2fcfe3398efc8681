//! Crawl scope filtering.

use crate::error::{SpiderError, SpiderResult};
use crate::session::SpiderSession;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use url::Url;

/// Why a URL was kept out of the crawl.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    TooDeep,
    ExternalHost,
    NotIncluded,
    Excluded,
    RobotsDisallowed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::TooDeep => "beyond max depth",
            SkipReason::ExternalHost => "external host",
            SkipReason::NotIncluded => "no include pattern matched",
            SkipReason::Excluded => "matched exclude pattern",
            SkipReason::RobotsDisallowed => "blocked by robots.txt",
        }
    }
}

/// Compiled admission filter. robots.txt is consulted separately since
/// it requires a fetch.
pub struct ScopeFilter {
    seed_hosts: HashSet<String>,
    follow_external_links: bool,
    max_depth: u32,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl ScopeFilter {
    pub fn compile(session: &SpiderSession) -> SpiderResult<Self> {
        let mut seed_hosts = HashSet::new();
        for seed in &session.start_urls {
            let parsed = Url::parse(seed).map_err(|e| SpiderError::InvalidSeed {
                url: seed.clone(),
                reason: e.to_string(),
            })?;
            let host = parsed
                .host_str()
                .ok_or_else(|| SpiderError::InvalidSeed {
                    url: seed.clone(),
                    reason: "no host".to_string(),
                })?;
            seed_hosts.insert(host.to_ascii_lowercase());
        }

        let compile = |patterns: &[String]| -> SpiderResult<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| SpiderError::InvalidConfig {
                        reason: format!("invalid pattern {:?}: {}", p, e),
                    })
                })
                .collect()
        };

        Ok(Self {
            seed_hosts,
            follow_external_links: session.follow_external_links,
            max_depth: session.max_depth,
            include: compile(&session.include_patterns)?,
            exclude: compile(&session.exclude_patterns)?,
        })
    }

    /// Admit a URL at a depth, or say why not. Robots verdicts are
    /// layered on by the caller.
    pub fn admit(&self, url: &Url, depth: u32) -> Result<(), SkipReason> {
        if depth > self.max_depth {
            return Err(SkipReason::TooDeep);
        }

        let host = url.host_str().unwrap_or("").to_ascii_lowercase();
        if !self.follow_external_links && !self.seed_hosts.contains(&host) {
            return Err(SkipReason::ExternalHost);
        }

        let text = url.as_str();
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(text)) {
            return Err(SkipReason::NotIncluded);
        }
        if self.exclude.iter().any(|re| re.is_match(text)) {
            return Err(SkipReason::Excluded);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SpiderSession {
        SpiderSession::new("t", vec!["http://s.test/".to_string()])
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn depth_cap_applies() {
        let mut s = session();
        s.max_depth = 1;
        let filter = ScopeFilter::compile(&s).unwrap();
        assert!(filter.admit(&url("http://s.test/x"), 1).is_ok());
        assert_eq!(
            filter.admit(&url("http://s.test/x"), 2),
            Err(SkipReason::TooDeep)
        );
    }

    #[test]
    fn external_hosts_skipped_unless_allowed() {
        let mut s = session();
        let filter = ScopeFilter::compile(&s).unwrap();
        assert_eq!(
            filter.admit(&url("http://other.test/z"), 0),
            Err(SkipReason::ExternalHost)
        );

        s.follow_external_links = true;
        let filter = ScopeFilter::compile(&s).unwrap();
        assert!(filter.admit(&url("http://other.test/z"), 0).is_ok());
    }

    #[test]
    fn empty_include_list_allows_all() {
        let filter = ScopeFilter::compile(&session()).unwrap();
        assert!(filter.admit(&url("http://s.test/anything"), 0).is_ok());
    }

    #[test]
    fn include_and_exclude_patterns() {
        let mut s = session();
        s.include_patterns = vec!["/app/".to_string()];
        s.exclude_patterns = vec![r"\.pdf$".to_string()];
        let filter = ScopeFilter::compile(&s).unwrap();

        assert!(filter.admit(&url("http://s.test/app/page"), 0).is_ok());
        assert_eq!(
            filter.admit(&url("http://s.test/other"), 0),
            Err(SkipReason::NotIncluded)
        );
        assert_eq!(
            filter.admit(&url("http://s.test/app/doc.pdf"), 0),
            Err(SkipReason::Excluded)
        );
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let mut s = session();
        s.include_patterns = vec!["([bad".to_string()];
        assert!(matches!(
            ScopeFilter::compile(&s),
            Err(SpiderError::InvalidConfig { .. })
        ));
    }
}
