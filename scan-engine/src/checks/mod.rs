//! Check registry.

pub mod cookies;
pub mod headers;
pub mod information;
pub mod sqli;
pub mod xss;

use crate::types::{CheckCategory, CheckTarget, ScanIssue, Severity};
use async_trait::async_trait;
use proxy_core::client::UpstreamClient;
use std::sync::Arc;
use uuid::Uuid;

/// One vulnerability check. Passive checks must not touch the client.
#[async_trait]
pub trait ScanCheck: Send + Sync {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn category(&self) -> CheckCategory;
    fn severity_hint(&self) -> Severity;

    async fn run(
        &self,
        scan_id: Uuid,
        target: &CheckTarget,
        client: &UpstreamClient,
    ) -> Vec<ScanIssue>;
}

/// Every built-in check, in a stable order.
pub fn all_checks() -> Vec<Arc<dyn ScanCheck>> {
    vec![
        Arc::new(headers::SecurityHeadersCheck),
        Arc::new(cookies::CookieFlagsCheck),
        Arc::new(information::InformationDisclosureCheck),
        Arc::new(xss::ReflectedXssCheck),
        Arc::new(sqli::SqlInjectionCheck),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn check_ids_are_unique() {
        let checks = all_checks();
        let ids: HashSet<&str> = checks.iter().map(|c| c.id()).collect();
        assert_eq!(ids.len(), checks.len());
    }

    #[test]
    fn registry_covers_both_categories() {
        let checks = all_checks();
        assert!(checks.iter().any(|c| c.category() == CheckCategory::Passive));
        assert!(checks.iter().any(|c| c.category() == CheckCategory::Active));
    }
}
