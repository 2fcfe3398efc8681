//! Application context: the one long-lived object the web facade holds.

use crate::config::Config;
use crate::database::Database;
use attack_engine::AttackRunner;
use flow_engine::Recorder;
use proxy_common::EventBus;
use proxy_core::{
    CertificateAuthority, InterceptCoordinator, ProxyEngine, RuleEngine, UpstreamClient,
};
use scan_engine::ScanRunner;
use spider_engine::SpiderRunner;
use std::sync::Arc;
use tracing::info;

pub struct AppContext {
    pub config: Config,
    pub db: Arc<Database>,
    pub bus: EventBus,
    pub ca: Arc<CertificateAuthority>,
    pub rules: Arc<RuleEngine>,
    pub coordinator: Arc<InterceptCoordinator>,
    pub proxy: Arc<ProxyEngine>,
    pub intruder: Arc<AttackRunner>,
    pub spider: Arc<SpiderRunner>,
    pub scanner: Arc<ScanRunner>,
    pub client: UpstreamClient,
}

impl AppContext {
    /// Wire every component together. Called once at startup.
    pub async fn init(config: Config) -> Result<Arc<Self>, Box<dyn std::error::Error>> {
        let db = Arc::new(Database::connect(&config.database_url).await?);
        let bus = EventBus::default();

        let ca = Arc::new(CertificateAuthority::new(
            &config.cert_dir,
            config.leaf_cert_ttl_days,
        )?);
        let rules = Arc::new(RuleEngine::new());
        rules.load(db.list_rules().await?);

        let coordinator = Arc::new(InterceptCoordinator::new(bus.clone()));
        let recorder = Arc::new(Recorder::new(db.clone(), bus.clone()));
        let proxy = Arc::new(ProxyEngine::new(
            config.proxy_config(),
            ca.clone(),
            rules.clone(),
            coordinator.clone(),
            recorder,
            bus.clone(),
        )?);

        let client = proxy.upstream_client();
        let intruder = Arc::new(AttackRunner::new(client.clone(), db.clone(), bus.clone()));
        let spider = Arc::new(SpiderRunner::new(client.clone(), db.clone(), bus.clone()));
        let scanner = Arc::new(ScanRunner::new(client.clone(), db.clone(), bus.clone()));

        info!("application context initialized");
        Ok(Arc::new(Self {
            config,
            db,
            bus,
            ca,
            rules,
            coordinator,
            proxy,
            intruder,
            spider,
            scanner,
            client,
        }))
    }

    /// Re-publish the rule snapshot after any rule mutation.
    pub async fn reload_rules(&self) -> Result<(), flow_engine::StoreError> {
        let rules = self.db.list_rules().await?;
        self.rules.load(rules);
        Ok(())
    }
}
