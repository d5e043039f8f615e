//! Explicit construction and lifecycle of every long-lived component.
//!
//! Nothing here is a global: `main` builds one `Supervisor`, passes clones of
//! the handles where they are needed, and owns start/stop ordering.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::core::activation::ActivationMonitor;
use crate::core::activity::ActivityMonitor;
use crate::core::analytics::AnalyticsEngine;
use crate::core::config::ConfigHandle;
use crate::core::heartbeat::HeartbeatManager;
use crate::core::orchestrator::Orchestrator;
use crate::core::resources::{ConcurrencyController, ResourceMonitor};
use crate::core::scheduler::HeartbeatScheduler;
use crate::core::store::Store;

#[derive(Clone)]
pub struct Supervisor {
    pub config: ConfigHandle,
    pub store: Store,
    pub resources: Arc<ResourceMonitor>,
    pub concurrency: Arc<ConcurrencyController>,
    pub heartbeats: Arc<HeartbeatManager>,
    pub scheduler: HeartbeatScheduler,
    pub activation: Arc<ActivationMonitor>,
    pub activity: Arc<ActivityMonitor>,
    pub analytics: AnalyticsEngine,
    pub orchestrator: Orchestrator,
    pub agents_dir: PathBuf,
}

impl Supervisor {
    /// Wire everything up under `home`: `config.yaml`, `data/mcn.db` and
    /// `agents/` all live there.
    pub async fn build(home: &Path) -> Result<Self> {
        let config = ConfigHandle::load(home.join("config.yaml"))?;
        Self::build_with_config(home, config).await
    }

    pub async fn build_with_config(home: &Path, config: ConfigHandle) -> Result<Self> {
        let store = Store::open(home.join("data").join("mcn.db")).await?;
        let agents_dir = home.join("agents");
        tokio::fs::create_dir_all(&agents_dir).await?;

        let resources = Arc::new(ResourceMonitor::new(config.clone()));
        let concurrency = Arc::new(ConcurrencyController::default());
        let heartbeats = Arc::new(HeartbeatManager::new(
            config.clone(),
            store.clone(),
            agents_dir.clone(),
        ));
        let scheduler = HeartbeatScheduler::new(
            config.clone(),
            store.clone(),
            resources.clone(),
            heartbeats.clone(),
            agents_dir.clone(),
        )
        .await?;
        let activation = ActivationMonitor::new(
            config.clone(),
            store.clone(),
            scheduler.clone(),
            agents_dir.clone(),
        );
        let orchestrator = Orchestrator::new(config.clone(), store.clone(), agents_dir.clone());
        let activity = ActivityMonitor::new(
            config.clone(),
            store.clone(),
            orchestrator.clone(),
            agents_dir.clone(),
        );
        let analytics = AnalyticsEngine::new(store.clone());

        Ok(Self {
            config,
            store,
            resources,
            concurrency,
            heartbeats,
            scheduler,
            activation,
            activity,
            analytics,
            orchestrator,
            agents_dir,
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await?;
        self.activation.clone().start().await;
        self.activity.clone().start().await;
        info!("Supervisor running");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.activity.stop().await;
        self.activation.stop().await;
        self.scheduler.stop().await?;
        info!("Supervisor stopped");
        Ok(())
    }
}
