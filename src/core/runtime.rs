//! Runtime orchestration.
//!
//! Builds the coordinator client, the member pool, the watch hub and its
//! per-member feeds from configuration, then serves the proxy until
//! interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::clock::MetaClock;
use crate::core::config::Config;
use crate::membership::client::{KvApi, LeaseApi, WatchApi};
use crate::membership::coordinator::CoordinatorClient;
use crate::membership::grpc::GrpcMember;
use crate::membership::pool::{KeySelector, Member, Pool};
use crate::ops::observability::Metrics;
use crate::proxy::{grpc, ProxyServer};
use crate::watchmux::{MemberFeed, WatchHub};

/// Main runtime.
pub struct Runtime {
    config: Config,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run until ctrl-c.
    pub async fn run(&mut self) -> Result<()> {
        let metrics = Metrics::new();

        let coordinator_conn = GrpcMember::connect(
            "coordinator",
            &self.config.coordinator.endpoint,
            None,
        )
        .context("connecting coordinator")?;
        let coordinator = CoordinatorClient::new(
            coordinator_conn.clone() as Arc<dyn KvApi>,
            coordinator_conn.clone() as Arc<dyn LeaseApi>,
        );

        let hub = WatchHub::new(self.config.telemetry.watch_retention);

        let mut members = Vec::new();
        let mut feeds: Vec<(String, Arc<dyn WatchApi>, Arc<dyn KvApi>)> = Vec::new();
        for member_cfg in &self.config.members {
            let conn = GrpcMember::connect(&member_cfg.name, &member_cfg.endpoint, None)
                .with_context(|| format!("connecting member {}", member_cfg.name))?;
            let client = conn.client_set();
            feeds.push((
                member_cfg.name.clone(),
                client.watch.clone(),
                client.kv.clone(),
            ));
            members.push(Member {
                name: member_cfg.name.clone(),
                selector: KeySelector::new(
                    member_cfg
                        .prefixes
                        .iter()
                        .map(|p| p.as_bytes().to_vec())
                        .collect(),
                ),
                client,
            });
        }

        let pool = Arc::new(Pool::new(members, hub.clone()));
        for (name, watch, kv) in feeds {
            tokio::spawn(MemberFeed::new(name, hub.clone()).run(watch, kv));
        }

        let clock = MetaClock::new(coordinator, pool.clone());
        let proxy = Arc::new(ProxyServer::new(clock, pool, metrics));

        grpc::serve(proxy, &self.config.listener, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
    }
}
