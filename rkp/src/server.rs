use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::api::{EventSource, ObjectStore};
use crate::controller::Controller;
use crate::leader::{LeaderElector, LeaderGate};
use crate::protocol::config::Config;
use crate::volume::{NfsStrategy, StrategyRegistry};

/// Wires the provisioner together on top of `store` and runs it until
/// `shutdown` fires.
pub async fn serve(
    cfg: Config,
    store: Arc<dyn ObjectStore>,
    shutdown: CancellationToken,
) -> Result<()> {
    let source = EventSource::new(store);

    let mut strategies = StrategyRegistry::new();
    strategies.register(Arc::new(NfsStrategy::new(
        cfg.provisioner.clone(),
        cfg.nfs.server.clone(),
        cfg.nfs.server_path.clone(),
        cfg.nfs.mount_path.clone(),
    )));

    let (gate, elector) = if cfg.leader_election.enabled {
        let elector = LeaderElector::new(cfg.leader_election.to_leader_config(), source.clone())
            .context("invalid leader election settings")?;
        info!("Leader election enabled as {}", elector.identity());
        let gate = elector.gate();
        (gate, Some(tokio::spawn(elector.run(shutdown.clone()))))
    } else {
        info!("Leader election disabled, acting as the only provisioner");
        (LeaderGate::always_held(&shutdown), None)
    };

    let controller = Arc::new(Controller::new(
        source,
        gate,
        strategies,
        cfg.controller.to_controller_config(),
    ));
    controller.run(shutdown).await;

    if let Some(elector) = elector {
        elector.await.context("leader elector task failed")?;
    }
    info!("Provisioner stopped");
    Ok(())
}
