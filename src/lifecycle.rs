//! Deployment state mutator.
//!
//! Applies owner-gated `start`/`stop`/`restart` transitions over the
//! `pending → deploying → active ⇄ stopped` machine (`failed` is reachable
//! from `active`/`deploying` and re-enterable via `start`/`restart`). Every
//! transition hands the new status plus the latest metrics snapshot to the
//! [`StatusRelay`]. A failed mutation is surfaced immediately to the caller;
//! nothing is retried or queued.
//!
//! `restart` drives a polling [`ReadinessProbe`] in a background task rather
//! than a fixed settle delay: the deployment sits in `deploying` until the
//! probe reports ready (→ `active`) or attempts are exhausted (→ `failed`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::db::DbHandle;
use crate::errors::MarketError;
use crate::models::{Deployment, DeploymentStatus, DeploymentWithMetrics, User};
use crate::relay::{RelayMessage, StatusRelay};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeploymentAction {
    Start,
    Stop,
    Restart,
}

impl DeploymentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

/// Readiness check polled during `restart`. Implementations must not block;
/// one call is one probe attempt.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self, deployment: &Deployment) -> anyhow::Result<bool>;
}

/// Probes the deployment's webhook endpoint with a per-request timeout.
/// Deployments without a webhook URL are considered ready on the first poll.
pub struct WebhookProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl ReadinessProbe for WebhookProbe {
    async fn check(&self, deployment: &Deployment) -> anyhow::Result<bool> {
        let Some(url) = deployment.webhook_url.as_deref() else {
            return Ok(true);
        };
        let response = self.client.get(url).timeout(self.timeout).send().await?;
        Ok(response.status().is_success())
    }
}

/// Probe that reports ready immediately. Stand-in for deployments without a
/// health surface, and the default in tests.
#[derive(Default)]
pub struct AlwaysReady;

#[async_trait]
impl ReadinessProbe for AlwaysReady {
    async fn check(&self, _deployment: &Deployment) -> anyhow::Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_attempts: 10,
        }
    }
}

pub struct LifecycleManager {
    probe: Arc<dyn ReadinessProbe>,
    config: ProbeConfig,
}

impl LifecycleManager {
    pub fn new(probe: Arc<dyn ReadinessProbe>, config: ProbeConfig) -> Self {
        Self { probe, config }
    }

    /// Apply an owner action to a deployment and broadcast the transition.
    ///
    /// `start` moves any status to `active` (idempotent when already active).
    /// `stop` is only valid from `active` (idempotent when already stopped);
    /// both idempotent cases still re-broadcast. `restart` returns the
    /// `deploying` snapshot immediately and settles in the background.
    pub async fn apply(
        &self,
        db: &DbHandle,
        relay: &Arc<StatusRelay>,
        actor: &User,
        deployment_id: i64,
        action: DeploymentAction,
    ) -> Result<DeploymentWithMetrics, MarketError> {
        let deployment = db
            .call(move |db| {
                db.get_deployment(deployment_id)?.ok_or(MarketError::NotFound {
                    entity: "Deployment",
                    id: deployment_id,
                })
            })
            .await?;

        if deployment.owner_id != actor.id {
            return Err(MarketError::Forbidden(format!(
                "only the owner may {} deployment {}",
                action.as_str(),
                deployment_id
            )));
        }

        tracing::info!(
            deployment_id,
            action = action.as_str(),
            from = %deployment.status,
            "applying deployment action"
        );

        match action {
            DeploymentAction::Start => {
                transition(db, relay, deployment_id, DeploymentStatus::Active).await
            }
            DeploymentAction::Stop => {
                match deployment.status {
                    DeploymentStatus::Active | DeploymentStatus::Stopped => {
                        transition(db, relay, deployment_id, DeploymentStatus::Stopped).await
                    }
                    other => Err(MarketError::validation(
                        "action",
                        format!("cannot stop deployment in status '{}'", other),
                    )),
                }
            }
            DeploymentAction::Restart => {
                let view =
                    transition(db, relay, deployment_id, DeploymentStatus::Deploying).await?;
                self.spawn_settle(db.clone(), relay.clone(), view.deployment.clone());
                Ok(view)
            }
        }
    }

    /// Poll the readiness probe in the background until the deployment is
    /// ready (→ active) or attempts are exhausted (→ failed).
    fn spawn_settle(&self, db: DbHandle, relay: Arc<StatusRelay>, deployment: Deployment) {
        let probe = self.probe.clone();
        let config = self.config.clone();
        tokio::spawn(async move {
            let deployment_id = deployment.id;
            let mut ready = false;
            for attempt in 1..=config.max_attempts {
                match probe.check(&deployment).await {
                    Ok(true) => {
                        ready = true;
                        break;
                    }
                    Ok(false) => {
                        tracing::debug!(deployment_id, attempt, "deployment not ready yet");
                    }
                    Err(e) => {
                        tracing::warn!(deployment_id, attempt, error = %e, "readiness probe failed");
                    }
                }
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.interval).await;
                }
            }

            let status = if ready {
                DeploymentStatus::Active
            } else {
                DeploymentStatus::Failed
            };
            if let Err(e) = transition(&db, &relay, deployment_id, status).await {
                tracing::error!(deployment_id, error = %e, "failed to settle restart");
            }
        });
    }
}

/// Persist a status change and publish the new status with the latest
/// metrics snapshot.
async fn transition(
    db: &DbHandle,
    relay: &Arc<StatusRelay>,
    deployment_id: i64,
    status: DeploymentStatus,
) -> Result<DeploymentWithMetrics, MarketError> {
    let view = db
        .call(move |db| {
            db.update_deployment_status(deployment_id, &status)?;
            db.get_deployment_with_metrics(deployment_id)?
                .ok_or(MarketError::NotFound {
                    entity: "Deployment",
                    id: deployment_id,
                })
        })
        .await?;
    relay.publish(&RelayMessage::StatusChanged {
        deployment_id,
        status: view.deployment.status,
        metrics: view.metrics.clone(),
    });
    Ok(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MarketDb;
    use crate::models::{AccessLevel, SubscriptionTier};

    struct NeverReady;

    #[async_trait]
    impl ReadinessProbe for NeverReady {
        async fn check(&self, _deployment: &Deployment) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    fn fast_config() -> ProbeConfig {
        ProbeConfig {
            interval: Duration::from_millis(1),
            max_attempts: 2,
        }
    }

    async fn setup() -> (DbHandle, Arc<StatusRelay>, User, i64) {
        let db = DbHandle::new(MarketDb::new_in_memory().unwrap());
        let relay = Arc::new(StatusRelay::new());
        let (owner, deployment_id) = db
            .call(|db| {
                let owner = db.create_user("owner", &SubscriptionTier::Free)?;
                let created = db.create_deployment(
                    owner.id,
                    "agent",
                    "",
                    &AccessLevel::Public,
                    "webhook",
                    "1.0.0",
                    None,
                )?;
                Ok((owner, created.deployment.id))
            })
            .await
            .unwrap();
        (db, relay, owner, deployment_id)
    }

    fn manager(probe: Arc<dyn ReadinessProbe>) -> LifecycleManager {
        LifecycleManager::new(probe, fast_config())
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_broadcasts_each_time() {
        let (db, relay, owner, id) = setup().await;
        let lifecycle = manager(Arc::new(AlwaysReady));
        let mut rx = relay.subscribe(id);

        let first = lifecycle
            .apply(&db, &relay, &owner, id, DeploymentAction::Start)
            .await
            .unwrap();
        let second = lifecycle
            .apply(&db, &relay, &owner, id, DeploymentAction::Start)
            .await
            .unwrap();

        assert_eq!(first.deployment.status, DeploymentStatus::Active);
        assert_eq!(second.deployment.status, DeploymentStatus::Active);
        assert!(rx.recv().await.unwrap().contains("\"status\":\"active\""));
        assert!(rx.recv().await.unwrap().contains("\"status\":\"active\""));
    }

    #[tokio::test]
    async fn test_stop_from_active_then_idempotent_restop() {
        let (db, relay, owner, id) = setup().await;
        let lifecycle = manager(Arc::new(AlwaysReady));
        lifecycle
            .apply(&db, &relay, &owner, id, DeploymentAction::Start)
            .await
            .unwrap();

        let mut rx = relay.subscribe(id);
        let stopped = lifecycle
            .apply(&db, &relay, &owner, id, DeploymentAction::Stop)
            .await
            .unwrap();
        assert_eq!(stopped.deployment.status, DeploymentStatus::Stopped);

        // Stopping again is accepted and re-broadcasts `stopped`
        let restopped = lifecycle
            .apply(&db, &relay, &owner, id, DeploymentAction::Stop)
            .await
            .unwrap();
        assert_eq!(restopped.deployment.status, DeploymentStatus::Stopped);
        assert!(rx.recv().await.unwrap().contains("\"status\":\"stopped\""));
        assert!(rx.recv().await.unwrap().contains("\"status\":\"stopped\""));
    }

    #[tokio::test]
    async fn test_stop_from_pending_is_rejected() {
        let (db, relay, owner, id) = setup().await;
        let lifecycle = manager(Arc::new(AlwaysReady));

        let err = lifecycle
            .apply(&db, &relay, &owner, id, DeploymentAction::Stop)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_non_owner_is_forbidden() {
        let (db, relay, _owner, id) = setup().await;
        let stranger = db
            .call(|db| Ok(db.create_user("stranger", &SubscriptionTier::Premium)?))
            .await
            .unwrap();
        let lifecycle = manager(Arc::new(AlwaysReady));

        let err = lifecycle
            .apply(&db, &relay, &stranger, id, DeploymentAction::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_unknown_deployment_is_not_found() {
        let (db, relay, owner, _id) = setup().await;
        let lifecycle = manager(Arc::new(AlwaysReady));

        let err = lifecycle
            .apply(&db, &relay, &owner, 999, DeploymentAction::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_restart_settles_to_active_when_probe_ready() {
        let (db, relay, owner, id) = setup().await;
        let lifecycle = manager(Arc::new(AlwaysReady));
        let mut rx = relay.subscribe(id);

        let view = lifecycle
            .apply(&db, &relay, &owner, id, DeploymentAction::Restart)
            .await
            .unwrap();
        assert_eq!(view.deployment.status, DeploymentStatus::Deploying);

        assert!(rx.recv().await.unwrap().contains("\"status\":\"deploying\""));
        assert!(rx.recv().await.unwrap().contains("\"status\":\"active\""));

        let settled = db
            .call(move |db| Ok(db.get_deployment(id)?.unwrap()))
            .await
            .unwrap();
        assert_eq!(settled.status, DeploymentStatus::Active);
    }

    #[tokio::test]
    async fn test_restart_settles_to_failed_when_probe_exhausted() {
        let (db, relay, owner, id) = setup().await;
        let lifecycle = manager(Arc::new(NeverReady));
        let mut rx = relay.subscribe(id);

        lifecycle
            .apply(&db, &relay, &owner, id, DeploymentAction::Restart)
            .await
            .unwrap();

        assert!(rx.recv().await.unwrap().contains("\"status\":\"deploying\""));
        assert!(rx.recv().await.unwrap().contains("\"status\":\"failed\""));
    }

    #[tokio::test]
    async fn test_start_recovers_failed_deployment() {
        let (db, relay, owner, id) = setup().await;
        let lifecycle = manager(Arc::new(AlwaysReady));
        db.call(move |db| {
            db.update_deployment_status(id, &DeploymentStatus::Failed)?;
            Ok(())
        })
        .await
        .unwrap();

        let view = lifecycle
            .apply(&db, &relay, &owner, id, DeploymentAction::Start)
            .await
            .unwrap();
        assert_eq!(view.deployment.status, DeploymentStatus::Active);
    }
}
