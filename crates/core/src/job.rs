//! Background provisioning and teardown jobs.
//!
//! Callers get control back as soon as the cluster row is written; progress is
//! observed through the store. Each cluster has at most one provisioning job,
//! tracked here with its cancellation token and result channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span};

use crate::compute::RequestContext;
use crate::error::{HcpError, Result};
use crate::model::{Cluster, ClusterRequest, ClusterStatus, ClusterView};
use crate::orchestrator::{JobOutcome, Orchestrator};
use crate::state::ClusterStore;

/// Cooperative cancellation signal shared between a job and whoever may
/// want to stop it.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        CancelToken {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                // Every token is gone, nobody can cancel any more.
                std::future::pending::<()>().await;
            }
        }
    }
}

type OutcomeReceiver = watch::Receiver<Option<Arc<JobOutcome>>>;

struct JobRecord {
    cancel: CancelToken,
    outcome: OutcomeReceiver,
}

impl JobRecord {
    fn is_running(&self) -> bool {
        self.outcome.borrow().is_none()
    }
}

pub struct JobManager {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn ClusterStore>,
    jobs: Arc<Mutex<HashMap<String, JobRecord>>>,
}

impl JobManager {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let store = orchestrator.store();
        JobManager {
            orchestrator,
            store,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Writes a `Starting` cluster and hands it to a background provisioning
    /// job. Returns the cluster as it looks right after the hand-off.
    pub async fn create_cluster(
        &self,
        ctx: RequestContext,
        request: ClusterRequest,
    ) -> Result<ClusterView> {
        request.validate()?;
        for template in request.node_counts.keys() {
            self.store.find_node_template(template).await?;
        }

        let cluster = Cluster::from_request(request);
        let cluster_id = cluster.id.clone();
        self.store.create_cluster(cluster).await?;
        info!(cluster_id = %cluster_id, "cluster registered");

        self.start_provisioning(ctx, &cluster_id).await?;
        self.store.cluster_view(&cluster_id).await
    }

    /// Fails with [`HcpError::JobInProgress`] while an earlier job for the
    /// same cluster is still running.
    pub async fn start_provisioning(&self, ctx: RequestContext, cluster_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if jobs.get(cluster_id).is_some_and(JobRecord::is_running) {
            return Err(HcpError::JobInProgress(cluster_id.to_string()));
        }

        let cancel = CancelToken::new();
        let (tx, outcome) = watch::channel(None);

        let orchestrator = self.orchestrator.clone();
        let store = self.store.clone();
        let id = cluster_id.to_string();
        let token = cancel.clone();
        let span = info_span!("provision", cluster_id = %id);

        tokio::spawn(async move {
            let job_id = id.clone();
            let job = tokio::spawn(
                async move { orchestrator.provision(&ctx, &job_id, &token).await }.instrument(span),
            );

            let outcome = match job.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let err = HcpError::Provisioning(format!("provisioning job aborted: {}", e));
                    error!(cluster_id = %id, error = %err, "provisioning job died");
                    let _ = store
                        .compare_and_set_status(
                            &id,
                            ClusterStatus::Starting,
                            ClusterStatus::Error,
                            Some(err.to_string()),
                        )
                        .await;
                    JobOutcome {
                        cluster_id: id,
                        result: Err(err),
                        launched_instances: Vec::new(),
                    }
                }
            };
            let _ = tx.send(Some(Arc::new(outcome)));
        });

        jobs.insert(cluster_id.to_string(), JobRecord { cancel, outcome });
        Ok(())
    }

    /// Waits for the provisioning job of `cluster_id`, if there is one.
    pub async fn wait(&self, cluster_id: &str) -> Result<Option<Arc<JobOutcome>>> {
        let receiver = {
            let jobs = self.jobs.lock().await;
            match jobs.get(cluster_id) {
                Some(job) => job.outcome.clone(),
                None => return Ok(None),
            }
        };
        wait_for_outcome(receiver).await.map(Some)
    }

    /// Stops a provisioning job whose caller is going away: the cluster is
    /// marked `Error` and the job, seeing that at its next checkpoint,
    /// terminates the instances it has not registered. Returns whether the
    /// cluster was still `Starting`.
    pub async fn interrupt(&self, cluster_id: &str) -> Result<bool> {
        let interrupted = self
            .store
            .compare_and_set_status(
                cluster_id,
                ClusterStatus::Starting,
                ClusterStatus::Error,
                Some("provisioning interrupted".into()),
            )
            .await?;
        if interrupted {
            info!(cluster_id, "provisioning interrupted");
        }
        Ok(interrupted)
    }

    /// Cancels the cluster's provisioning job, marks it `Stopping` and tears
    /// it down in the background. The returned handle resolves when the
    /// cluster row is gone and the job record dropped.
    pub async fn delete_cluster(
        &self,
        ctx: RequestContext,
        cluster_id: &str,
    ) -> Result<JoinHandle<Result<()>>> {
        let mut cluster = self.store.get_cluster(cluster_id).await?;

        // Cancel before the status write so the job attributes its stop to
        // this teardown, which then owns the instances it launched.
        let running = {
            let jobs = self.jobs.lock().await;
            jobs.get(cluster_id)
                .map(|job| (job.cancel.clone(), job.outcome.clone()))
        };
        if let Some((cancel, _)) = &running {
            cancel.cancel();
        }

        cluster.set_status(ClusterStatus::Stopping, None);
        self.store.save_cluster(&cluster).await?;
        info!(cluster_id, "cluster stopping");

        let orchestrator = self.orchestrator.clone();
        let jobs = self.jobs.clone();
        let id = cluster_id.to_string();
        let span = info_span!("teardown", cluster_id = %id);
        Ok(tokio::spawn(
            async move {
                let mut launched = Vec::new();
                if let Some((_, receiver)) = running {
                    if let Ok(outcome) = wait_for_outcome(receiver).await {
                        launched = outcome.launched_instances.clone();
                    }
                }
                orchestrator.teardown(&ctx, &id, launched).await?;

                let mut jobs = jobs.lock().await;
                if jobs.get(&id).is_some_and(|job| !job.is_running()) {
                    jobs.remove(&id);
                }
                Ok(())
            }
            .instrument(span),
        ))
    }
}

async fn wait_for_outcome(mut receiver: OutcomeReceiver) -> Result<Arc<JobOutcome>> {
    let outcome = receiver
        .wait_for(Option::is_some)
        .await
        .map_err(|_| HcpError::Provisioning("provisioning job vanished".into()))?;
    outcome
        .as_ref()
        .cloned()
        .ok_or_else(|| HcpError::Provisioning("provisioning job vanished".into()))
}
