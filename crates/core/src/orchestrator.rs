//! Cluster provisioning state machine.
//!
//! A provisioning job walks a `Starting` cluster through plan, launch,
//! readiness, topology, render, configuration push, registration and service
//! start, then marks it `Active`. Any failure is written back to the cluster
//! as `Error` with a description; a `Stopping` cluster preempts the job at the
//! next checkpoint without further writes.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};

use crate::compute::{ComputeGateway, InstanceRequest, RequestContext};
use crate::error::{HcpError, Result};
use crate::job::CancelToken;
use crate::model::{Cluster, ClusterStatus, Node, NodeRole};
use crate::plan::{LaunchedNode, PlanEntry, PlannedNode, Topology, build_plan, check_master_count};
use crate::poller::{PendingNode, PollPolicy, ReadinessPoller};
use crate::remote::RemoteExecutor;
use crate::render::{GENERAL_TEMPLATE, MASTER_TEMPLATE, TemplateRenderer, hadoop_bindings};
use crate::state::ClusterStore;

pub const JOBTRACKER_SERVICE: &str = "jobtracker";
pub const NAMENODE_SERVICE: &str = "namenode";
pub const JOBTRACKER_UI_PORT: u16 = 50030;
pub const NAMENODE_UI_PORT: u16 = 50070;

const SETUP_SCRIPT: &str = "hcp-setup.sh";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub poll: PollPolicy,
    /// Trivial command whose success marks a VM ready.
    pub probe_command: String,
    /// Run on the master once every node is configured.
    pub start_command: String,
    /// Remote directory the setup scripts are uploaded to.
    pub script_dir: String,
    /// Terminate VMs a failed job launched instead of registering them for
    /// manual reconciliation.
    pub terminate_on_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            poll: PollPolicy::default(),
            probe_command: "ls -l /".to_string(),
            start_command: "/usr/lib/hadoop/bin/start-all.sh".to_string(),
            script_dir: "/tmp".to_string(),
            terminate_on_failure: false,
        }
    }
}

/// What a finished provisioning job reports through its result channel.
#[derive(Debug)]
pub struct JobOutcome {
    pub cluster_id: String,
    pub result: Result<()>,
    /// Every instance the job launched, registered or not.
    pub launched_instances: Vec<String>,
}

#[derive(Default)]
struct JobState {
    launched: Vec<LaunchedNode>,
    registered: HashSet<String>,
}

impl JobState {
    fn unregistered(&self) -> impl Iterator<Item = &LaunchedNode> {
        self.launched
            .iter()
            .filter(|n| !self.registered.contains(&n.instance_id))
    }
}

pub struct Orchestrator {
    store: Arc<dyn ClusterStore>,
    compute: Arc<dyn ComputeGateway>,
    executor: Arc<dyn RemoteExecutor>,
    renderer: TemplateRenderer,
    poller: ReadinessPoller,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        compute: Arc<dyn ComputeGateway>,
        executor: Arc<dyn RemoteExecutor>,
        renderer: TemplateRenderer,
        config: OrchestratorConfig,
    ) -> Self {
        let poller = ReadinessPoller::new(compute.clone(), executor.clone(), config.poll.clone());
        Orchestrator {
            store,
            compute,
            executor,
            renderer,
            poller,
            config,
        }
    }

    pub fn store(&self) -> Arc<dyn ClusterStore> {
        self.store.clone()
    }

    /// Runs the whole provisioning job for `cluster_id`. Never panics on
    /// failure: the error is recorded on the cluster and returned in the
    /// outcome.
    pub async fn provision(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        cancel: &CancelToken,
    ) -> JobOutcome {
        let mut job = JobState::default();
        let result = self.run_steps(ctx, cluster_id, cancel, &mut job).await;

        match &result {
            Ok(()) => info!(cluster_id, "cluster active"),
            Err(e) => self.record_failure(ctx, cluster_id, e, &job, cancel).await,
        }

        JobOutcome {
            cluster_id: cluster_id.to_string(),
            result,
            launched_instances: job
                .launched
                .iter()
                .map(|n| n.instance_id.clone())
                .collect(),
        }
    }

    async fn run_steps(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        cancel: &CancelToken,
        job: &mut JobState,
    ) -> Result<()> {
        let cluster = self.store.get_cluster(cluster_id).await?;
        if cluster.status != ClusterStatus::Starting {
            return Err(HcpError::InvalidState {
                id: cluster_id.to_string(),
                status: cluster.status.to_string(),
                expected: "Starting",
            });
        }

        let plan = self.plan(ctx, &cluster).await?;
        info!(cluster_id, nodes = plan.len(), "plan ready");
        self.checkpoint(cluster_id, cancel).await?;

        self.launch(ctx, &cluster, plan, job).await?;
        self.checkpoint(cluster_id, cancel).await?;

        self.await_ready(ctx, cluster_id, job, cancel).await?;
        self.checkpoint(cluster_id, cancel).await?;

        let topology = Topology::resolve(&job.launched)?;
        info!(cluster_id, master = %topology.master.hostname, slaves = topology.slaves.len(), "topology resolved");

        let scripts = self.render_scripts(&topology, &job.launched)?;
        self.checkpoint(cluster_id, cancel).await?;

        self.push_configuration(&job.launched, &scripts).await?;
        self.checkpoint(cluster_id, cancel).await?;

        self.register(cluster_id, &topology, job, cancel).await?;
        self.checkpoint(cluster_id, cancel).await?;

        self.start_services(&topology).await?;

        let finalized = self
            .store
            .compare_and_set_status(cluster_id, ClusterStatus::Starting, ClusterStatus::Active, None)
            .await?;
        if !finalized {
            return Err(HcpError::Cancelled);
        }
        Ok(())
    }

    /// Resolves image, templates, node types and flavors. Any lookup failure
    /// is a planning error: nothing has been launched yet.
    async fn plan(&self, ctx: &RequestContext, cluster: &Cluster) -> Result<Vec<PlannedNode>> {
        let planning = |e: HcpError| HcpError::Planning(e.to_string());

        self.compute
            .find_image_by_id(ctx, &cluster.base_image_id)
            .await
            .map_err(planning)?;

        let mut entries = Vec::new();
        for (template_name, count) in &cluster.node_counts {
            let template = self
                .store
                .find_node_template(template_name)
                .await
                .map_err(planning)?;
            let node_type = self
                .store
                .get_node_type(&template.node_type_id)
                .await
                .map_err(planning)?;
            let flavor = self
                .compute
                .find_flavor_by_name_or_id(ctx, &template.flavor_id)
                .await
                .map_err(planning)?;
            entries.push(PlanEntry {
                template,
                node_type,
                flavor,
                count: *count,
            });
        }

        let plan = build_plan(&cluster.name, &entries);
        check_master_count(&plan)?;
        Ok(plan)
    }

    /// Launches every planned node concurrently. Instances that did launch are
    /// recorded even when another launch fails.
    async fn launch(
        &self,
        ctx: &RequestContext,
        cluster: &Cluster,
        plan: Vec<PlannedNode>,
        job: &mut JobState,
    ) -> Result<()> {
        let launches = plan.into_iter().map(|planned| async move {
            let request = InstanceRequest {
                name: planned.name.clone(),
                image_id: cluster.base_image_id.clone(),
                flavor_id: planned.flavor_id.clone(),
            };
            let result = self.compute.create_instance(ctx, request).await;
            (planned, result)
        });

        let mut first_error = None;
        for (planned, result) in join_all(launches).await {
            match result {
                Ok(instance) => {
                    info!(node = %planned.name, instance_id = %instance.id, "instance launched");
                    job.launched.push(LaunchedNode {
                        plan: planned,
                        instance_id: instance.id,
                        internal_ip: None,
                        external_ip: None,
                    });
                }
                Err(e) => {
                    warn!(node = %planned.name, error = %e, "instance launch failed");
                    first_error.get_or_insert(HcpError::Provisioning(format!(
                        "launching {}: {}",
                        planned.name, e
                    )));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn await_ready(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        job: &mut JobState,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut pending: Vec<PendingNode> = job
            .launched
            .iter()
            .map(|n| PendingNode::new(&n.plan.name, &n.instance_id))
            .collect();

        // Readiness can take minutes; keep watching the store for a delete.
        let preempted = async {
            loop {
                tokio::time::sleep(self.config.poll.interval).await;
                if let Err(e) = self.checkpoint(cluster_id, cancel).await {
                    return e;
                }
            }
        };
        let result = tokio::select! {
            result = self.poller.await_ready(ctx, &mut pending, &self.config.probe_command, cancel) => result,
            e = preempted => Err(e),
        };

        for (node, polled) in job.launched.iter_mut().zip(pending) {
            node.internal_ip = polled.internal_ip;
            node.external_ip = polled.external_ip;
        }
        result
    }

    /// One master script plus one shared worker script per worker template,
    /// keyed by template id.
    fn render_scripts(
        &self,
        topology: &Topology,
        nodes: &[LaunchedNode],
    ) -> Result<BTreeMap<String, String>> {
        let mut scripts = BTreeMap::new();
        for node in nodes {
            if scripts.contains_key(&node.plan.template_id) {
                continue;
            }
            let template = match node.plan.role {
                NodeRole::Master => MASTER_TEMPLATE,
                NodeRole::Worker => GENERAL_TEMPLATE,
            };
            let bindings = hadoop_bindings(topology, &node.plan.configs);
            let script = self.renderer.render(template, &bindings)?;
            scripts.insert(node.plan.template_id.clone(), script);
        }
        Ok(scripts)
    }

    async fn push_configuration(
        &self,
        nodes: &[LaunchedNode],
        scripts: &BTreeMap<String, String>,
    ) -> Result<()> {
        let pushes = nodes.iter().map(|node| async move {
            let script = scripts.get(&node.plan.template_id).ok_or_else(|| {
                HcpError::Provisioning(format!("no setup script rendered for {}", node.plan.name))
            })?;
            let host = node.external_ip.as_deref().ok_or_else(|| {
                HcpError::Provisioning(format!("{} has no address", node.plan.name))
            })?;
            self.apply_script(host, script)
                .await
                .map_err(|e| HcpError::Provisioning(format!("configuring {}: {}", node.plan.name, e)))?;
            info!(node = %node.plan.name, "node configured");
            Ok::<(), HcpError>(())
        });
        try_join_all(pushes).await?;
        Ok(())
    }

    async fn apply_script(&self, host: &str, script: &str) -> Result<()> {
        let path = format!("{}/{}", self.config.script_dir.trim_end_matches('/'), SETUP_SCRIPT);
        let mut session = self.executor.connect(host).await?;
        let result = async {
            session.upload(script.as_bytes(), &path, 0o755).await?;
            session.run_checked(&path).await?;
            Ok::<(), HcpError>(())
        }
        .await;
        session.close().await;
        result
    }

    /// A cluster row deleted underneath the job reads as a preemption.
    async fn register(
        &self,
        cluster_id: &str,
        topology: &Topology,
        job: &mut JobState,
        cancel: &CancelToken,
    ) -> Result<()> {
        let gone = |e: HcpError| if e.is_not_found() { HcpError::Cancelled } else { e };

        for node in &job.launched {
            self.checkpoint(cluster_id, cancel).await?;
            self.store
                .add_node(Node {
                    vm_id: node.instance_id.clone(),
                    cluster_id: cluster_id.to_string(),
                    node_template_id: node.plan.template_id.clone(),
                    name: node.plan.name.clone(),
                    internal_ip: node.internal_ip.clone(),
                    external_ip: node.external_ip.clone(),
                })
                .await
                .map_err(gone)?;
            job.registered.insert(node.instance_id.clone());
            debug!(node = %node.plan.name, "node registered");
        }

        let master_ip = &topology.master.ip;
        for (service, port) in [
            (JOBTRACKER_SERVICE, JOBTRACKER_UI_PORT),
            (NAMENODE_SERVICE, NAMENODE_UI_PORT),
        ] {
            self.store
                .add_service_url(cluster_id, service, &format!("http://{}:{}", master_ip, port))
                .await
                .map_err(gone)?;
        }
        Ok(())
    }

    async fn start_services(&self, topology: &Topology) -> Result<()> {
        let mut session = self.executor.connect(&topology.master.ip).await?;
        let result = session.run_checked(&self.config.start_command).await;
        session.close().await;
        result
            .map(|_| info!(master = %topology.master.hostname, "services started"))
            .map_err(|e| HcpError::Provisioning(format!("starting services: {}", e)))
    }

    /// Fails with [`HcpError::Cancelled`] once the job was cancelled or the
    /// cluster left `Starting` (delete requested) or disappeared.
    async fn checkpoint(&self, cluster_id: &str, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(HcpError::Cancelled);
        }
        match self.store.get_cluster(cluster_id).await {
            Ok(cluster) if cluster.status == ClusterStatus::Starting => Ok(()),
            Ok(cluster) => {
                debug!(cluster_id, status = %cluster.status, "provisioning preempted");
                Err(HcpError::Cancelled)
            }
            Err(e) if e.is_not_found() => Err(HcpError::Cancelled),
            Err(e) => Err(e),
        }
    }

    async fn record_failure(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        error: &HcpError,
        job: &JobState,
        cancel: &CancelToken,
    ) {
        if let HcpError::InvalidState { .. } = error {
            info!(cluster_id, reason = %error, "provisioning refused");
            return;
        }

        let marked = match error {
            HcpError::Cancelled => Ok(false),
            _ => {
                warn!(cluster_id, error = %error, "provisioning failed");
                self.store
                    .compare_and_set_status(
                        cluster_id,
                        ClusterStatus::Starting,
                        ClusterStatus::Error,
                        Some(error.to_string()),
                    )
                    .await
            }
        };
        match marked {
            Ok(true) => {}
            unrecorded => {
                match unrecorded {
                    Err(e) if !e.is_not_found() => {
                        warn!(cluster_id, error = %e, "could not record failure")
                    }
                    _ => info!(cluster_id, reason = %error, "provisioning stopped"),
                }
                // A cancelled job hands its instances to the in-process
                // teardown. Otherwise nothing else knows about the ones it
                // did not register.
                if !cancel.is_cancelled() {
                    self.terminate_unregistered(ctx, job).await;
                }
                return;
            }
        }

        if self.config.terminate_on_failure {
            self.terminate_unregistered(ctx, job).await;
            return;
        }
        for node in job.unregistered() {
            let registered = self
                .store
                .add_node(Node {
                    vm_id: node.instance_id.clone(),
                    cluster_id: cluster_id.to_string(),
                    node_template_id: node.plan.template_id.clone(),
                    name: node.plan.name.clone(),
                    internal_ip: node.internal_ip.clone(),
                    external_ip: node.external_ip.clone(),
                })
                .await;
            if let Err(e) = registered {
                warn!(
                    node = %node.plan.name,
                    error = %e,
                    "could not register leaked instance, terminating it"
                );
                if let Err(e) = self.compute.delete_instance(ctx, &node.instance_id).await {
                    warn!(node = %node.plan.name, error = %e, "could not terminate instance");
                }
            }
        }
    }

    async fn terminate_unregistered(&self, ctx: &RequestContext, job: &JobState) {
        for node in job.unregistered() {
            match self.compute.delete_instance(ctx, &node.instance_id).await {
                Ok(()) => info!(node = %node.plan.name, "terminated unregistered instance"),
                Err(e) => warn!(node = %node.plan.name, error = %e, "could not terminate instance"),
            }
        }
    }

    /// Terminates every VM of the cluster plus `extra_instances` (launched by a
    /// cancelled job but never registered), then deletes the cluster row.
    pub async fn teardown(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        extra_instances: Vec<String>,
    ) -> Result<()> {
        let nodes = match self.store.list_nodes(cluster_id).await {
            Ok(nodes) => nodes,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };

        let instances: BTreeSet<String> = nodes
            .into_iter()
            .map(|n| n.vm_id)
            .chain(extra_instances)
            .collect();
        for instance_id in &instances {
            if let Err(e) = self.compute.delete_instance(ctx, instance_id).await {
                warn!(cluster_id, instance_id = %instance_id, error = %e, "could not terminate instance");
            }
        }

        match self.store.delete_cluster(cluster_id).await {
            Ok(()) => {
                info!(cluster_id, instances = instances.len(), "cluster deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
