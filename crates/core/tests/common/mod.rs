#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hcp_core::defaults::heap_configs;
use hcp_core::error::{HcpError, RemoteError, Result};
use hcp_core::model::{
    Cluster, ClusterStatus, Node, NodeRole, NodeTemplate, NodeType, Process, ProcessProperty,
    ServiceUrl,
};
use hcp_core::remote::{CommandOutput, RemoteExecutor, RemoteSession};
use hcp_core::{
    ClusterStore, ComputeGateway, Flavor, Image, Instance, InstanceRequest, JobManager,
    Orchestrator, OrchestratorConfig, PollPolicy, RequestContext, StateStore, TemplateRenderer,
};

pub const IMAGE_ID: &str = "img-hadoop";
pub const START_COMMAND: &str = "start-hadoop";

/// Compute gateway over an in-memory instance table. Instances get their
/// addresses on the `address_after`-th listing after launch.
#[derive(Default)]
pub struct FakeCompute {
    pub flavors: Vec<Flavor>,
    pub images: Vec<Image>,
    pub address_after: usize,
    pub never_address: bool,
    pub launch_delay: Duration,
    inner: Mutex<ComputeState>,
}

#[derive(Default)]
struct ComputeState {
    next: u32,
    instances: Vec<(Instance, usize)>,
    created: Vec<String>,
    deleted: Vec<String>,
}

impl FakeCompute {
    pub fn new() -> Self {
        FakeCompute {
            flavors: vec![
                Flavor {
                    id: "2".into(),
                    name: "m1.small".into(),
                },
                Flavor {
                    id: "3".into(),
                    name: "m1.medium".into(),
                },
            ],
            images: vec![Image {
                id: IMAGE_ID.into(),
                name: "hadoop-1.0".into(),
            }],
            address_after: 2,
            ..Default::default()
        }
    }

    /// Instances never get an address, so readiness never completes.
    pub fn without_addresses(mut self) -> Self {
        self.never_address = true;
        self
    }

    pub fn with_launch_delay(mut self, delay: Duration) -> Self {
        self.launch_delay = delay;
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.inner.lock().unwrap().created.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().unwrap().deleted.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .instances
            .iter()
            .map(|(i, _)| i.name.clone())
            .collect()
    }
}

#[async_trait]
impl ComputeGateway for FakeCompute {
    async fn find_image_by_id(&self, _ctx: &RequestContext, id: &str) -> Result<Image> {
        self.images
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| HcpError::not_found("image", id))
    }

    async fn find_flavor_by_name_or_id(
        &self,
        _ctx: &RequestContext,
        reference: &str,
    ) -> Result<Flavor> {
        self.flavors
            .iter()
            .find(|f| f.id == reference || f.name == reference)
            .cloned()
            .ok_or_else(|| HcpError::not_found("flavor", reference))
    }

    async fn create_instance(
        &self,
        _ctx: &RequestContext,
        request: InstanceRequest,
    ) -> Result<Instance> {
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        let mut state = self.inner.lock().unwrap();
        state.next += 1;
        let instance = Instance {
            id: format!("vm-{}", state.next),
            name: request.name,
            addresses: Vec::new(),
        };
        state.created.push(instance.id.clone());
        state.instances.push((instance.clone(), 0));
        Ok(instance)
    }

    async fn list_instances(&self, _ctx: &RequestContext) -> Result<Vec<Instance>> {
        let mut state = self.inner.lock().unwrap();
        let address_after = self.address_after;
        let never = self.never_address;
        Ok(state
            .instances
            .iter_mut()
            .map(|(instance, listings)| {
                *listings += 1;
                if !never && *listings >= address_after && instance.addresses.is_empty() {
                    let n = instance.id.trim_start_matches("vm-");
                    instance.addresses = vec![format!("10.0.0.{}", n), format!("172.24.4.{}", n)];
                }
                instance.clone()
            })
            .collect())
    }

    async fn delete_instance(&self, _ctx: &RequestContext, id: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.instances.retain(|(i, _)| i.id != id);
        state.deleted.push(id.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Run { host: String, command: String },
    Upload { host: String, path: String, content: String },
}

/// Executor that records every call. Hosts refuse the first `refuse_first`
/// connections; commands listed in `failing` exit 1 on the given host.
#[derive(Default)]
pub struct FakeExecutor {
    pub refuse_first: usize,
    pub failing: HashSet<(String, String)>,
    pub fail_everywhere: HashSet<String>,
    calls: Arc<Mutex<Vec<Call>>>,
    attempts: Mutex<HashMap<String, usize>>,
    open_sessions: Arc<Mutex<usize>>,
}

impl FakeExecutor {
    pub fn refusing_first(connections: usize) -> Self {
        FakeExecutor {
            refuse_first: connections,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn runs_on(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Run { host: h, command } if h == host => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Upload { host, content, .. } => Some((host, content)),
                _ => None,
            })
            .collect()
    }

    pub fn open_sessions(&self) -> usize {
        *self.open_sessions.lock().unwrap()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn connect(&self, host: &str) -> std::result::Result<Box<dyn RemoteSession>, RemoteError> {
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(host.to_string()).or_default();
        *count += 1;
        if *count <= self.refuse_first {
            return Err(RemoteError::Unreachable {
                host: host.to_string(),
                reason: "Connection refused".into(),
            });
        }
        *self.open_sessions.lock().unwrap() += 1;

        let failing = self
            .failing
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .chain(self.fail_everywhere.iter().cloned())
            .collect();
        Ok(Box::new(FakeSession {
            host: host.to_string(),
            failing,
            calls: self.calls.clone(),
            open_sessions: self.open_sessions.clone(),
            closed: false,
        }))
    }
}

struct FakeSession {
    host: String,
    failing: HashSet<String>,
    calls: Arc<Mutex<Vec<Call>>>,
    open_sessions: Arc<Mutex<usize>>,
    closed: bool,
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&mut self, command: &str) -> std::result::Result<CommandOutput, RemoteError> {
        self.calls.lock().unwrap().push(Call::Run {
            host: self.host.clone(),
            command: command.to_string(),
        });
        let code = if self.failing.contains(command) { 1 } else { 0 };
        Ok(CommandOutput {
            code,
            stdout: String::new(),
            stderr: if code == 0 { String::new() } else { "boom".into() },
        })
    }

    async fn upload(
        &mut self,
        content: &[u8],
        remote_path: &str,
        _mode: u32,
    ) -> std::result::Result<(), RemoteError> {
        self.calls.lock().unwrap().push(Call::Upload {
            host: self.host.clone(),
            path: remote_path.to_string(),
            content: String::from_utf8_lossy(content).to_string(),
        });
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            *self.open_sessions.lock().unwrap() -= 1;
        }
    }
}

/// Deletes the cluster row right before the first node registration, the
/// way a `cluster delete` finishing in another process would.
pub struct VanishingStore {
    inner: Arc<StateStore>,
    vanished: AtomicBool,
}

impl VanishingStore {
    pub fn new(inner: Arc<StateStore>) -> Self {
        VanishingStore {
            inner,
            vanished: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ClusterStore for VanishingStore {
    async fn add_node_type(&self, node_type: NodeType) -> Result<()> {
        self.inner.add_node_type(node_type).await
    }

    async fn get_node_type(&self, id: &str) -> Result<NodeType> {
        self.inner.get_node_type(id).await
    }

    async fn find_node_type(&self, name: &str) -> Result<NodeType> {
        self.inner.find_node_type(name).await
    }

    async fn list_node_types(&self) -> Result<Vec<NodeType>> {
        self.inner.list_node_types().await
    }

    async fn add_node_template(&self, template: NodeTemplate) -> Result<()> {
        self.inner.add_node_template(template).await
    }

    async fn get_node_template(&self, id: &str) -> Result<NodeTemplate> {
        self.inner.get_node_template(id).await
    }

    async fn find_node_template(&self, name: &str) -> Result<NodeTemplate> {
        self.inner.find_node_template(name).await
    }

    async fn list_node_templates(&self, tenant_id: Option<&str>) -> Result<Vec<NodeTemplate>> {
        self.inner.list_node_templates(tenant_id).await
    }

    async fn delete_node_template(&self, id: &str) -> Result<()> {
        self.inner.delete_node_template(id).await
    }

    async fn create_cluster(&self, cluster: Cluster) -> Result<()> {
        self.inner.create_cluster(cluster).await
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster> {
        self.inner.get_cluster(id).await
    }

    async fn list_clusters(&self, tenant_id: Option<&str>) -> Result<Vec<Cluster>> {
        self.inner.list_clusters(tenant_id).await
    }

    async fn save_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.inner.save_cluster(cluster).await
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: ClusterStatus,
        status: ClusterStatus,
        description: Option<String>,
    ) -> Result<bool> {
        self.inner
            .compare_and_set_status(id, expected, status, description)
            .await
    }

    async fn delete_cluster(&self, id: &str) -> Result<()> {
        self.inner.delete_cluster(id).await
    }

    async fn add_node(&self, node: Node) -> Result<()> {
        if !self.vanished.swap(true, Ordering::SeqCst) {
            self.inner.delete_cluster(&node.cluster_id).await?;
        }
        self.inner.add_node(node).await
    }

    async fn list_nodes(&self, cluster_id: &str) -> Result<Vec<Node>> {
        self.inner.list_nodes(cluster_id).await
    }

    async fn add_service_url(&self, cluster_id: &str, name: &str, url: &str) -> Result<()> {
        self.inner.add_service_url(cluster_id, name, url).await
    }

    async fn list_service_urls(&self, cluster_id: &str) -> Result<Vec<ServiceUrl>> {
        self.inner.list_service_urls(cluster_id).await
    }
}

pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        poll: PollPolicy {
            interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            backoff: 2.0,
            timeout: Duration::from_secs(5),
        },
        start_command: START_COMMAND.to_string(),
        ..Default::default()
    }
}

pub struct Harness {
    pub store: Arc<StateStore>,
    pub compute: Arc<FakeCompute>,
    pub executor: Arc<FakeExecutor>,
    pub manager: JobManager,
}

impl Harness {
    pub fn new(compute: FakeCompute, executor: FakeExecutor, config: OrchestratorConfig) -> Self {
        Self::with_store(compute, executor, config, |store| store as Arc<dyn ClusterStore>)
    }

    /// The orchestrator sees the store through `wrap`; `Harness::store` stays
    /// the plain in-memory store underneath.
    pub fn with_store(
        compute: FakeCompute,
        executor: FakeExecutor,
        config: OrchestratorConfig,
        wrap: impl FnOnce(Arc<StateStore>) -> Arc<dyn ClusterStore>,
    ) -> Self {
        let store = Arc::new(StateStore::in_memory());
        let compute = Arc::new(compute);
        let executor = Arc::new(executor);
        let orchestrator = Orchestrator::new(
            wrap(store.clone()),
            compute.clone(),
            executor.clone(),
            TemplateRenderer::with_builtin(),
            config,
        );
        Harness {
            store,
            compute,
            executor,
            manager: JobManager::new(Arc::new(orchestrator)),
        }
    }

    pub fn ctx(&self) -> RequestContext {
        RequestContext::for_tenant("tenant-1")
    }

    /// `JT+NN` master and `TT+DN` worker types with `jt_nn.small` and
    /// `tt_dn.small` templates, `heap_size=896` everywhere.
    pub async fn seed(&self) {
        let required = || vec![ProcessProperty::required("heap_size")];
        let master = NodeType::new(
            "JT+NN",
            NodeRole::Master,
            vec![
                Process::new("job_tracker", required()),
                Process::new("name_node", required()),
            ],
        );
        let worker = NodeType::new(
            "TT+DN",
            NodeRole::Worker,
            vec![
                Process::new("task_tracker", required()),
                Process::new("data_node", required()),
            ],
        );
        for (node_type, template, flavor) in [
            (master, "jt_nn.small", "m1.small"),
            (worker, "tt_dn.small", "m1.small"),
        ] {
            let built = NodeTemplate::build(
                template,
                &node_type,
                "tenant-1",
                flavor,
                heap_configs(&node_type, "896"),
            )
            .unwrap();
            self.store.add_node_type(node_type).await.unwrap();
            self.store.add_node_template(built).await.unwrap();
        }
    }

    pub fn request(&self, name: &str, counts: &[(&str, usize)]) -> hcp_core::model::ClusterRequest {
        hcp_core::model::ClusterRequest {
            name: name.to_string(),
            base_image_id: IMAGE_ID.to_string(),
            tenant_id: "tenant-1".to_string(),
            node_counts: counts
                .iter()
                .map(|(t, c)| (t.to_string(), *c))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}
