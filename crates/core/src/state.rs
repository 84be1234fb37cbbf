use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fd_lock::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{HcpError, Result};
use crate::model::{
    Cluster, ClusterStatus, ClusterView, Node, NodeRole, NodeTemplate, NodeType, ServiceUrl,
};

const STATE_PATH: &str = "~/.hcp/state.json";

/// Persistence facade for the catalog and cluster records.
///
/// Every lookup by id fails with [`HcpError::NotFound`] when the record is
/// absent, which the CLI surfaces as a 404-equivalent.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn add_node_type(&self, node_type: NodeType) -> Result<()>;
    async fn get_node_type(&self, id: &str) -> Result<NodeType>;
    async fn find_node_type(&self, name: &str) -> Result<NodeType>;
    async fn list_node_types(&self) -> Result<Vec<NodeType>>;

    async fn add_node_template(&self, template: NodeTemplate) -> Result<()>;
    async fn get_node_template(&self, id: &str) -> Result<NodeTemplate>;
    async fn find_node_template(&self, name: &str) -> Result<NodeTemplate>;
    async fn list_node_templates(&self, tenant_id: Option<&str>) -> Result<Vec<NodeTemplate>>;
    /// Fails with [`HcpError::InUse`] while a node or a cluster's counts reference it.
    async fn delete_node_template(&self, id: &str) -> Result<()>;

    async fn create_cluster(&self, cluster: Cluster) -> Result<()>;
    async fn get_cluster(&self, id: &str) -> Result<Cluster>;
    async fn list_clusters(&self, tenant_id: Option<&str>) -> Result<Vec<Cluster>>;
    async fn save_cluster(&self, cluster: &Cluster) -> Result<()>;
    /// Writes `status` only if the stored status is still `expected`.
    /// Returns whether the write happened.
    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: ClusterStatus,
        status: ClusterStatus,
        description: Option<String>,
    ) -> Result<bool>;
    /// Removes the cluster together with its nodes and service URLs.
    async fn delete_cluster(&self, id: &str) -> Result<()>;

    async fn add_node(&self, node: Node) -> Result<()>;
    async fn list_nodes(&self, cluster_id: &str) -> Result<Vec<Node>>;

    async fn add_service_url(&self, cluster_id: &str, name: &str, url: &str) -> Result<()>;
    async fn list_service_urls(&self, cluster_id: &str) -> Result<Vec<ServiceUrl>>;

    async fn cluster_view(&self, id: &str) -> Result<ClusterView> {
        let cluster = self.get_cluster(id).await?;
        let nodes = self.list_nodes(id).await?;
        let urls = self.list_service_urls(id).await?;
        Ok(ClusterView::new(cluster, nodes, urls))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub node_types: Vec<NodeType>,
    #[serde(default)]
    pub node_templates: Vec<NodeTemplate>,
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub service_urls: Vec<ServiceUrl>,
}

impl StoreState {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(StoreState::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| HcpError::Store(format!("Failed to read state file: {}", e)))?;

        serde_json::from_str(&contents)
            .map_err(|e| HcpError::Store(format!("Failed to parse state file: {}", e)))
    }

    /// Callers hold the write lock on the state file.
    fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| HcpError::Store(format!("Failed to serialize state: {}", e)))?;

        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, json)
            .map_err(|e| HcpError::Store(format!("Failed to write state file: {}", e)))?;
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            HcpError::Store(format!("Failed to replace state file: {}", e))
        })
    }

    fn cluster(&self, id: &str) -> Result<&Cluster> {
        self.clusters
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| HcpError::not_found("cluster", id))
    }

    fn cluster_mut(&mut self, id: &str) -> Result<&mut Cluster> {
        self.clusters
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| HcpError::not_found("cluster", id))
    }

    fn template(&self, id: &str) -> Result<&NodeTemplate> {
        self.node_templates
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| HcpError::not_found("node template", id))
    }

    fn role_of_template(&self, template_id: &str) -> Option<NodeRole> {
        let template = self.template(template_id).ok()?;
        self.node_types
            .iter()
            .find(|t| t.id == template.node_type_id)
            .map(|t| t.role)
    }
}

/// [`ClusterStore`] over a [`StoreState`] kept in memory or in a JSON file.
///
/// The file-backed variant re-reads the file on every operation and writes it
/// back after every mutation, so several `hcp` processes observe each other's
/// progress. Each operation holds an advisory lock on `<state>.lock` from load
/// to save; concurrent writers serialize instead of overwriting each other.
pub struct StateStore {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl StateStore {
    pub fn in_memory() -> Self {
        StateStore {
            path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lock = open_lock(&path)?;
        let state = {
            let _guard = lock.read().map_err(lock_failed)?;
            StoreState::load(&path)?
        };
        Ok(StateStore {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Opens `~/.hcp/state.json`.
    pub fn open_default() -> Result<Self> {
        Self::open(expand_path(STATE_PATH)?)
    }

    async fn read<R>(&self, f: impl FnOnce(&StoreState) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock().await;
        if let Some(path) = &self.path {
            let lock = open_lock(path)?;
            let _guard = lock.read().map_err(lock_failed)?;
            *state = StoreState::load(path)?;
        }
        f(&state)
    }

    /// `f` must validate before it mutates: the in-memory variant keeps
    /// whatever `f` changed even when it returns an error.
    async fn write<R>(&self, f: impl FnOnce(&mut StoreState) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock().await;
        let Some(path) = &self.path else {
            return f(&mut state);
        };

        let mut lock = open_lock(path)?;
        let _guard = lock.write().map_err(lock_failed)?;
        *state = StoreState::load(path)?;
        let result = f(&mut state)?;
        state.save(path)?;
        Ok(result)
    }
}

/// Opens the lock file next to the state file, creating the directory if needed.
fn open_lock(path: &Path) -> Result<RwLock<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| HcpError::Store(format!("Failed to create state directory: {}", e)))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path.with_extension("json.lock"))
        .map_err(|e| HcpError::Store(format!("Failed to open state lock: {}", e)))?;
    Ok(RwLock::new(file))
}

fn lock_failed(e: std::io::Error) -> HcpError {
    HcpError::Store(format!("Failed to lock state file: {}", e))
}

#[async_trait]
impl ClusterStore for StateStore {
    async fn add_node_type(&self, node_type: NodeType) -> Result<()> {
        self.write(|state| {
            if state.node_types.iter().any(|t| t.name == node_type.name) {
                return Err(HcpError::AlreadyExists {
                    kind: "node type",
                    name: node_type.name.clone(),
                });
            }
            state.node_types.push(node_type);
            Ok(())
        })
        .await
    }

    async fn get_node_type(&self, id: &str) -> Result<NodeType> {
        self.read(|state| {
            state
                .node_types
                .iter()
                .find(|t| t.id == id)
                .cloned()
                .ok_or_else(|| HcpError::not_found("node type", id))
        })
        .await
    }

    async fn find_node_type(&self, name: &str) -> Result<NodeType> {
        self.read(|state| {
            state
                .node_types
                .iter()
                .find(|t| t.name == name)
                .cloned()
                .ok_or_else(|| HcpError::not_found("node type", name))
        })
        .await
    }

    async fn list_node_types(&self) -> Result<Vec<NodeType>> {
        self.read(|state| Ok(state.node_types.clone())).await
    }

    async fn add_node_template(&self, template: NodeTemplate) -> Result<()> {
        self.write(|state| {
            if state.node_templates.iter().any(|t| t.name == template.name) {
                return Err(HcpError::AlreadyExists {
                    kind: "node template",
                    name: template.name.clone(),
                });
            }
            if !state.node_types.iter().any(|t| t.id == template.node_type_id) {
                return Err(HcpError::not_found("node type", &template.node_type_id));
            }
            state.node_templates.push(template);
            Ok(())
        })
        .await
    }

    async fn get_node_template(&self, id: &str) -> Result<NodeTemplate> {
        self.read(|state| state.template(id).cloned()).await
    }

    async fn find_node_template(&self, name: &str) -> Result<NodeTemplate> {
        self.read(|state| {
            state
                .node_templates
                .iter()
                .find(|t| t.name == name)
                .cloned()
                .ok_or_else(|| HcpError::not_found("node template", name))
        })
        .await
    }

    async fn list_node_templates(&self, tenant_id: Option<&str>) -> Result<Vec<NodeTemplate>> {
        self.read(|state| {
            Ok(state
                .node_templates
                .iter()
                .filter(|t| tenant_id.is_none_or(|tenant| t.tenant_id == tenant))
                .cloned()
                .collect())
        })
        .await
    }

    async fn delete_node_template(&self, id: &str) -> Result<()> {
        self.write(|state| {
            let template = state.template(id)?;
            let referenced = state.nodes.iter().any(|n| n.node_template_id == id)
                || state
                    .clusters
                    .iter()
                    .any(|c| c.node_counts.contains_key(&template.name));
            if referenced {
                return Err(HcpError::InUse {
                    kind: "node template",
                    id: id.to_string(),
                });
            }
            state.node_templates.retain(|t| t.id != id);
            Ok(())
        })
        .await
    }

    async fn create_cluster(&self, cluster: Cluster) -> Result<()> {
        self.write(|state| {
            if state
                .clusters
                .iter()
                .any(|c| c.name == cluster.name && c.tenant_id == cluster.tenant_id)
            {
                return Err(HcpError::AlreadyExists {
                    kind: "cluster",
                    name: cluster.name.clone(),
                });
            }
            state.clusters.push(cluster);
            Ok(())
        })
        .await
    }

    async fn get_cluster(&self, id: &str) -> Result<Cluster> {
        self.read(|state| state.cluster(id).cloned()).await
    }

    async fn list_clusters(&self, tenant_id: Option<&str>) -> Result<Vec<Cluster>> {
        self.read(|state| {
            Ok(state
                .clusters
                .iter()
                .filter(|c| tenant_id.is_none_or(|tenant| c.tenant_id == tenant))
                .cloned()
                .collect())
        })
        .await
    }

    async fn save_cluster(&self, cluster: &Cluster) -> Result<()> {
        self.write(|state| {
            let stored = state.cluster_mut(&cluster.id)?;
            *stored = cluster.clone();
            Ok(())
        })
        .await
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: ClusterStatus,
        status: ClusterStatus,
        description: Option<String>,
    ) -> Result<bool> {
        self.write(|state| {
            let cluster = state.cluster_mut(id)?;
            if cluster.status != expected {
                return Ok(false);
            }
            cluster.set_status(status, description);
            Ok(true)
        })
        .await
    }

    async fn delete_cluster(&self, id: &str) -> Result<()> {
        self.write(|state| {
            state.cluster(id)?;
            state.clusters.retain(|c| c.id != id);
            state.nodes.retain(|n| n.cluster_id != id);
            state.service_urls.retain(|s| s.cluster_id != id);
            Ok(())
        })
        .await
    }

    async fn add_node(&self, node: Node) -> Result<()> {
        self.write(|state| {
            let cluster = state.cluster(&node.cluster_id)?;
            let template = state.template(&node.node_template_id)?;
            if state.nodes.iter().any(|n| n.vm_id == node.vm_id) {
                return Err(HcpError::AlreadyExists {
                    kind: "node",
                    name: node.vm_id.clone(),
                });
            }

            let requested = cluster.node_counts.get(&template.name).copied().unwrap_or(0);
            let realized = state
                .nodes
                .iter()
                .filter(|n| n.cluster_id == node.cluster_id && n.node_template_id == template.id)
                .count();
            if realized >= requested {
                return Err(HcpError::Store(format!(
                    "cluster '{}' already has {} of {} requested '{}' nodes",
                    cluster.name, realized, requested, template.name
                )));
            }

            state.nodes.push(node);
            Ok(())
        })
        .await
    }

    async fn list_nodes(&self, cluster_id: &str) -> Result<Vec<Node>> {
        self.read(|state| {
            state.cluster(cluster_id)?;
            Ok(state
                .nodes
                .iter()
                .filter(|n| n.cluster_id == cluster_id)
                .cloned()
                .collect())
        })
        .await
    }

    async fn add_service_url(&self, cluster_id: &str, name: &str, url: &str) -> Result<()> {
        self.write(|state| {
            state.cluster(cluster_id)?;
            let has_master = state.nodes.iter().any(|n| {
                n.cluster_id == cluster_id
                    && state.role_of_template(&n.node_template_id) == Some(NodeRole::Master)
            });
            if !has_master {
                return Err(HcpError::Store(format!(
                    "cluster '{}' has no registered master node",
                    cluster_id
                )));
            }

            state
                .service_urls
                .retain(|s| !(s.cluster_id == cluster_id && s.service_name == name));
            state.service_urls.push(ServiceUrl {
                cluster_id: cluster_id.to_string(),
                service_name: name.to_string(),
                url: url.to_string(),
            });
            Ok(())
        })
        .await
    }

    async fn list_service_urls(&self, cluster_id: &str) -> Result<Vec<ServiceUrl>> {
        self.read(|state| {
            state.cluster(cluster_id)?;
            Ok(state
                .service_urls
                .iter()
                .filter(|s| s.cluster_id == cluster_id)
                .cloned()
                .collect())
        })
        .await
    }
}

/// Expand a path that may contain `~` to the user's home directory
pub fn expand_path(path: &str) -> Result<PathBuf> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| HcpError::Store("Unable to determine home directory".into()))?;
        Ok(home.join(rest))
    } else {
        Ok(PathBuf::from(path))
    }
}
