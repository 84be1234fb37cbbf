use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HcpError, Result};

/// Per-process configuration: process name -> property name -> value.
pub type ProcessConfigs = BTreeMap<String, BTreeMap<String, String>>;

/// Role a node type plays in the cluster topology, decided when the node type
/// is authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Hosts the coordination services; exactly one per cluster.
    Master,
    Worker,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessProperty {
    pub name: String,
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

impl ProcessProperty {
    pub fn required(name: &str) -> Self {
        ProcessProperty {
            name: name.to_string(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: &str, default: Option<&str>) -> Self {
        ProcessProperty {
            name: name.to_string(),
            required: false,
            default: default.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub name: String,
    pub properties: Vec<ProcessProperty>,
}

impl Process {
    pub fn new(name: &str, properties: Vec<ProcessProperty>) -> Self {
        Process {
            name: name.to_string(),
            properties,
        }
    }

    pub fn property(&self, name: &str) -> Option<&ProcessProperty> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Named set of process roles a VM runs, e.g. `JT+NN`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeType {
    pub id: String,
    pub name: String,
    pub role: NodeRole,
    pub processes: Vec<Process>,
}

impl NodeType {
    pub fn new(name: &str, role: NodeRole, processes: Vec<Process>) -> Self {
        NodeType {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            role,
            processes,
        }
    }

    pub fn process(&self, name: &str) -> Option<&Process> {
        self.processes.iter().find(|p| p.name == name)
    }
}

/// Reusable blueprint for VM instances: node type, flavor and the resolved
/// configuration of every process of the node type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTemplate {
    pub id: String,
    pub name: String,
    pub node_type_id: String,
    pub tenant_id: String,
    pub flavor_id: String,
    pub configs: ProcessConfigs,
}

impl NodeTemplate {
    /// Validates `configs` against the node type and fills in declared
    /// defaults. Every declared property ends up with a value or the build
    /// fails.
    pub fn build(
        name: &str,
        node_type: &NodeType,
        tenant_id: &str,
        flavor_id: &str,
        configs: ProcessConfigs,
    ) -> Result<NodeTemplate> {
        if name.trim().is_empty() {
            return Err(HcpError::InvalidTemplate("template name is empty".into()));
        }

        for (process_name, values) in &configs {
            let process = node_type.process(process_name).ok_or_else(|| {
                HcpError::InvalidTemplate(format!(
                    "node type '{}' has no process '{}'",
                    node_type.name, process_name
                ))
            })?;
            if let Some(unknown) = values.keys().find(|key| process.property(key).is_none()) {
                return Err(HcpError::InvalidTemplate(format!(
                    "process '{}' has no property '{}'",
                    process_name, unknown
                )));
            }
        }

        let mut resolved = ProcessConfigs::new();
        for process in &node_type.processes {
            let explicit = configs.get(&process.name);
            let mut values = BTreeMap::new();
            for property in &process.properties {
                let value = explicit
                    .and_then(|v| v.get(&property.name).cloned())
                    .or_else(|| property.default.clone());
                match value {
                    Some(value) => {
                        values.insert(property.name.clone(), value);
                    }
                    None if property.required => {
                        return Err(HcpError::InvalidTemplate(format!(
                            "required property '{}' of process '{}' has no value and no default",
                            property.name, process.name
                        )));
                    }
                    None => {}
                }
            }
            resolved.insert(process.name.clone(), values);
        }

        Ok(NodeTemplate {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            node_type_id: node_type.id.clone(),
            tenant_id: tenant_id.to_string(),
            flavor_id: flavor_id.to_string(),
            configs: resolved,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    Starting,
    Active,
    Stopping,
    /// Terminal failure; `Cluster::status_description` says why.
    Error,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Starting => "Starting",
            ClusterStatus::Active => "Active",
            ClusterStatus::Stopping => "Stopping",
            ClusterStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub base_image_id: String,
    pub tenant_id: String,
    pub status: ClusterStatus,
    #[serde(default)]
    pub status_description: Option<String>,
    /// Declarative target: template name -> instance count.
    pub node_counts: BTreeMap<String, usize>,
    pub created_at: String,
    pub updated_at: String,
}

impl Cluster {
    pub fn from_request(request: ClusterRequest) -> Cluster {
        let now = chrono::Utc::now().to_rfc3339();
        Cluster {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name,
            base_image_id: request.base_image_id,
            tenant_id: request.tenant_id,
            status: ClusterStatus::Starting,
            status_description: None,
            node_counts: request.node_counts,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: ClusterStatus, description: Option<String>) {
        self.status = status;
        self.status_description = description;
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

/// A realized VM belonging to a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub vm_id: String,
    pub cluster_id: String,
    pub node_template_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub internal_ip: Option<String>,
    #[serde(default)]
    pub external_ip: Option<String>,
}

impl Node {
    pub fn new(cluster_id: &str, node_template_id: &str, vm_id: &str) -> Self {
        Node {
            vm_id: vm_id.to_string(),
            cluster_id: cluster_id.to_string(),
            node_template_id: node_template_id.to_string(),
            name: String::new(),
            internal_ip: None,
            external_ip: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUrl {
    pub cluster_id: String,
    pub service_name: String,
    pub url: String,
}

/// What a caller asks for when creating a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRequest {
    pub name: String,
    pub base_image_id: String,
    pub tenant_id: String,
    pub node_counts: BTreeMap<String, usize>,
}

impl ClusterRequest {
    /// Shape checks that need no store access. Names become hostnames, so they
    /// are restricted to alphanumerics and `-`.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(HcpError::InvalidRequest("cluster name is empty".into()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
            || self.name.starts_with('-')
        {
            return Err(HcpError::InvalidRequest(format!(
                "cluster name '{}' is not a valid hostname prefix",
                self.name
            )));
        }
        if self.base_image_id.is_empty() {
            return Err(HcpError::InvalidRequest("base image id is empty".into()));
        }
        if self.node_counts.is_empty() {
            return Err(HcpError::InvalidRequest("node counts are empty".into()));
        }
        if let Some((template, _)) = self.node_counts.iter().find(|(_, count)| **count == 0) {
            return Err(HcpError::InvalidRequest(format!(
                "count for template '{}' must be at least 1",
                template
            )));
        }
        Ok(())
    }
}

/// Read-only view of a cluster and everything the orchestrator has written
/// for it so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    pub id: String,
    pub name: String,
    pub base_image_id: String,
    pub tenant_id: String,
    pub status: ClusterStatus,
    pub status_description: Option<String>,
    pub node_counts: BTreeMap<String, usize>,
    pub nodes: Vec<Node>,
    pub service_urls: BTreeMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ClusterView {
    pub fn new(cluster: Cluster, nodes: Vec<Node>, service_urls: Vec<ServiceUrl>) -> Self {
        ClusterView {
            id: cluster.id,
            name: cluster.name,
            base_image_id: cluster.base_image_id,
            tenant_id: cluster.tenant_id,
            status: cluster.status,
            status_description: cluster.status_description,
            node_counts: cluster.node_counts,
            nodes,
            service_urls: service_urls
                .into_iter()
                .map(|s| (s.service_name, s.url))
                .collect(),
            created_at: cluster.created_at,
            updated_at: cluster.updated_at,
        }
    }
}
