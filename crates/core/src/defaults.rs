//! The stock Hadoop catalog: node types for every JobTracker/NameNode/
//! TaskTracker/DataNode combination and small/medium templates.

use std::collections::BTreeMap;

use tracing::info;

use crate::error::{HcpError, Result};
use crate::model::{NodeRole, NodeTemplate, NodeType, Process, ProcessConfigs, ProcessProperty};
use crate::state::ClusterStore;

pub const MASTER_NODE_TYPE: &str = "JT+NN";
pub const WORKER_NODE_TYPE: &str = "TT+DN";

fn process(name: &str) -> Process {
    Process::new(name, vec![ProcessProperty::required("heap_size")])
}

pub fn hadoop_node_types() -> Vec<NodeType> {
    vec![
        NodeType::new(
            MASTER_NODE_TYPE,
            NodeRole::Master,
            vec![process("job_tracker"), process("name_node")],
        ),
        NodeType::new(
            WORKER_NODE_TYPE,
            NodeRole::Worker,
            vec![process("task_tracker"), process("data_node")],
        ),
        NodeType::new("JT", NodeRole::Worker, vec![process("job_tracker")]),
        NodeType::new("NN", NodeRole::Worker, vec![process("name_node")]),
        NodeType::new("TT", NodeRole::Worker, vec![process("task_tracker")]),
        NodeType::new("DN", NodeRole::Worker, vec![process("data_node")]),
    ]
}

/// (template name, node type, flavor, heap size)
const DEFAULT_TEMPLATES: &[(&str, &str, &str, &str)] = &[
    ("jt_nn.small", MASTER_NODE_TYPE, "m1.small", "896"),
    ("jt_nn.medium", MASTER_NODE_TYPE, "m1.medium", "1792"),
    ("tt_dn.small", WORKER_NODE_TYPE, "m1.small", "896"),
    ("tt_dn.medium", WORKER_NODE_TYPE, "m1.medium", "1792"),
];

/// Heap size for every process of `node_type`.
pub fn heap_configs(node_type: &NodeType, heap_size: &str) -> ProcessConfigs {
    node_type
        .processes
        .iter()
        .map(|p| {
            (
                p.name.clone(),
                BTreeMap::from([("heap_size".to_string(), heap_size.to_string())]),
            )
        })
        .collect()
}

/// Installs the stock node types and templates, skipping names that already
/// exist. Returns how many records were added.
pub async fn install(store: &dyn ClusterStore, tenant_id: &str) -> Result<usize> {
    let mut added = 0;
    for node_type in hadoop_node_types() {
        match store.add_node_type(node_type).await {
            Ok(()) => added += 1,
            Err(HcpError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    for (name, type_name, flavor, heap) in DEFAULT_TEMPLATES {
        let node_type = store.find_node_type(type_name).await?;
        let template =
            NodeTemplate::build(name, &node_type, tenant_id, flavor, heap_configs(&node_type, heap))?;
        match store.add_node_template(template).await {
            Ok(()) => added += 1,
            Err(HcpError::AlreadyExists { .. }) => {}
            Err(e) => return Err(e),
        }
    }

    info!(added, "default catalog installed");
    Ok(added)
}
