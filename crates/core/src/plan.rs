//! Node planning and topology resolution.

use crate::compute::Flavor;
use crate::error::{HcpError, Result};
use crate::model::{NodeRole, NodeTemplate, NodeType, ProcessConfigs};

/// A requested template with everything needed to launch its instances.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub template: NodeTemplate,
    pub node_type: NodeType,
    pub flavor: Flavor,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNode {
    pub name: String,
    pub role: NodeRole,
    pub node_type: String,
    pub template_id: String,
    pub template_name: String,
    pub flavor_id: String,
    pub configs: ProcessConfigs,
}

/// Expands `entries` into one planned node per requested instance.
///
/// Master-role nodes are named `{cluster}-master`; every other node gets
/// `{cluster}-{n}` from a single counter shared across templates, in entry
/// order.
pub fn build_plan(cluster_name: &str, entries: &[PlanEntry]) -> Vec<PlannedNode> {
    let mut index = 0;
    let mut plan = Vec::new();
    for entry in entries {
        for _ in 0..entry.count {
            let name = match entry.node_type.role {
                NodeRole::Master => format!("{}-master", cluster_name),
                NodeRole::Worker => {
                    index += 1;
                    format!("{}-{}", cluster_name, index)
                }
            };
            plan.push(PlannedNode {
                name,
                role: entry.node_type.role,
                node_type: entry.node_type.name.clone(),
                template_id: entry.template.id.clone(),
                template_name: entry.template.name.clone(),
                flavor_id: entry.flavor.id.clone(),
                configs: entry.template.configs.clone(),
            });
        }
    }
    plan
}

/// Rejects plans that cannot yield exactly one master before anything is
/// launched.
pub fn check_master_count(plan: &[PlannedNode]) -> Result<()> {
    match plan.iter().filter(|n| n.role == NodeRole::Master).count() {
        1 => Ok(()),
        0 => Err(HcpError::Planning("cluster has no master-role node".into())),
        n => Err(HcpError::Planning(format!(
            "cluster has {} master-role nodes, expected exactly one",
            n
        ))),
    }
}

/// A planned node after launch, with whatever addresses are known so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedNode {
    pub plan: PlannedNode,
    pub instance_id: String,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAddress {
    pub hostname: String,
    pub ip: String,
    pub internal_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub master: NodeAddress,
    pub slaves: Vec<NodeAddress>,
}

impl Topology {
    /// Exactly one ready node must carry the master role.
    pub fn resolve(nodes: &[LaunchedNode]) -> Result<Topology> {
        let mut master = None;
        let mut slaves = Vec::new();

        for node in nodes {
            let address = NodeAddress {
                hostname: node.plan.name.clone(),
                ip: node.external_ip.clone().ok_or_else(|| {
                    HcpError::Topology(format!("node {} has no external address", node.plan.name))
                })?,
                internal_ip: node.internal_ip.clone().ok_or_else(|| {
                    HcpError::Topology(format!("node {} has no internal address", node.plan.name))
                })?,
            };

            match node.plan.role {
                NodeRole::Master if master.is_some() => {
                    return Err(HcpError::Topology(
                        "more than one node carries the master role".into(),
                    ));
                }
                NodeRole::Master => master = Some(address),
                NodeRole::Worker => slaves.push(address),
            }
        }

        let master =
            master.ok_or_else(|| HcpError::Topology("no node carries the master role".into()))?;
        Ok(Topology { master, slaves })
    }

    pub fn fs_default_name(&self) -> String {
        format!("hdfs://{}:8020", self.master.hostname)
    }

    pub fn job_tracker(&self) -> String {
        format!("{}:8021", self.master.hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Process, ProcessProperty};

    fn entry(type_name: &str, role: NodeRole, template: &str, count: usize) -> PlanEntry {
        let node_type = NodeType::new(
            type_name,
            role,
            vec![Process::new(
                "job_tracker",
                vec![ProcessProperty::optional("heap_size", Some("896"))],
            )],
        );
        let template =
            NodeTemplate::build(template, &node_type, "t1", "m1.small", ProcessConfigs::new())
                .unwrap();
        PlanEntry {
            template,
            node_type,
            flavor: Flavor {
                id: "2".into(),
                name: "m1.small".into(),
            },
            count,
        }
    }

    fn launched(plan: PlannedNode, n: u8) -> LaunchedNode {
        LaunchedNode {
            plan,
            instance_id: format!("vm-{}", n),
            internal_ip: Some(format!("10.0.0.{}", n)),
            external_ip: Some(format!("172.24.4.{}", n)),
        }
    }

    #[test]
    fn naming_is_deterministic() {
        let entries = vec![
            entry("JT+NN", NodeRole::Master, "jt_nn.small", 1),
            entry("TT+DN", NodeRole::Worker, "tt_dn.small", 2),
            entry("TT", NodeRole::Worker, "tt.small", 1),
        ];

        let first = build_plan("c1", &entries);
        let second = build_plan("c1", &entries);

        let names: Vec<&str> = first.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["c1-master", "c1-1", "c1-2", "c1-3"]);
        assert_eq!(first, second);
        assert_eq!(first[3].template_name, "tt.small");
    }

    #[test]
    fn worker_index_is_shared_across_templates() {
        let entries = vec![
            entry("TT+DN", NodeRole::Worker, "a", 1),
            entry("JT+NN", NodeRole::Master, "b", 1),
            entry("TT+DN", NodeRole::Worker, "c", 1),
        ];
        let names: Vec<String> = build_plan("x", &entries).into_iter().map(|n| n.name).collect();
        assert_eq!(names, ["x-1", "x-master", "x-2"]);
    }

    #[test]
    fn master_count_checked_before_launch() {
        let none = build_plan("c1", &[entry("TT+DN", NodeRole::Worker, "w", 2)]);
        assert!(matches!(check_master_count(&none), Err(HcpError::Planning(_))));

        let two = build_plan("c1", &[entry("JT+NN", NodeRole::Master, "m", 2)]);
        assert!(matches!(check_master_count(&two), Err(HcpError::Planning(_))));
    }

    #[test]
    fn topology_needs_exactly_one_master() {
        let master = build_plan("c1", &[entry("JT+NN", NodeRole::Master, "m", 1)]).remove(0);
        let workers = build_plan("c1", &[entry("TT+DN", NodeRole::Worker, "w", 2)]);

        let zero: Vec<LaunchedNode> = workers
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, p)| launched(p, i as u8 + 2))
            .collect();
        assert!(matches!(Topology::resolve(&zero), Err(HcpError::Topology(_))));

        let two = vec![launched(master.clone(), 1), launched(master.clone(), 2)];
        assert!(matches!(Topology::resolve(&two), Err(HcpError::Topology(_))));

        let mut one = vec![launched(master, 1)];
        one.extend(zero);
        let topology = Topology::resolve(&one).unwrap();
        assert_eq!(topology.master.hostname, "c1-master");
        assert_eq!(topology.master.ip, "172.24.4.1");
        assert_eq!(topology.slaves.len(), 2);
        assert_eq!(topology.fs_default_name(), "hdfs://c1-master:8020");
        assert_eq!(topology.job_tracker(), "c1-master:8021");
    }
}
