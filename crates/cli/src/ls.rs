use chrono::DateTime;
use comfy_table::{Cell, Table};
use hcp_core::{ClusterStore, StateStore};

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn format_timestamp(raw: &str) -> String {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        Err(_) => raw.to_string(),
    }
}

pub async fn handle_ls_command(tenant: Option<String>) -> CliResult {
    let store = StateStore::open_default()?;
    let clusters = store.list_clusters(tenant.as_deref()).await?;
    if clusters.is_empty() {
        println!("No clusters found.");
        return Ok(());
    }

    let mut cluster_table = Table::new();
    cluster_table.set_header(vec!["ID", "Name", "Status", "Nodes", "Tenant", "Created At"]);
    let mut node_table = Table::new();
    node_table.set_header(vec!["Node", "Cluster", "VM ID", "Internal IP", "External IP"]);
    let mut node_rows = 0;

    for cluster in &clusters {
        let nodes = store.list_nodes(&cluster.id).await?;
        let requested: usize = cluster.node_counts.values().sum();
        cluster_table.add_row(vec![
            Cell::new(&cluster.id),
            Cell::new(&cluster.name),
            Cell::new(cluster.status.to_string()),
            Cell::new(format!("{}/{}", nodes.len(), requested)),
            Cell::new(&cluster.tenant_id),
            Cell::new(format_timestamp(&cluster.created_at)),
        ]);

        for node in &nodes {
            node_rows += 1;
            node_table.add_row(vec![
                Cell::new(&node.name),
                Cell::new(&cluster.name),
                Cell::new(&node.vm_id),
                Cell::new(node.internal_ip.as_deref().unwrap_or("-")),
                Cell::new(node.external_ip.as_deref().unwrap_or("-")),
            ]);
        }
    }

    println!("Clusters");
    println!("{}", cluster_table);
    if node_rows > 0 {
        println!("\nNodes");
        println!("{}", node_table);
    }
    Ok(())
}
