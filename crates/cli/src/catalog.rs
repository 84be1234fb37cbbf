use std::collections::BTreeMap;

use comfy_table::{Cell, Table};
use hcp_core::defaults;
use hcp_core::model::{NodeTemplate, ProcessConfigs};
use hcp_core::{ClusterStore, StateStore};

use crate::config;

type CliResult = Result<(), Box<dyn std::error::Error>>;

pub async fn handle_init(tenant: Option<String>) -> CliResult {
    let config = config::parse_config()?;
    let tenant = config.tenant(tenant)?;
    let store = StateStore::open_default()?;
    let added = defaults::install(&store, &tenant).await?;
    if added == 0 {
        println!("Default catalog already installed.");
    } else {
        println!("Installed {} node types and templates for tenant {}.", added, tenant);
    }
    Ok(())
}

pub async fn handle_list_node_types() -> CliResult {
    let store = StateStore::open_default()?;
    let node_types = store.list_node_types().await?;
    if node_types.is_empty() {
        println!("No node types found. Run `hcp init` to install the defaults.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Name", "Role", "Processes", "ID"]);
    for node_type in &node_types {
        let processes: Vec<&str> = node_type.processes.iter().map(|p| p.name.as_str()).collect();
        table.add_row(vec![
            Cell::new(&node_type.name),
            Cell::new(node_type.role.to_string()),
            Cell::new(processes.join(", ")),
            Cell::new(&node_type.id),
        ]);
    }
    println!("{}", table);
    Ok(())
}

/// Parses repeated `process.property=value` arguments.
pub fn parse_configs(args: &[String]) -> Result<ProcessConfigs, String> {
    let mut configs: ProcessConfigs = BTreeMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("expected process.property=value, got '{}'", arg))?;
        let (process, property) = key
            .split_once('.')
            .ok_or_else(|| format!("expected process.property=value, got '{}'", arg))?;
        if process.is_empty() || property.is_empty() {
            return Err(format!("expected process.property=value, got '{}'", arg));
        }
        configs
            .entry(process.to_string())
            .or_default()
            .insert(property.to_string(), value.to_string());
    }
    Ok(configs)
}

pub async fn handle_create_template(
    name: String,
    node_type: String,
    flavor: String,
    configs: Vec<String>,
    tenant: Option<String>,
) -> CliResult {
    let config = config::parse_config()?;
    let tenant = config.tenant(tenant)?;
    let configs = parse_configs(&configs)?;

    let store = StateStore::open_default()?;
    let node_type = store.find_node_type(&node_type).await?;
    let template = NodeTemplate::build(&name, &node_type, &tenant, &flavor, configs)?;
    let id = template.id.clone();
    store.add_node_template(template).await?;

    println!("Created node template {} ({})", name, id);
    Ok(())
}

pub async fn handle_list_templates(tenant: Option<String>) -> CliResult {
    let store = StateStore::open_default()?;
    let templates = store.list_node_templates(tenant.as_deref()).await?;
    if templates.is_empty() {
        println!("No node templates found.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["Name", "Node Type", "Flavor", "Tenant", "ID"]);
    for template in &templates {
        let node_type = store
            .get_node_type(&template.node_type_id)
            .await
            .map(|t| t.name)
            .unwrap_or_else(|_| template.node_type_id.clone());
        table.add_row(vec![
            Cell::new(&template.name),
            Cell::new(node_type),
            Cell::new(&template.flavor_id),
            Cell::new(&template.tenant_id),
            Cell::new(&template.id),
        ]);
    }
    println!("{}", table);
    Ok(())
}

pub async fn handle_show_template(name: String) -> CliResult {
    let store = StateStore::open_default()?;
    let template = store.find_node_template(&name).await?;
    let node_type = store.get_node_type(&template.node_type_id).await?;

    println!("Name:      {}", template.name);
    println!("ID:        {}", template.id);
    println!("Node type: {} ({})", node_type.name, node_type.role);
    println!("Flavor:    {}", template.flavor_id);
    println!("Tenant:    {}", template.tenant_id);

    let mut table = Table::new();
    table.set_header(vec!["Process", "Property", "Value"]);
    for (process, properties) in &template.configs {
        for (property, value) in properties {
            table.add_row(vec![Cell::new(process), Cell::new(property), Cell::new(value)]);
        }
    }
    println!("{}", table);
    Ok(())
}

pub async fn handle_delete_template(name: String) -> CliResult {
    let store = StateStore::open_default()?;
    let template = store.find_node_template(&name).await?;
    store.delete_node_template(&template.id).await?;
    println!("Deleted node template {}", name);
    Ok(())
}
