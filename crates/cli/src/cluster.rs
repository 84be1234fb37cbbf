use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use comfy_table::{Cell, Table};
use hcp_core::model::{Cluster, ClusterRequest, ClusterStatus, ClusterView};
use hcp_core::{ClusterStore, HcpError, RequestContext, StateStore};

use crate::app::App;
use crate::config;
use crate::spinner::create_spinner;

type CliResult = Result<(), Box<dyn std::error::Error>>;

const STATUS_POLL: Duration = Duration::from_millis(500);

/// Parses repeated `template=count` arguments.
pub fn parse_node_counts(args: &[String]) -> Result<BTreeMap<String, usize>, String> {
    let mut counts = BTreeMap::new();
    for arg in args {
        let (template, count) = arg
            .split_once('=')
            .ok_or_else(|| format!("expected template=count, got '{}'", arg))?;
        let count: usize = count
            .parse()
            .map_err(|_| format!("invalid count '{}' for template '{}'", count, template))?;
        if counts.insert(template.to_string(), count).is_some() {
            return Err(format!("template '{}' given more than once", template));
        }
    }
    Ok(counts)
}

/// Looks a cluster up by id, falling back to its name.
async fn resolve_cluster(store: &dyn ClusterStore, reference: &str) -> Result<Cluster, HcpError> {
    match store.get_cluster(reference).await {
        Err(e) if e.is_not_found() => store
            .list_clusters(None)
            .await?
            .into_iter()
            .find(|c| c.name == reference)
            .ok_or(e),
        other => other,
    }
}

pub async fn handle_create_cluster(
    name: String,
    image: String,
    nodes: Vec<String>,
    tenant: Option<String>,
) -> CliResult {
    let spinner = create_spinner();

    spinner.set_message("Parsing configuration...");
    let config = config::parse_config()?;
    let tenant = config.tenant(tenant)?;
    let request = ClusterRequest {
        name: name.clone(),
        base_image_id: image,
        tenant_id: tenant.clone(),
        node_counts: parse_node_counts(&nodes)?,
    };
    let app = App::new(&config)?;

    spinner.set_message("Registering cluster...");
    let view = app
        .manager
        .create_cluster(RequestContext::for_tenant(&tenant), request)
        .await?;

    // The job runs in this process. Ctrl-C marks the cluster Error so the job
    // stops and terminates what it has not registered before we exit.
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    let mut interrupted = false;
    let started = Instant::now();
    loop {
        let cluster = app.store.get_cluster(&view.id).await?;
        if cluster.status != ClusterStatus::Starting {
            break;
        }
        if !interrupted {
            let elapsed = Duration::from_secs(started.elapsed().as_secs());
            spinner.set_message(format!(
                "Provisioning cluster {} ({})...",
                name,
                humantime::format_duration(elapsed)
            ));
        }
        tokio::select! {
            _ = tokio::time::sleep(STATUS_POLL) => {}
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                spinner.set_message(format!("Interrupted, stopping cluster {}...", name));
                app.manager.interrupt(&view.id).await?;
            }
        }
    }

    spinner.set_message("Waiting for provisioning to finish...");
    app.manager.wait(&view.id).await?;
    let view = match app.store.cluster_view(&view.id).await {
        Ok(view) => view,
        Err(e) if e.is_not_found() => {
            spinner.finish_and_clear();
            return Err(format!("Cluster {} was deleted while provisioning", name).into());
        }
        Err(e) => return Err(e.into()),
    };

    if view.status == ClusterStatus::Active {
        spinner.finish_with_message(format!("Cluster {} is active!", name));
        print_view(&app.store, &view).await;
        Ok(())
    } else {
        spinner.finish_and_clear();
        print_view(&app.store, &view).await;
        Err(format!(
            "Cluster {} is {}: {}",
            name,
            view.status,
            view.status_description.as_deref().unwrap_or("no details")
        )
        .into())
    }
}

pub async fn handle_show_cluster(reference: String) -> CliResult {
    let store = StateStore::open_default()?;
    let cluster = resolve_cluster(&store, &reference).await?;
    let view = store.cluster_view(&cluster.id).await?;
    print_view(&store, &view).await;
    Ok(())
}

pub async fn handle_delete_cluster(reference: String) -> CliResult {
    let spinner = create_spinner();

    spinner.set_message("Parsing configuration...");
    let config = config::parse_config()?;
    let app = App::new(&config)?;

    spinner.set_message("Locating cluster...");
    let cluster = resolve_cluster(app.store.as_ref(), &reference).await?;

    spinner.set_message(format!("Deleting cluster {}...", cluster.name));
    let teardown = app
        .manager
        .delete_cluster(RequestContext::for_tenant(&cluster.tenant_id), &cluster.id)
        .await?;
    teardown.await??;

    spinner.finish_with_message(format!("Cluster {} deleted successfully!", cluster.name));
    Ok(())
}

async fn print_view(store: &StateStore, view: &ClusterView) {
    println!("Name:    {}", view.name);
    println!("ID:      {}", view.id);
    println!("Status:  {}", view.status);
    if let Some(description) = &view.status_description {
        println!("Details: {}", description);
    }
    println!("Image:   {}", view.base_image_id);
    println!("Tenant:  {}", view.tenant_id);

    let mut counts = Table::new();
    counts.set_header(vec!["Template", "Requested", "Registered"]);
    for (template_name, requested) in &view.node_counts {
        let registered = match store.find_node_template(template_name).await {
            Ok(template) => view
                .nodes
                .iter()
                .filter(|n| n.node_template_id == template.id)
                .count(),
            Err(_) => 0,
        };
        counts.add_row(vec![
            Cell::new(template_name),
            Cell::new(requested),
            Cell::new(registered),
        ]);
    }
    println!("{}", counts);

    if !view.nodes.is_empty() {
        let mut nodes = Table::new();
        nodes.set_header(vec!["Node", "VM ID", "Internal IP", "External IP"]);
        for node in &view.nodes {
            nodes.add_row(vec![
                Cell::new(&node.name),
                Cell::new(&node.vm_id),
                Cell::new(node.internal_ip.as_deref().unwrap_or("-")),
                Cell::new(node.external_ip.as_deref().unwrap_or("-")),
            ]);
        }
        println!("\nNodes");
        println!("{}", nodes);
    }

    if !view.service_urls.is_empty() {
        println!("\nServices");
        for (service, url) in &view.service_urls {
            println!("  {:<12} {}", service, url);
        }
    }
}
