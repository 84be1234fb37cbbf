use clap::{Parser, Subcommand};

mod app;
mod catalog;
mod cluster;
mod config;
mod logging;
mod ls;
mod spinner;

#[derive(Parser, Debug)]
#[command(name = "hcp")]
#[command(about = "HCP - Provision Hadoop clusters on an OpenStack cloud")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the default node types and templates
    Init {
        #[arg(short, long)]
        tenant: Option<String>,
    },
    // Inspect node types
    NodeType {
        #[command(subcommand)]
        action: NodeTypeAction,
    },
    // Manage node templates
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
    // Manage clusters
    Cluster {
        #[command(subcommand)]
        action: ClusterAction,
    },
    /// List all clusters and their nodes
    Ls {
        #[arg(short, long)]
        tenant: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum NodeTypeAction {
    /// List node types
    Ls,
}

#[derive(Subcommand, Debug)]
enum TemplateAction {
    /// Create a node template
    Create {
        #[arg(short, long)]
        name: String,
        /// Name of the node type, e.g. "JT+NN"
        #[arg(long)]
        node_type: String,
        /// Flavor name or id
        #[arg(short, long)]
        flavor: String,
        /// Process setting as process.property=value, repeatable
        #[arg(short, long = "config")]
        configs: Vec<String>,
        #[arg(short, long)]
        tenant: Option<String>,
    },
    /// List node templates
    Ls {
        #[arg(short, long)]
        tenant: Option<String>,
    },
    /// Show a node template and its settings
    Show {
        name: String,
    },
    /// Delete a node template that no cluster uses
    Delete {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum ClusterAction {
    /// Create a cluster and wait until it is provisioned
    Create {
        #[arg(short, long)]
        name: String,
        /// Base image id
        #[arg(short, long)]
        image: String,
        /// Node count as template=count, repeatable
        #[arg(long = "nodes", required = true)]
        nodes: Vec<String>,
        #[arg(short, long)]
        tenant: Option<String>,
    },
    /// Show a cluster by id or name
    Show {
        cluster: String,
    },
    /// Delete a cluster and terminate its VMs
    Delete {
        cluster: String,
    },
}

async fn run(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Init { tenant } => catalog::handle_init(tenant).await,
        Commands::NodeType { action } => match action {
            NodeTypeAction::Ls => catalog::handle_list_node_types().await,
        },
        Commands::Template { action } => match action {
            TemplateAction::Create {
                name,
                node_type,
                flavor,
                configs,
                tenant,
            } => catalog::handle_create_template(name, node_type, flavor, configs, tenant).await,
            TemplateAction::Ls { tenant } => catalog::handle_list_templates(tenant).await,
            TemplateAction::Show { name } => catalog::handle_show_template(name).await,
            TemplateAction::Delete { name } => catalog::handle_delete_template(name).await,
        },
        Commands::Cluster { action } => match action {
            ClusterAction::Create {
                name,
                image,
                nodes,
                tenant,
            } => cluster::handle_create_cluster(name, image, nodes, tenant).await,
            ClusterAction::Show { cluster } => cluster::handle_show_cluster(cluster).await,
            ClusterAction::Delete { cluster } => cluster::handle_delete_cluster(cluster).await,
        },
        Commands::Ls { tenant } => ls::handle_ls_command(tenant).await,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = match config::parse_config() {
        Ok(config) => config.log_level().to_string(),
        Err(_) => "info".to_string(),
    };
    if let Err(e) = logging::init(&level) {
        eprintln!("Warning: {}", e);
    }

    if let Err(e) = run(args.command).await {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
