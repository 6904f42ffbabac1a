// ABOUTME: Entry point for the shipyard CLI application.
// ABOUTME: Parses arguments, wires provider, registry and state store into the controller, and reports the outcome.

mod cli;

use clap::Parser;
use cli::{Cli, Commands, DatabaseCommand, NodeCommand, ServiceArgs};
use futures::StreamExt;
use shipyard::config::{self, Config};
use shipyard::controller::{Intent, Outcome, ServiceController};
use shipyard::diagnostics::Diagnostics;
use shipyard::error::{Error, Result};
use shipyard::output::{Output, OutputMode};
use shipyard::provider::{DatabaseSpec, DigitalOceanProvider, LogStream, MANAGED_TAG, NodeSpec};
use shipyard::registry::DockerRegistry;
use shipyard::state::{ServiceSpec, StateStore};
use shipyard::types::{DatabaseId, NodeId, ServiceName};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

type Controller = ServiceController<DigitalOceanProvider, DockerRegistry>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("shipyard=debug,info")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.debug)
        .with_writer(std::io::stderr)
        .init();

    let output = Output::new(output_mode(&cli.command));
    let mut diag = Diagnostics::default();

    let result = tokio::select! {
        result = run(cli, &output, &mut diag) => result,
        _ = tokio::signal::ctrl_c() => Err(Error::Interrupted),
    };

    output.warnings(&diag);
    if let Err(e) = result {
        output.error(&e);
        std::process::exit(e.exit_code());
    }
}

fn output_mode(command: &Commands) -> OutputMode {
    let json = match command {
        Commands::Services { json } => *json,
        Commands::Node(NodeCommand::List { json }) => *json,
        Commands::Database(DatabaseCommand::List { json }) => *json,
        _ => false,
    };
    if json {
        OutputMode::Json
    } else {
        OutputMode::Normal
    }
}

async fn run(cli: Cli, output: &Output, diag: &mut Diagnostics) -> Result<()> {
    let cwd = env::current_dir()?;

    if let Commands::Bootstrap { force } = cli.command {
        return bootstrap(&cwd, force, output).await;
    }

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::discover(&cwd)?,
    };

    let log_file = match &cli.command {
        Commands::Log { filename, .. } => filename.clone(),
        _ => None,
    };

    let intent = intent(cli.command, &config)?;
    let controller = connect(&config)?;
    let outcome = controller.handle(intent, diag).await?;
    report(outcome, log_file.as_deref(), output).await
}

async fn bootstrap(dir: &Path, force: bool, output: &Output) -> Result<()> {
    let path = config::bootstrap_config(dir, force)?;
    output.progress(&format!("wrote {}", path.display()));

    let config = Config::load(&path)?;
    let state_dir = config.state_dir()?;
    StateStore::open(&state_dir)?;
    output.progress(&format!("state directory {}", state_dir.display()));

    let registry = DockerRegistry::connect(None)?;
    registry.ping().await?;
    output.success("local Docker daemon is reachable");
    Ok(())
}

fn connect(config: &Config) -> Result<Controller> {
    let provider = DigitalOceanProvider::new(config.provider_settings()?)?;
    let registry = DockerRegistry::connect(config.registry_credentials()?)?;
    let store = StateStore::open(config.state_dir()?)?;
    Ok(ServiceController::new(
        Arc::new(provider),
        Arc::new(registry),
        store,
        config.reconciler_settings()?,
    ))
}

/// Validate command arguments into an intent before anything remote happens.
fn intent(command: Commands, config: &Config) -> Result<Intent> {
    let intent = match command {
        Commands::Bootstrap { .. } => {
            return Err(Error::InvalidConfig("bootstrap has no intent".to_string()));
        }
        Commands::Build { target, tag } => {
            let (_, mut spec) = service(config, &target)?;
            if let Some(tag) = tag {
                spec.image = spec.image.with_tag(&tag);
            }
            Intent::Build { spec }
        }
        Commands::Launch {
            target,
            size,
            region,
            force,
        } => {
            let (name, mut spec) = service(config, &target)?;
            if let Some(size) = size {
                spec.node.size = size;
            }
            if let Some(region) = region {
                spec.node.region = region;
            }
            Intent::Launch { name, spec, force }
        }
        Commands::Redeploy { target, force } => {
            let (name, spec) = service(config, &target)?;
            Intent::Redeploy { name, spec, force }
        }
        Commands::Terminate { target, force } => Intent::Terminate {
            name: service_name(&target)?,
            force,
        },
        Commands::Log { target, tail, .. } => Intent::Log {
            name: service_name(&target)?,
            tail,
        },
        Commands::Services { .. } => Intent::List,
        Commands::Node(NodeCommand::List { .. }) => Intent::NodeList,
        Commands::Node(NodeCommand::Create {
            name,
            size,
            region,
            node_type,
        }) => Intent::NodeCreate {
            spec: NodeSpec {
                name,
                size: size.unwrap_or_else(|| config.provider.default_size.clone()),
                region: region.unwrap_or_else(|| config.provider.region.clone()),
                image: node_type.unwrap_or_else(|| config.provider.node_image.clone()),
                ssh_keys: config.provider.ssh_keys.clone(),
                tags: vec![MANAGED_TAG.to_string()],
            },
        },
        Commands::Node(NodeCommand::Destroy { id }) => Intent::NodeDestroy {
            id: NodeId::new(id),
        },
        Commands::Database(DatabaseCommand::List { .. }) => Intent::DatabaseList,
        Commands::Database(DatabaseCommand::Create {
            name,
            engine,
            version,
            size,
            region,
        }) => Intent::DatabaseCreate {
            spec: DatabaseSpec {
                name,
                engine,
                version,
                size,
                region: region.unwrap_or_else(|| config.provider.region.clone()),
                num_nodes: 1,
                tags: vec![MANAGED_TAG.to_string()],
            },
        },
        Commands::Database(DatabaseCommand::Destroy { id }) => Intent::DatabaseDestroy {
            id: DatabaseId::new(id),
        },
    };
    Ok(intent)
}

fn service(config: &Config, target: &ServiceArgs) -> Result<(ServiceName, ServiceSpec)> {
    config.service(&target.service, target.colour.as_deref())
}

fn service_name(target: &ServiceArgs) -> Result<ServiceName> {
    let base = ServiceName::new(&target.service)?;
    match &target.colour {
        Some(colour) => Ok(base.with_colour(colour)?),
        None => Ok(base),
    }
}

async fn report(outcome: Outcome, log_file: Option<&Path>, output: &Output) -> Result<()> {
    match outcome {
        Outcome::Deployed(record) => {
            let ip = record
                .node()
                .and_then(|n| n.ip_address.clone())
                .unwrap_or_else(|| "-".to_string());
            output.success(&format!("{} is {} on {}", record.name, record.status, ip));
        }
        Outcome::Terminated { name, report: None } => {
            output.success(&format!("{} was not deployed; nothing to do", name));
        }
        Outcome::Terminated {
            name,
            report: Some(report),
        } => {
            output.progress(&format!("record archived to {}", report.archived.display()));
            output.success(&format!("{} terminated", name));
        }
        Outcome::Log(stream) => match log_file {
            Some(path) => {
                save_log(stream, path).await?;
                output.success(&format!("log saved to {}", path.display()));
            }
            None => print_log(stream).await?,
        },
        Outcome::Services(records) => output.services(&records),
        Outcome::Built(image) => output.value("image", &image.to_string()),
        Outcome::Nodes(nodes) => output.nodes(&nodes),
        Outcome::NodeCreated(node) => {
            output.success(&format!("created node {} ({})", node.id, node.name))
        }
        Outcome::NodeDestroyed(id) => output.success(&format!("deleted node {}", id)),
        Outcome::Databases(databases) => output.databases(&databases),
        Outcome::DatabaseCreated(db) => {
            output.success(&format!("created database {} ({})", db.id, db.name))
        }
        Outcome::DatabaseDestroyed(id) => output.success(&format!("deleted database {}", id)),
    }
    Ok(())
}

async fn print_log(mut stream: LogStream) -> Result<()> {
    while let Some(line) = stream.next().await {
        println!("{}", line?);
    }
    Ok(())
}

async fn save_log(mut stream: LogStream, path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    while let Some(line) = stream.next().await {
        file.write_all(line?.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await?;
    Ok(())
}
