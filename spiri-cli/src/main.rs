use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tabled::{Table, Tabled};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use spiri_engine::{
    sim, DockerEngine, EngineClient, FleetRegistry, RegistryProxy, SdkPaths, Settings,
};

#[derive(Parser)]
#[command(name = "spiri")]
#[command(about = "Robot fleet lifecycle manager", long_about = None)]
struct Cli {
    /// SDK root directory (data, robot definitions, caches).
    /// Defaults to $SPIRI_SDK_ROOT, then the working directory.
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Skip the shared registry mirror proxy
    #[arg(long)]
    no_proxy: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reattach all persisted instances and run until interrupted
    Up,

    /// Create and start a new robot instance
    Create {
        /// Robot type (must match a directory under <root>/robots)
        robot_type: String,

        /// Numeric system id, unique across active instances
        sys_id: u32,

        /// Extra config entries, KEY=VALUE (repeatable)
        #[arg(short, long = "option", value_name = "KEY=VALUE")]
        options: Vec<String>,
    },

    /// List all instances with their status
    List,

    /// Show one instance's status
    Status {
        /// Instance name (<robot_type>_<sys_id>)
        name: String,
    },

    /// Start an instance and its services
    Start { name: String },

    /// Stop an instance's services and its nested engine
    Stop { name: String },

    /// Restart an instance
    Restart { name: String },

    /// Stop an instance and delete its persisted data
    Delete { name: String },

    /// Read or write one instance config entry
    Env {
        name: String,
        key: String,
        /// New value; omit to read
        value: Option<String>,
    },

    /// Show an instance's IP address
    Ip { name: String },

    /// Spawn a robot model into a running simulator world
    Spawn {
        world: String,
        model_file: String,
        name: String,
        #[arg(short, default_value = "0")]
        x: f64,
        #[arg(short, default_value = "0")]
        y: f64,
        #[arg(short, default_value = "0")]
        z: f64,
    },

    /// List simulator worlds running on this host
    Worlds,
}

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
}

fn parse_options(pairs: &[String]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut options = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("option {pair:?} is not KEY=VALUE");
        };
        options.insert(key.to_string(), value.to_string());
    }
    Ok(options)
}

fn build_registry(cli: &Cli) -> anyhow::Result<FleetRegistry> {
    let paths = match &cli.root {
        Some(root) => SdkPaths::new(root),
        None => SdkPaths::from_env(),
    };
    std::fs::create_dir_all(paths.data_dir())?;

    let engine: Arc<dyn EngineClient> =
        Arc::new(DockerEngine::connect().context("connecting to container engine")?);

    let proxy = if cli.no_proxy {
        None
    } else {
        let settings = Settings::open(paths.root())?;
        let credentials = settings.registry_credentials()?;
        Some(Arc::new(RegistryProxy::new(engine.clone(), &credentials)))
    };

    Ok(FleetRegistry::new(engine, paths, proxy))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("spiri_engine=info".parse()?)
                .add_directive("spiri=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Up => {
            let registry = build_registry(&cli)?;
            registry.reattach_all().await?;
            info!("Fleet up; press Ctrl-C to shut down");
            tokio::signal::ctrl_c().await?;
            registry.shutdown().await;
        }

        Commands::Create {
            robot_type,
            sys_id,
            options,
        } => {
            let registry = build_registry(&cli)?;
            let options = parse_options(options)?;
            let name = registry.create(robot_type, *sys_id, &options).await?;
            println!("{name}");
        }

        Commands::List => {
            let registry = build_registry(&cli)?;
            registry.load_persisted().await?;
            let rows: Vec<InstanceRow> = registry
                .statuses()
                .await
                .into_iter()
                .map(|(name, status)| InstanceRow {
                    name,
                    status: status.to_string(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }

        Commands::Status { name } => {
            let registry = build_registry(&cli)?;
            registry.load_persisted().await?;
            println!("{}", registry.status(name).await);
        }

        Commands::Start { name } => {
            let registry = build_registry(&cli)?;
            registry.load_persisted().await?;
            registry.start(name).await?;
        }

        Commands::Stop { name } => {
            let registry = build_registry(&cli)?;
            registry.load_persisted().await?;
            registry.stop(name).await?;
        }

        Commands::Restart { name } => {
            let registry = build_registry(&cli)?;
            registry.load_persisted().await?;
            registry.restart(name).await?;
        }

        Commands::Delete { name } => {
            let registry = build_registry(&cli)?;
            registry.load_persisted().await?;
            registry.delete(name).await?;
        }

        Commands::Env { name, key, value } => {
            let registry = build_registry(&cli)?;
            registry.load_persisted().await?;
            match value {
                Some(value) => registry.set_env(name, key, value)?,
                None => match registry.env(name, key)? {
                    Some(value) => println!("{value}"),
                    None => error!(key = %key, "Not set"),
                },
            }
        }

        Commands::Ip { name } => {
            let registry = build_registry(&cli)?;
            registry.load_persisted().await?;
            println!("{}", registry.ip(name).await?);
        }

        Commands::Spawn {
            world,
            model_file,
            name,
            x,
            y,
            z,
        } => {
            let request = sim::SpawnRequest {
                world: world.clone(),
                model_file: model_file.clone(),
                name: name.clone(),
                x: *x,
                y: *y,
                z: *z,
            };
            sim::spawn_model(&request).await?;
        }

        Commands::Worlds => {
            for world in sim::running_worlds().await {
                println!("{world}");
            }
        }
    }

    Ok(())
}
