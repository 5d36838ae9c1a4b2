//! Isilon provisioner binary

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use isilon_common::{AccessMode, ReclaimPolicy, VolumeClaimRequest, VolumeDescriptor};
use isilon_provisioner::backend::{BackendClient, IsilonClient, MemoryBackend};
use isilon_provisioner::config::ProvisionerConfig;
use isilon_provisioner::driver::{self, Command, Outcome};
use isilon_provisioner::quantity::{format_quantity, parse_quantity};
use isilon_provisioner::shutdown::ShutdownCoordinator;
use isilon_provisioner::Provisioner;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, env = "ISI_PROVISIONER_CONFIG")]
    config: Option<PathBuf>,

    /// Keep volumes in memory instead of talking to the appliance
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read JSON commands from stdin and write outcomes to stdout until EOF or SIGTERM
    Run,
    /// Provision a volume for one claim and print its descriptor
    Provision {
        /// Claim namespace
        namespace: String,
        /// Claim name
        claim: String,
        /// Persistent volume name
        volume: String,
        /// Requested capacity (e.g. 5Gi, 500M, 1073741824)
        #[arg(long)]
        capacity: Option<String>,
        /// Access mode (ReadWriteOnce, ReadOnlyMany, ReadWriteMany); repeatable
        #[arg(long = "access-mode", default_value = "ReadWriteMany")]
        access_modes: Vec<String>,
        /// Reclaim policy (Delete, Retain, Recycle)
        #[arg(long, default_value = "Delete")]
        reclaim_policy: String,
    },
    /// Delete the volume described by a descriptor JSON file
    Delete {
        /// Path to the descriptor printed by `provision`
        descriptor: PathBuf,
    },
    /// Print a sample configuration file
    Config,
}

fn load_config(cli: &Cli) -> Result<ProvisionerConfig> {
    let config = match cli.config {
        Some(ref path) => {
            let mut config = ProvisionerConfig::load_from_file(path)?;
            config.apply_env_overrides();
            config
        }
        None => ProvisionerConfig::load()?,
    };

    if cli.dry_run {
        if config.isilon.export_root.is_empty() {
            bail!("ISI_PATH not set");
        }
    } else {
        config.validate().context("Invalid configuration")?;
    }

    Ok(config)
}

fn connect(config: &ProvisionerConfig, dry_run: bool) -> Result<Arc<dyn BackendClient>> {
    if dry_run {
        info!("Dry run: volumes are kept in memory");
        return Ok(Arc::new(MemoryBackend::new()));
    }

    let client = IsilonClient::new(&config.isilon)?;
    info!("Connecting to Isilon at: {}", client.endpoint());
    info!("Creating exports at: {}", config.isilon.export_root);
    Ok(Arc::new(client))
}

fn claim_request(
    namespace: String,
    claim: String,
    volume: String,
    capacity: Option<String>,
    access_modes: Vec<String>,
    reclaim_policy: String,
) -> Result<VolumeClaimRequest> {
    let capacity_bytes = match capacity {
        Some(ref value) => {
            Some(parse_quantity(value).ok_or_else(|| anyhow!("Invalid capacity: {}", value))?)
        }
        None => None,
    };

    let access_modes = access_modes
        .iter()
        .map(|m| m.parse::<AccessMode>())
        .collect::<Result<Vec<_>, _>>()?;

    Ok(VolumeClaimRequest {
        namespace,
        claim_name: claim,
        volume_name: volume,
        capacity_bytes,
        access_modes,
        reclaim_policy: reclaim_policy.parse::<ReclaimPolicy>()?,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config = cli.command {
        print!("{}", ProvisionerConfig::generate_sample());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let _log_guard = config
        .logging
        .init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        "Starting Isilon Dynamic Provisioner version: {}",
        env!("CARGO_PKG_VERSION")
    );

    let backend = connect(&config, cli.dry_run)?;
    let provisioner = Arc::new(Provisioner::new(&config, backend));
    if provisioner.quota_enabled() {
        info!("Isilon quotas enabled");
    } else {
        info!("ISI_QUOTA_ENABLE not set. Quota support disabled");
    }
    info!(
        identity = provisioner.identity(),
        name = %config.provisioner.name,
        "Provisioner ready"
    );

    let shutdown = ShutdownCoordinator::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown.wait_for_signal().await {
                error!("Failed to register signal handlers: {}", e);
            }
        });
    }

    match cli.command {
        Commands::Run => {
            let handled = driver::serve(
                provisioner,
                tokio::io::stdin(),
                tokio::io::stdout(),
                shutdown,
            )
            .await?;
            info!(handled, "Command stream closed");
        }
        Commands::Provision {
            namespace,
            claim,
            volume,
            capacity,
            access_modes,
            reclaim_policy,
        } => {
            let request = claim_request(
                namespace,
                claim,
                volume,
                capacity,
                access_modes,
                reclaim_policy,
            )?;
            if let Some(bytes) = request.capacity_bytes {
                info!(capacity = %format_quantity(bytes), "Requested capacity");
            }
            let outcome = driver::execute(
                &provisioner,
                Command::Provision { request },
                &shutdown.subscribe(),
            )
            .await;
            report(outcome)?;
        }
        Commands::Delete { descriptor } => {
            let content = tokio::fs::read_to_string(&descriptor)
                .await
                .with_context(|| format!("Failed to read {}", descriptor.display()))?;
            let descriptor: VolumeDescriptor = match serde_json::from_str::<Outcome>(&content) {
                Ok(Outcome::Provisioned { descriptor, .. }) => descriptor,
                _ => serde_json::from_str(&content).context("Invalid volume descriptor")?,
            };
            let outcome = driver::execute(
                &provisioner,
                Command::Delete { descriptor },
                &shutdown.subscribe(),
            )
            .await;
            report(outcome)?;
        }
        // Printed before logging was set up
        Commands::Config => {}
    }

    Ok(())
}

/// Print the outcome; only real failures make the process exit non-zero
fn report(outcome: Outcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    match outcome {
        Outcome::Failed { error, .. } => bail!(error),
        _ => Ok(()),
    }
}
