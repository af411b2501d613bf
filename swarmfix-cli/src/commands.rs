//! CLI command implementations

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Subcommand, ValueEnum};
use swarmfix_core::content::{ContentGenerator, ContentStorage, DEFAULT_BASE_NAME};
use swarmfix_core::engine::{EventKind, Node, TransferHandle};
use swarmfix_core::replay::{ConsumePolicy, format_transfer_rates};
use swarmfix_core::{
    FixtureConfig, Role, ServiceKind, TestRun, TransferOptions, WebServerOptions, setup_transfer,
};
use swarmfix_sim::SimSwarm;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Generate deterministic content and print its descriptor as JSON
    Generate {
        /// Directory the files are written to
        #[arg(short, long)]
        out: PathBuf,
        /// Comma separated file sizes in bytes
        #[arg(long, value_delimiter = ',', default_value = "1000")]
        sizes: Vec<u64>,
        #[arg(long, default_value = "16384")]
        piece_size: u32,
        #[arg(long, default_value = "0")]
        seed: u64,
        /// Directory prefix of the generated files
        #[arg(long, default_value = DEFAULT_BASE_NAME)]
        name: String,
    },
    /// Start a helper service and keep it running
    Serve {
        #[arg(value_enum)]
        kind: ServiceArg,
        /// Serve over TLS (web server only)
        #[arg(long)]
        tls: bool,
        /// Use chunked transfer encoding (web server only)
        #[arg(long)]
        chunked: bool,
        /// Keep connections alive (web server only)
        #[arg(long)]
        keep_alive: bool,
        /// Seconds to keep the service up; runs until Ctrl-C when omitted
        #[arg(long)]
        hold: Option<u64>,
    },
    /// Run a transfer between in-process nodes
    Swarm {
        /// Number of nodes, 2 or 3
        #[arg(short, long, default_value = "2")]
        nodes: usize,
        /// Start the leech from the info hash only
        #[arg(long)]
        metadata: bool,
        /// Make the third node a seed instead of a leech
        #[arg(long)]
        third_seed: bool,
        #[arg(long, default_value = "16384")]
        piece_size: u32,
        /// Seconds to wait for the leech to finish
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
}

/// Helper service selectable on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ServiceArg {
    Socks4,
    Socks5,
    Socks5Password,
    Http,
    HttpPassword,
    WebServer,
}

impl ServiceArg {
    fn into_kind(self, options: WebServerOptions) -> ServiceKind {
        match self {
            ServiceArg::Socks4 => ServiceKind::Socks4,
            ServiceArg::Socks5 => ServiceKind::Socks5,
            ServiceArg::Socks5Password => ServiceKind::Socks5Password,
            ServiceArg::Http => ServiceKind::Http,
            ServiceArg::HttpPassword => ServiceKind::HttpPassword,
            ServiceArg::WebServer => ServiceKind::WebServer(options),
        }
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Generate {
            out,
            sizes,
            piece_size,
            seed,
            name,
        } => generate_content(out, sizes, piece_size, seed, name).await,
        Commands::Serve {
            kind,
            tls,
            chunked,
            keep_alive,
            hold,
        } => {
            let options = WebServerOptions {
                tls,
                chunked_encoding: chunked,
                keep_alive,
                min_interval: 0,
            };
            serve(kind.into_kind(options), hold.map(Duration::from_secs)).await
        }
        Commands::Swarm {
            nodes,
            metadata,
            third_seed,
            piece_size,
            timeout,
        } => {
            let options = TransferOptions {
                use_metadata_transfer: metadata,
                piece_size,
                third_node_role: if third_seed { Role::Seed } else { Role::Leech },
                ..TransferOptions::default()
            };
            run_swarm(nodes, options, Duration::from_secs(timeout)).await
        }
    }
}

/// Generate content files and print the descriptor
///
/// # Errors
/// - `ContentError::InvalidLayout` - Empty size list or zero piece size
/// - `ContentError::Io` - Files could not be written
pub async fn generate_content(
    out: PathBuf,
    sizes: Vec<u64>,
    piece_size: u32,
    seed: u64,
    name: String,
) -> anyhow::Result<()> {
    let content = ContentGenerator::new(seed)
        .with_base_name(name)
        .generate(&sizes, piece_size)?;
    let storage = ContentStorage::new(&out, Arc::new(content.descriptor.layout.clone()));
    storage.write_all(&content.pieces).await?;

    tracing::info!(
        "Wrote {} files under {}",
        content.descriptor.layout.files().len(),
        out.display()
    );
    println!("{}", serde_json::to_string_pretty(content.descriptor.as_ref())?);
    Ok(())
}

/// Start a helper and hold it until Ctrl-C or the hold time elapses
///
/// # Errors
/// - `FixtureError::Service` - No free port or the helper failed to spawn
pub async fn serve(kind: ServiceKind, hold: Option<Duration>) -> anyhow::Result<()> {
    let run = TestRun::from_env();
    let port = run.ensure_service(kind).await?;
    println!("{kind} listening on 127.0.0.1:{port}");

    match hold {
        Some(duration) => tokio::time::sleep(duration).await,
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
        }
    }

    let stopped = run.teardown().await;
    println!("Stopped {stopped} helper service(s)");
    Ok(())
}

/// Set up a seed/leech transfer between simulated nodes and watch it
///
/// # Errors
/// - `FixtureError::Precondition` - Node count outside 2..=3
/// - `FixtureError::Engine` - A node rejected settings or content
pub async fn run_swarm(
    node_count: usize,
    options: TransferOptions,
    timeout: Duration,
) -> anyhow::Result<()> {
    let work_dir = scratch_dir()?;
    let run = TestRun::new(FixtureConfig {
        work_dir: work_dir.clone(),
        ..FixtureConfig::from_env()
    });
    let swarm = SimSwarm::new(Arc::clone(run.ports()));
    let (_sim_nodes, nodes) = swarm.spawn_nodes(node_count, false)?;

    let started = Instant::now();
    let fixture = setup_transfer(&run, &nodes, options).await?;
    let Some(leech) = fixture.handles.leech else {
        anyhow::bail!("seed could not be added, no transfer to watch");
    };

    let finished = run
        .events()
        .wait_for_event_matching(
            nodes[1].as_ref(),
            "leech",
            ConsumePolicy::PopThroughMatch,
            tokio::time::Instant::now() + timeout,
            |event| event.kind == EventKind::TransferFinished,
        )
        .await;

    report_status(&nodes, &fixture.handles.seed, &leech, started).await?;
    run.teardown().await;

    println!(
        "Content {} ({} pieces) {}",
        fixture.content.info_hash,
        fixture.content.piece_count(),
        if finished.is_some() { "transferred" } else { "incomplete" }
    );
    println!("Work directory: {}", work_dir.display());
    Ok(())
}

async fn report_status(
    nodes: &[Arc<dyn Node>],
    seed: &Option<TransferHandle>,
    leech: &TransferHandle,
    started: Instant,
) -> anyhow::Result<()> {
    let mut statuses = Vec::new();
    if let Some(seed) = seed {
        statuses.push(nodes[0].transfer_status(seed).await?);
    }
    statuses.push(nodes[1].transfer_status(leech).await?);

    let refs: Vec<_> = statuses.iter().collect();
    println!("{}", format_transfer_rates(started.elapsed(), &refs));
    Ok(())
}

fn scratch_dir() -> anyhow::Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("swarmfix-{}", std::process::id()));
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir)
}
