//! Seed/leech transfer fixtures across two or three nodes

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use tokio::fs;

use super::TestRun;
use super::identity::assign_identities;
use crate::FixtureError;
use crate::content::{ContentDescriptor, ContentGenerator, ContentLayout, ContentStorage};
use crate::engine::{
    AddContentParams, ContentSource, EventMask, MixedMode, Node, PeerClassFilter, SettingsPack,
    TransferFlags, TransferHandle,
};
use crate::network::loopback;
use crate::replay::wait_for_downloading;

/// File name of the content generated when a scenario supplies none.
pub const DEFAULT_CONTENT_NAME: &str = "temporary";

/// Pieces in the generated default content.
const DEFAULT_PIECE_COUNT: u64 = 9;

/// Part a node plays in a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Has all data up front
    Seed,
    /// Starts without data
    Leech,
}

/// Scenario knobs for [`setup_transfer`].
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Remove leftover content from the leech directories
    pub clear_files: bool,
    /// Give node 2 only the info hash so it must fetch metadata from peers
    pub use_metadata_transfer: bool,
    pub connect_peers: bool,
    /// Appended to every node directory name
    pub suffix: String,
    /// Piece size of generated default content
    pub piece_size: u32,
    /// Content to use instead of generating the default
    pub content: Option<Arc<ContentDescriptor>>,
    /// Alternate content handed to node 2
    pub leech_content: Option<Arc<ContentDescriptor>>,
    pub super_seeding: bool,
    /// Flags every add starts from; unpaused and unmanaged when unset
    pub base_flags: Option<TransferFlags>,
    /// Disable local service discovery on every node
    pub stop_lsd: bool,
    /// Connect to TLS listen ports where the node has one
    pub use_tls_ports: bool,
    pub third_node_role: Role,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            clear_files: true,
            use_metadata_transfer: false,
            connect_peers: true,
            suffix: String::new(),
            piece_size: 16 * 1024,
            content: None,
            leech_content: None,
            super_seeding: false,
            base_flags: None,
            stop_lsd: true,
            use_tls_ports: false,
            third_node_role: Role::Leech,
        }
    }
}

/// Transfer handles per node; all `None` when the seed could not add content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferHandles {
    pub seed: Option<TransferHandle>,
    pub leech: Option<TransferHandle>,
    pub third: Option<TransferHandle>,
}

impl TransferHandles {
    pub fn is_empty(&self) -> bool {
        self.seed.is_none() && self.leech.is_none() && self.third.is_none()
    }
}

/// Assembled nodes, content and topology of one scenario.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub handles: TransferHandles,
    pub content: Arc<ContentDescriptor>,
    /// Role of each node, by position
    pub roles: Vec<Role>,
    /// Connections issued, as `(from, to)` node positions
    pub topology: Vec<(usize, usize)>,
    /// Save directory of each node, by position
    pub save_paths: Vec<PathBuf>,
}

/// Builds a seed/leech transfer between two or three nodes.
///
/// Node 1 seeds, node 2 leeches and node 3, when present, joins with
/// `third_node_role`. With `connect_peers` the fixture waits for each
/// downloading node to report it is downloading before issuing connects,
/// so no node is dialled before its transfer is ready.
///
/// If node 1 fails to add the content the returned fixture has empty
/// handles; callers should treat that as a test failure.
///
/// # Errors
///
/// - `FixtureError::Precondition` - Fewer than two or more than three nodes
/// - `FixtureError::DuplicateIdentity` - Nodes could not be given distinct identities
/// - `FixtureError::IdentityNotApplied` - A node ignored its assigned identity
/// - `FixtureError::Engine` - Settings, add-content on nodes 2/3 or connect failed
/// - `FixtureError::Content` - Default content could not be generated or written
pub async fn setup_transfer(
    run: &TestRun,
    nodes: &[Arc<dyn Node>],
    options: TransferOptions,
) -> Result<Fixture, FixtureError> {
    if !(2..=3).contains(&nodes.len()) {
        return Err(FixtureError::Precondition {
            reason: format!("setup_transfer needs 2 or 3 nodes, got {}", nodes.len()),
        });
    }
    let three_nodes = nodes.len() == 3;

    if options.stop_lsd {
        for node in nodes {
            node.apply_settings(SettingsPack {
                enable_lsd: Some(false),
                ..SettingsPack::default()
            })
            .await?;
        }
    }

    // Subject every peer, local or not, to the global class
    let filter = PeerClassFilter::global();
    for node in nodes {
        node.set_peer_class_filter(filter.clone()).await?;
    }

    let base_settings = SettingsPack {
        event_mask: Some(EventMask::ALL.without(EventMask::PROGRESS)),
        allow_multiple_connections_per_ip: three_nodes.then_some(true),
        mixed_mode: Some(MixedMode::PreferTcp),
        max_failcount: Some(1),
        ..SettingsPack::default()
    };
    assign_identities(nodes, &base_settings).await?;

    let save_paths: Vec<PathBuf> = (1..=nodes.len())
        .map(|index| run.node_dir(index, &options.suffix))
        .collect();

    let content = match &options.content {
        Some(content) => Arc::clone(content),
        None => generate_default_content(run, &options).await?,
    };

    let mut roles = vec![Role::Seed, Role::Leech];
    if three_nodes {
        roles.push(options.third_node_role);
    }

    let flags = options.base_flags.unwrap_or(TransferFlags {
        paused: false,
        auto_managed: false,
        ..TransferFlags::default()
    });

    let seed_params = AddContentParams {
        source: ContentSource::Metadata(Arc::clone(&content)),
        save_path: save_paths[0].clone(),
        flags: TransferFlags {
            seed_mode: true,
            super_seeding: options.super_seeding,
            ..flags
        },
    };
    let seed = match nodes[0].add_content(seed_params).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("{}: add content failed: {}", nodes[0].name(), e);
            return Ok(Fixture {
                handles: TransferHandles::default(),
                content,
                roles,
                topology: Vec::new(),
                save_paths,
            });
        }
    };

    let downloader_flags = TransferFlags {
        seed_mode: false,
        ..flags
    };

    let third = if three_nodes {
        let third_params = AddContentParams {
            source: ContentSource::Metadata(Arc::clone(&content)),
            save_path: save_paths[2].clone(),
            flags: TransferFlags {
                seed_mode: options.third_node_role == Role::Seed,
                ..downloader_flags
            },
        };
        Some(nodes[2].add_content(third_params).await?)
    } else {
        None
    };

    let leech_source = if options.use_metadata_transfer {
        ContentSource::InfoHash(content.info_hash)
    } else if let Some(leech_content) = &options.leech_content {
        ContentSource::Metadata(Arc::clone(leech_content))
    } else {
        ContentSource::Metadata(Arc::clone(&content))
    };
    let leech = nodes[1]
        .add_content(AddContentParams {
            source: leech_source,
            save_path: save_paths[1].clone(),
            flags: downloader_flags,
        })
        .await?;

    let mut topology = Vec::new();
    if options.connect_peers {
        let cap = run.config().events.downloading_timeout;
        wait_for_downloading(run.events(), nodes[1].as_ref(), nodes[1].name(), cap).await;

        let leech_port = connect_port(nodes[1].as_ref(), options.use_tls_ports);
        tracing::info!(
            "{}: connecting to {} on port {}",
            nodes[0].name(),
            nodes[1].name(),
            leech_port
        );
        nodes[0].connect_peer(&seed, loopback(leech_port)).await?;
        topology.push((0, 1));

        if let Some(third) = &third {
            // Let the first pair exchange pieces before the third node joins.
            // A seeding third node never reports downloading.
            if options.third_node_role == Role::Leech {
                wait_for_downloading(run.events(), nodes[2].as_ref(), nodes[2].name(), cap).await;
            }

            let leech_port = connect_port(nodes[1].as_ref(), options.use_tls_ports);
            let seed_port = connect_port(nodes[0].as_ref(), options.use_tls_ports);
            for (target, port) in [(1, leech_port), (0, seed_port)] {
                tracing::info!("{}: connecting to port {}", nodes[2].name(), port);
                nodes[2].connect_peer(third, loopback(port)).await?;
                topology.push((2, target));
            }
        }
    }

    Ok(Fixture {
        handles: TransferHandles {
            seed: Some(seed),
            leech: Some(leech),
            third,
        },
        content,
        roles,
        topology,
        save_paths,
    })
}

/// Listen port to dial, preferring the TLS port when requested.
fn connect_port(node: &dyn Node, use_tls: bool) -> u16 {
    let tls_port = if use_tls { node.tls_listen_port() } else { 0 };
    if tls_port != 0 {
        tracing::debug!("{}: TLS listen port {}", node.name(), tls_port);
        return tls_port;
    }
    let port = node.listen_port();
    tracing::debug!("{}: listen port {}", node.name(), port);
    port
}

/// Generates the nine-piece default content into the seed directory.
async fn generate_default_content(
    run: &TestRun,
    options: &TransferOptions,
) -> Result<Arc<ContentDescriptor>, FixtureError> {
    let piece_size = options.piece_size;
    let layout = ContentLayout::single_file(
        DEFAULT_CONTENT_NAME,
        DEFAULT_PIECE_COUNT * u64::from(piece_size),
        piece_size,
    )?;
    let generated = ContentGenerator::new(0).generate_layout(DEFAULT_CONTENT_NAME, layout)?;

    let seed_dir = run.node_dir(1, &options.suffix);
    fs::create_dir_all(&seed_dir).await?;
    let layout = Arc::new(generated.descriptor.layout.clone());
    ContentStorage::new(&seed_dir, Arc::clone(&layout))
        .write_all(&generated.pieces)
        .await?;

    if options.clear_files {
        // Leech directories 2 and 3, whether or not a third node takes part
        for index in [2, 3] {
            clear_content(&run.node_dir(index, &options.suffix), &layout).await?;
        }
    }

    tracing::info!(
        "Generated content {} in {}",
        generated.descriptor.info_hash,
        seed_dir.join(DEFAULT_CONTENT_NAME).display()
    );
    Ok(generated.descriptor)
}

/// Removes the top-level entries of `layout` below `dir`.
async fn clear_content(dir: &Path, layout: &ContentLayout) -> Result<(), FixtureError> {
    let mut roots: Vec<PathBuf> = layout
        .files()
        .iter()
        .filter_map(|file| match file.path.components().next() {
            Some(Component::Normal(first)) => Some(dir.join(first)),
            _ => None,
        })
        .collect();
    roots.dedup();

    for path in roots {
        let result = match fs::symlink_metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => tracing::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
