//! Metadata and piece exchange between two connected simulated nodes

use std::sync::Arc;

use swarmfix_core::content::InfoHash;
use swarmfix_core::engine::Node;

use crate::node::SimNode;

/// Runs one connection: each side pulls whatever it lacks from the other.
pub(crate) async fn run(local: Arc<SimNode>, remote: Arc<SimNode>, info_hash: InfoHash) {
    pull(&local, &remote, info_hash).await;
    pull(&remote, &local, info_hash).await;
}

async fn pull(downloader: &SimNode, source: &SimNode, info_hash: InfoHash) {
    if downloader.metadata(info_hash).is_none() {
        let Some(descriptor) = source.metadata(info_hash) else {
            tracing::debug!(
                "{} and {} both lack metadata for {}",
                downloader.name(),
                source.name(),
                info_hash
            );
            return;
        };
        downloader.receive_metadata(info_hash, descriptor);
    }

    let mut transferred = 0u32;
    let mut rejected = Vec::new();
    loop {
        let mut available = source.available_pieces(info_hash);
        for index in &rejected {
            if let Some(offered) = available.get_mut(*index as usize) {
                *offered = false;
            }
        }
        let Some(index) = downloader.claim_missing(info_hash, &available) else {
            break;
        };

        match source.serve_piece(info_hash, index).await {
            Some(data) => {
                if downloader.store_piece(info_hash, index, data).await {
                    transferred += 1;
                } else {
                    rejected.push(index.as_u32());
                }
            }
            None => downloader.release_claim(info_hash, index),
        }
        tokio::task::yield_now().await;
    }

    if transferred > 0 {
        tracing::debug!(
            "{} pulled {} pieces of {} from {}",
            downloader.name(),
            transferred,
            info_hash,
            source.name()
        );
    }
}
