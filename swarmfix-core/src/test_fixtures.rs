//! Test fixtures for fixture and swarm testing.
//!
//! Provides scratch work directories and scripted node sets so tests
//! never write node directories into the source tree.

use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::Node;
use crate::engine::test_mocks::ScriptedNode;

/// Creates a temporary work directory for node `tmp<N>` directories.
///
/// # Panics
///
/// Panics if the temporary directory cannot be created.
/// This is acceptable in test fixtures where failures indicate environment issues.
pub fn create_temp_work_dir() -> (tempfile::TempDir, PathBuf) {
    let temp_dir = tempfile::tempdir().unwrap();
    let work_dir = temp_dir.path().to_path_buf();
    (temp_dir, work_dir)
}

/// Creates `count` scripted nodes listening on consecutive ports from `first_port`.
///
/// Returns the concrete nodes for inspection alongside trait objects for
/// fixture calls.
pub fn create_scripted_nodes(
    count: usize,
    first_port: u16,
) -> (Vec<Arc<ScriptedNode>>, Vec<Arc<dyn Node>>) {
    let scripted: Vec<_> = (0..count)
        .map(|i| {
            Arc::new(ScriptedNode::new(
                format!("node{}", i + 1),
                first_port + i as u16,
            ))
        })
        .collect();
    let nodes = scripted
        .iter()
        .map(|node| Arc::clone(node) as Arc<dyn Node>)
        .collect();
    (scripted, nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_work_dir() {
        let (temp_dir, work_dir) = create_temp_work_dir();
        assert!(work_dir.is_dir());
        drop(temp_dir);
        assert!(!work_dir.exists());
    }

    #[test]
    fn test_scripted_nodes_are_numbered() {
        let (scripted, nodes) = create_scripted_nodes(3, 7100);
        assert_eq!(scripted[2].name(), "node3");
        assert_eq!(nodes[1].listen_port(), 7101);
    }
}
