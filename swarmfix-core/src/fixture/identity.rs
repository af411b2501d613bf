//! Distinct node identities

use std::sync::Arc;

use crate::FixtureError;
use crate::engine::{Node, NodeId, SettingsPack};

/// Regenerations tolerated for a single node before giving up.
const MAX_IDENTITY_ATTEMPTS: u32 = 8;

/// Gives every node a fresh random identity together with `base` settings.
///
/// # Errors
///
/// See [`assign_identities_with`].
pub async fn assign_identities(
    nodes: &[Arc<dyn Node>],
    base: &SettingsPack,
) -> Result<Vec<NodeId>, FixtureError> {
    assign_identities_with(nodes, base, NodeId::random).await
}

/// Gives every node an identity drawn from `generate`.
///
/// A drawn identity equal to one already assigned is regenerated. Each node
/// must report the applied identity back, and all nodes must end up pairwise
/// distinct.
///
/// # Errors
///
/// - `FixtureError::DuplicateIdentity` - Generator keeps repeating, or two nodes report the same identity
/// - `FixtureError::IdentityNotApplied` - Node ignored the fingerprint
/// - `FixtureError::Engine` - Node rejected the settings
pub async fn assign_identities_with<G>(
    nodes: &[Arc<dyn Node>],
    base: &SettingsPack,
    mut generate: G,
) -> Result<Vec<NodeId>, FixtureError>
where
    G: FnMut() -> NodeId + Send,
{
    let mut assigned: Vec<NodeId> = Vec::with_capacity(nodes.len());

    for node in nodes {
        let mut id = generate();
        let mut attempts = 1;
        while assigned.contains(&id) {
            if attempts >= MAX_IDENTITY_ATTEMPTS {
                return Err(FixtureError::DuplicateIdentity { id });
            }
            tracing::warn!("{}: drawn identity {} already in use, regenerating", node.name(), id);
            id = generate();
            attempts += 1;
        }

        let mut settings = base.clone();
        settings.peer_fingerprint = Some(id);
        node.apply_settings(settings).await?;

        let actual = node.id();
        if actual != id {
            return Err(FixtureError::IdentityNotApplied {
                node: node.name().to_string(),
                expected: id,
                actual,
            });
        }

        tracing::debug!("{}: identity {}", node.name(), id);
        assigned.push(id);
    }

    for (i, node) in nodes.iter().enumerate() {
        if let Some(other) = nodes[i + 1..].iter().find(|other| other.id() == node.id()) {
            return Err(FixtureError::DuplicateIdentity { id: other.id() });
        }
    }

    Ok(assigned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::create_scripted_nodes;

    #[tokio::test]
    async fn test_random_identities_are_applied() {
        let (scripted, dynamic) = create_scripted_nodes(3, 6881);
        let ids = assign_identities(&dynamic, &SettingsPack::default())
            .await
            .unwrap();

        assert_eq!(ids.len(), 3);
        for (node, id) in scripted.iter().zip(&ids) {
            assert_eq!(node.id(), *id);
            assert_eq!(node.applied_settings()[0].peer_fingerprint, Some(*id));
        }
    }

    #[tokio::test]
    async fn test_collision_is_regenerated() {
        let (scripted, dynamic) = create_scripted_nodes(2, 6881);
        let mut sequence = vec![
            NodeId::new([1u8; 20]),
            NodeId::new([1u8; 20]),
            NodeId::new([2u8; 20]),
        ]
        .into_iter();

        let ids = assign_identities_with(&dynamic, &SettingsPack::default(), move || {
            sequence.next().unwrap_or_else(NodeId::random)
        })
        .await
        .unwrap();

        assert_eq!(ids, vec![NodeId::new([1u8; 20]), NodeId::new([2u8; 20])]);
        assert_ne!(scripted[0].id(), scripted[1].id());
    }

    #[tokio::test]
    async fn test_stuck_generator_is_a_duplicate() {
        let (_scripted, dynamic) = create_scripted_nodes(2, 6881);
        let result =
            assign_identities_with(&dynamic, &SettingsPack::default(), || NodeId::new([9u8; 20]))
                .await;
        assert!(matches!(result, Err(FixtureError::DuplicateIdentity { .. })));
    }

    #[tokio::test]
    async fn test_ignored_fingerprint_is_reported() {
        let (scripted, dynamic) = create_scripted_nodes(2, 6881);
        scripted[1].ignore_fingerprint();

        let result = assign_identities(&dynamic, &SettingsPack::default()).await;
        let error = result.unwrap_err();
        assert!(matches!(error, FixtureError::IdentityNotApplied { .. }));
        assert!(error.is_fatal());
    }
}
