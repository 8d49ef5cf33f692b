//! In-memory node-alias cache over a durable backing store.
//!
//! The cache maps storage-node ids to compact integer aliases in both
//! directions. It is process-wide shared state, grows monotonically, and
//! never evicts; the backing table makes the mapping survive restarts.

use crate::adapter::Adapter;
use crate::error::{MetabaseError, MetabaseResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use vantage_core::{AliasPiece, AliasPieces, NodeAlias, NodeId, Piece, Pieces};

/// Bidirectional node-id/alias map with a durable backing store.
pub struct NodeAliasCache {
    store: Arc<dyn Adapter>,
    state: RwLock<NodeAliasMap>,
}

#[derive(Default)]
struct NodeAliasMap {
    node_to_alias: HashMap<NodeId, NodeAlias>,
    alias_to_node: HashMap<NodeAlias, NodeId>,
}

impl NodeAliasCache {
    /// Create a cache backed by the given adapter's alias table.
    pub fn new(store: Arc<dyn Adapter>) -> Self {
        Self {
            store,
            state: RwLock::new(NodeAliasMap::default()),
        }
    }

    /// Translate a piece set into its aliased form, allocating aliases for
    /// unseen nodes. Identical node ids always map to identical aliases.
    pub async fn ensure_pieces_to_aliases(&self, pieces: &Pieces) -> MetabaseResult<AliasPieces> {
        let missing: Vec<NodeId> = {
            let map = self.state.read().expect("alias cache poisoned");
            pieces
                .iter()
                .map(|piece| piece.node)
                .filter(|node| !map.node_to_alias.contains_key(node))
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        };

        if !missing.is_empty() {
            self.store.ensure_node_aliases(&missing).await?;
            self.refresh().await?;
        }

        let map = self.state.read().expect("alias cache poisoned");
        let mut aliased = Vec::with_capacity(pieces.len());
        for piece in pieces.iter() {
            let alias = map.node_to_alias.get(&piece.node).copied().ok_or_else(|| {
                MetabaseError::Internal(format!("alias missing for node {}", piece.node))
            })?;
            aliased.push(AliasPiece {
                number: piece.number,
                alias,
            });
        }
        Ok(AliasPieces(aliased))
    }

    /// Translate an aliased piece set back into node ids, refreshing from the
    /// store when an alias allocated by another process is encountered.
    pub async fn aliases_to_pieces(&self, alias_pieces: &AliasPieces) -> MetabaseResult<Pieces> {
        let any_missing = {
            let map = self.state.read().expect("alias cache poisoned");
            alias_pieces
                .0
                .iter()
                .any(|piece| !map.alias_to_node.contains_key(&piece.alias))
        };
        if any_missing {
            self.refresh().await?;
        }

        let map = self.state.read().expect("alias cache poisoned");
        let mut pieces = Vec::with_capacity(alias_pieces.len());
        for piece in &alias_pieces.0 {
            let node = map.alias_to_node.get(&piece.alias).copied().ok_or_else(|| {
                MetabaseError::Internal(format!("unknown node alias {}", piece.alias))
            })?;
            pieces.push(Piece {
                number: piece.number,
                node,
            });
        }
        Ok(Pieces(pieces))
    }

    async fn refresh(&self) -> MetabaseResult<()> {
        let entries = self.store.list_node_aliases().await?;
        let mut map = self.state.write().expect("alias cache poisoned");
        for (node, alias) in entries {
            map.node_to_alias.insert(node, alias);
            map.alias_to_node.insert(alias, node);
        }
        Ok(())
    }
}
