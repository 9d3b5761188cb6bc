//! Export forest construction.
//!
//! Selected notes live in an arena ([`ExportForest`]) and refer to each other
//! by [`NodeIndex`]. Two strategies fill it:
//!
//! - **Subtree**: every requested note plus all of its descendants, walked
//!   depth-first with an explicit stack.
//! - **Selection**: exactly the requested notes. Each one is re-parented under
//!   its nearest selected ancestor, deepest notes first, so unselected
//!   intermediate notes disappear from the hierarchy.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use notes_core::{Access, ExportMode, ExportPhase, NoteRef, NoteStore, PermissionService, Result};

use crate::job::{ExportJob, Outcome};
use crate::services::Services;

/// Position of a node in an [`ExportForest`].
pub type NodeIndex = usize;

/// A note selected for export.
#[derive(Debug, Clone)]
pub struct ExportNode {
    pub note: NoteRef,
    /// Store ancestors of the note, root first.
    pub ancestors: Vec<String>,
    pub parent: Option<NodeIndex>,
    pub children: Vec<NodeIndex>,
}

/// Arena of export nodes with parent/child links by index.
#[derive(Debug, Default)]
pub struct ExportForest {
    nodes: Vec<ExportNode>,
    roots: Vec<NodeIndex>,
    by_id: HashMap<String, NodeIndex>,
}

impl ExportForest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeIndex] {
        &self.roots
    }

    pub fn node(&self, index: NodeIndex) -> &ExportNode {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> &mut ExportNode {
        &mut self.nodes[index]
    }

    pub fn index_of(&self, note_id: &str) -> Option<NodeIndex> {
        self.by_id.get(note_id).copied()
    }

    pub fn contains(&self, note_id: &str) -> bool {
        self.by_id.contains_key(note_id)
    }

    pub fn get(&self, note_id: &str) -> Option<&ExportNode> {
        self.index_of(note_id).map(|i| &self.nodes[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExportNode> {
        self.nodes.iter()
    }

    /// Add a note under `parent`, or as a root.
    pub fn push(
        &mut self,
        note: NoteRef,
        ancestors: Vec<String>,
        parent: Option<NodeIndex>,
    ) -> NodeIndex {
        let index = self.nodes.len();
        self.by_id.insert(note.id.clone(), index);
        self.nodes.push(ExportNode {
            note,
            ancestors,
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(p) => self.nodes[p].children.push(index),
            None => self.roots.push(index),
        }
        index
    }

    /// Move the root `child` under `parent`.
    fn attach(&mut self, child: NodeIndex, parent: NodeIndex) {
        self.roots.retain(|&r| r != child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);
    }

    /// Node indexes in depth-first pre-order, parents before children.
    pub fn preorder(&self) -> Vec<NodeIndex> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeIndex> = self.roots.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            order.push(index);
            stack.extend(self.nodes[index].children.iter().rev().copied());
        }
        order
    }

    /// Ids of the children of `note_id`, in order.
    pub fn child_ids(&self, note_id: &str) -> Vec<&str> {
        self.get(note_id)
            .map(|n| {
                n.children
                    .iter()
                    .map(|&c| self.nodes[c].note.id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids of the root nodes, in order.
    pub fn root_ids(&self) -> Vec<&str> {
        self.roots
            .iter()
            .map(|&r| self.nodes[r].note.id.as_str())
            .collect()
    }

    /// Re-parent every root under its nearest selected ancestor.
    ///
    /// Notes are folded deepest level first. A note with no selected ancestor
    /// stays a root. Sibling order follows insertion order.
    pub fn fold_selection(&mut self) {
        let max_depth = self
            .nodes
            .iter()
            .map(|n| n.ancestors.len())
            .max()
            .unwrap_or(0);

        let mut unfolded: Vec<NodeIndex> = self.roots.clone();
        for level in (0..=max_depth).rev() {
            let leaves: Vec<NodeIndex> = unfolded
                .iter()
                .copied()
                .filter(|&i| self.nodes[i].ancestors.len() == level)
                .collect();

            for leaf in leaves {
                let parent = self.nodes[leaf]
                    .ancestors
                    .iter()
                    .rev()
                    .find_map(|a| self.by_id.get(a).copied());
                if let Some(parent) = parent {
                    self.attach(leaf, parent);
                }
                unfolded.retain(|&i| i != leaf);
            }
        }

        self.roots.sort_unstable();
        for node in &mut self.nodes {
            node.children.sort_unstable();
        }
    }
}

/// Resolves an export request into an [`ExportForest`].
pub struct ContentGraphBuilder {
    notes: Arc<dyn NoteStore>,
    permissions: Arc<dyn PermissionService>,
}

impl ContentGraphBuilder {
    pub fn new(services: &Services) -> Self {
        Self {
            notes: services.notes.clone(),
            permissions: services.permissions.clone(),
        }
    }

    /// Build the forest for `job`, honouring its mode.
    ///
    /// Missing, unreadable and forbidden notes are recorded on the job and
    /// skipped. Checks the cancellation flag after each note.
    pub async fn build(&self, job: &ExportJob) -> Result<Outcome<ExportForest>> {
        match job.mode() {
            ExportMode::Subtree => self.build_subtree(job).await,
            ExportMode::Selection => self.build_selection(job).await,
        }
    }

    async fn build_selection(&self, job: &ExportJob) -> Result<Outcome<ExportForest>> {
        let mut forest = ExportForest::new();

        for id in job.requested_ids() {
            if job.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            let Some(note) = self.resolve(job, id).await else {
                continue;
            };
            let ancestors = match self.notes.list_ancestors(id).await {
                Ok(ancestors) => ancestors,
                Err(e) => {
                    self.skip(job, id, format!("ancestors of note {} unavailable: {}", id, e));
                    continue;
                }
            };
            forest.push(note, ancestors, None);
            job.note_processed();
        }

        if job.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        job.set_phase(ExportPhase::UpdatingParents);
        forest.fold_selection();

        debug!(
            job_id = job.id(),
            notes = forest.len(),
            roots = forest.roots().len(),
            "Selection folded"
        );
        Ok(Outcome::Completed(forest))
    }

    async fn build_subtree(&self, job: &ExportJob) -> Result<Outcome<ExportForest>> {
        let mut forest = ExportForest::new();

        for id in job.requested_ids() {
            if forest.contains(id) {
                continue;
            }
            if job.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            let Some(root) = self.resolve(job, id).await else {
                continue;
            };

            let mut stack: Vec<(NoteRef, Option<NodeIndex>)> = vec![(root, None)];
            while let Some((note, parent)) = stack.pop() {
                if forest.contains(&note.id) {
                    continue;
                }
                let ancestors = match parent {
                    Some(p) => {
                        let parent_node = forest.node(p);
                        let mut chain = parent_node.ancestors.clone();
                        chain.push(parent_node.note.id.clone());
                        chain
                    }
                    None => Vec::new(),
                };
                let note_id = note.id.clone();
                let index = forest.push(note, ancestors, parent);
                job.note_processed();

                if job.is_cancelled() {
                    return Ok(Outcome::Cancelled);
                }

                let children = match self.notes.list_children(&note_id).await {
                    Ok(children) => children,
                    Err(e) => {
                        self.skip(job, &note_id, format!("children of note {} unavailable: {}", note_id, e));
                        continue;
                    }
                };
                for child in children.into_iter().rev() {
                    if self.can_view(job, &child).await {
                        stack.push((child, Some(index)));
                    }
                }
            }
        }

        if job.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        debug!(
            job_id = job.id(),
            notes = forest.len(),
            roots = forest.roots().len(),
            "Subtrees collected"
        );
        Ok(Outcome::Completed(forest))
    }

    /// Fetch a requested note and check the requester may view it.
    async fn resolve(&self, job: &ExportJob, id: &str) -> Option<NoteRef> {
        match self.notes.get(id).await {
            Ok(Some(note)) => {
                if self.can_view(job, &note).await {
                    Some(note)
                } else {
                    None
                }
            }
            Ok(None) => {
                self.skip(job, id, format!("note {} not found", id));
                None
            }
            Err(e) => {
                self.skip(job, id, format!("note {} unreadable: {}", id, e));
                None
            }
        }
    }

    async fn can_view(&self, job: &ExportJob, note: &NoteRef) -> bool {
        match self
            .permissions
            .check_access(job.requester(), note, Access::View)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                self.skip(job, &note.id, format!("note {} not viewable by requester", note.id));
                false
            }
            Err(e) => {
                self.skip(job, &note.id, format!("access check on note {} failed: {}", note.id, e));
                false
            }
        }
    }

    fn skip(&self, job: &ExportJob, note_id: &str, message: String) {
        warn!(job_id = job.id(), note_id = note_id, "{}", message);
        job.record_error(message);
    }
}
