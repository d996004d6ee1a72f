//! Mesh octree cells
use super::{GeometrySource, Mesh, Snapshot};
use crate::region::BoundingBox;
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

/// Process-unique identifier for a [`MeshCell`]
///
/// Score maps are keyed by cell id, and detached subtrees computed on job
/// threads are swapped back into the live tree by id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for CellId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A node in the mesh octree
///
/// Leaf cells own their geometry; internal cells own exactly eight children,
/// which tile the parent's bounding box in octant order (see
/// [`BoundingBox::octant`]), and hold no geometry of their own.
#[derive(Clone, Debug)]
pub struct MeshCell {
    id: CellId,
    bounds: BoundingBox,
    geometry: Option<Arc<Mesh>>,
    children: Vec<MeshCell>,
    source: GeometrySource,
    cached: Option<Snapshot>,
}

impl MeshCell {
    /// Builds a new leaf cell
    pub fn new(bounds: BoundingBox, mesh: Mesh, source: GeometrySource) -> Self {
        Self {
            id: CellId::next(),
            bounds,
            geometry: Some(Arc::new(mesh)),
            children: vec![],
            source,
            cached: None,
        }
    }

    /// Attaches a snapshot of this cell's geometry
    pub fn with_snapshot(mut self, s: Snapshot) -> Self {
        self.cached = Some(s);
        self
    }

    /// Builds an internal cell that replaces `self`, keeping its id
    ///
    /// The cell's own geometry is dropped; `cached` stores a snapshot of it.
    ///
    /// # Panics
    /// If there are not exactly eight children
    pub(crate) fn into_refined(
        self,
        children: Vec<MeshCell>,
        cached: Option<Snapshot>,
    ) -> Self {
        assert_eq!(children.len(), 8);
        Self {
            geometry: None,
            children,
            cached: cached.or(self.cached),
            ..self
        }
    }

    /// Builds a leaf cell that replaces `self`, keeping its id
    pub(crate) fn into_collapsed(self, mesh: Mesh) -> Self {
        Self {
            geometry: Some(Arc::new(mesh)),
            children: vec![],
            ..self
        }
    }

    /// Unique id of this cell
    pub fn id(&self) -> CellId {
        self.id
    }

    /// Bounding box of this cell
    pub fn bounds(&self) -> &BoundingBox {
        &self.bounds
    }

    /// Geometry of this cell, which is only present for leaves
    pub fn geometry(&self) -> Option<&Arc<Mesh>> {
        self.geometry.as_ref()
    }

    /// Children of this cell (either empty or exactly 8)
    pub fn children(&self) -> &[MeshCell] {
        &self.children
    }

    /// Provenance of this cell's geometry
    pub fn source(&self) -> &GeometrySource {
        &self.source
    }

    /// Octree depth of this cell
    pub fn depth(&self) -> u8 {
        self.source.depth()
    }

    /// Snapshot of this cell's own geometry, if one was taken
    pub fn cached(&self) -> Option<&Snapshot> {
        self.cached.as_ref()
    }

    /// Checks whether this is a leaf cell
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Iterates over cells with no children
    ///
    /// The iterator borrows the tree, so calling this again restarts the walk.
    pub fn leafs(&self) -> Leafs<'_> {
        Leafs { stack: vec![self] }
    }

    /// Total vertex count of every leaf
    pub fn vertex_count(&self) -> usize {
        self.leafs()
            .filter_map(|c| c.geometry.as_ref())
            .map(|m| m.vertex_count())
            .sum()
    }

    /// Total triangle count of every leaf
    pub fn triangle_count(&self) -> usize {
        self.leafs()
            .filter_map(|c| c.geometry.as_ref())
            .map(|m| m.triangle_count())
            .sum()
    }

    /// Aggregates leaf scores up the tree
    ///
    /// Returns an entry for every internal cell, whose value is the sum of its
    /// children's aggregate scores; a leaf contributes its own entry in
    /// `scores`, or zero if it was not sampled.
    pub fn get_fills(
        &self,
        scores: &HashMap<CellId, f32>,
    ) -> HashMap<CellId, f32> {
        let mut out = HashMap::new();
        self.fill_into(scores, &mut out);
        out
    }

    fn fill_into(
        &self,
        scores: &HashMap<CellId, f32>,
        out: &mut HashMap<CellId, f32>,
    ) -> f32 {
        if self.is_leaf() {
            return scores.get(&self.id).copied().unwrap_or(0.0);
        }
        let score: f32 =
            self.children.iter().map(|c| c.fill_into(scores, out)).sum();
        out.insert(self.id, score);
        score
    }

    /// Checks whether this cell can be refined
    pub fn expandable(&self) -> bool {
        self.is_leaf() && self.source.expandable()
    }

    /// Checks whether this cell can be collapsed from cached geometry
    ///
    /// This requires children, and a snapshot on every descendant leaf.
    pub fn collapsible(&self) -> bool {
        !self.is_leaf() && self.leafs().all(|c| c.cached.is_some())
    }

    /// Finds the cell with the given id in this subtree
    pub fn find(&self, id: CellId) -> Option<&MeshCell> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    /// Finds the cell with the given id in this subtree, mutably
    pub fn find_mut(&mut self, id: CellId) -> Option<&mut MeshCell> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(id))
    }

    /// Swaps a detached replacement into the tree, in place of the cell with
    /// the same id
    ///
    /// Returns the replacement back if no matching cell exists (e.g. because
    /// the tree was rebuilt while the replacement was being computed).
    pub fn replace(&mut self, cell: MeshCell) -> Result<(), MeshCell> {
        match self.find_mut(cell.id) {
            Some(c) => {
                *c = cell;
                Ok(())
            }
            None => Err(cell),
        }
    }

    /// Checks structural invariants, returning a description of the first
    /// violation
    ///
    /// - Internal cells have exactly 8 children and no geometry
    /// - Leaf cells have geometry
    /// - Children tile their parent's bounding box in octant order
    /// - Depth increases by exactly one from parent to child
    pub fn check(&self) -> Result<(), String> {
        if self.is_leaf() {
            if self.geometry.is_none() {
                return Err(format!("leaf {} has no geometry", self.id));
            }
            return Ok(());
        }
        if self.children.len() != 8 {
            return Err(format!(
                "cell {} has {} children",
                self.id,
                self.children.len()
            ));
        }
        if self.geometry.is_some() {
            return Err(format!("internal cell {} has geometry", self.id));
        }
        let eps = self.bounds.size().amax() * 1e-6;
        for (i, c) in self.children.iter().enumerate() {
            if !c.bounds.approx_eq(&self.bounds.octant(i), eps) {
                return Err(format!(
                    "child {i} of {} does not match its octant",
                    self.id
                ));
            }
            if c.depth() != self.depth() + 1 {
                return Err(format!(
                    "child {} has depth {}, parent {} has depth {}",
                    c.id,
                    c.depth(),
                    self.id,
                    self.depth()
                ));
            }
            c.check()?;
        }
        Ok(())
    }
}

/// Iterator over the leaf cells of a [`MeshCell`] tree
pub struct Leafs<'a> {
    stack: Vec<&'a MeshCell>,
}

impl<'a> Iterator for Leafs<'a> {
    type Item = &'a MeshCell;
    fn next(&mut self) -> Option<Self::Item> {
        while let Some(c) = self.stack.pop() {
            if c.is_leaf() {
                return Some(c);
            }
            self.stack.extend(c.children.iter().rev());
        }
        None
    }
}
