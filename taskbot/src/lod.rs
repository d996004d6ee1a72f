//! Screen-space level-of-detail control for streamed meshes
//!
//! Each tick, the controller samples how much of the screen each leaf covers,
//! then picks at most one cell to refine or collapse:
//!
//! - **Refine**: among expandable leaves, group scores by octree depth and
//!   scan from the shallowest depth; the first depth whose best score reaches
//!   [`refine_threshold`](LodSettings::refine_threshold) yields its best cell.
//! - **Collapse**: among collapsible internal cells (scored by the sum of
//!   their leaves), scan depths the same way; the first depth whose worst
//!   score is at or below
//!   [`collapse_threshold`](LodSettings::collapse_threshold) yields its worst
//!   cell.
//!
//! Collapsing takes priority over refining.  Because the collapse threshold is
//! below the refine threshold, a cell scoring between them is left alone,
//! rather than oscillating between refine and collapse.
use crate::{
    mesh::{CellId, MeshCell},
    sampler::ScreenSampler,
};
use log::debug;
use std::collections::{BTreeMap, HashMap};

/// Thresholds used by the [`LodController`]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LodSettings {
    /// Minimum screen fraction at which a leaf is refined
    pub refine_threshold: f32,
    /// Maximum screen fraction at which a cell is collapsed
    pub collapse_threshold: f32,
}

impl Default for LodSettings {
    fn default() -> Self {
        Self {
            refine_threshold: 0.05,
            collapse_threshold: 0.025,
        }
    }
}

/// A single mesh octree modification chosen by the controller
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LodStep {
    /// Subdivide the given leaf
    Refine(CellId),
    /// Merge the given cell's children
    Collapse(CellId),
}

/// Scored cell, tagged with its octree depth
#[derive(Copy, Clone, Debug)]
pub struct Candidate {
    /// Octree depth of the cell
    pub depth: u8,
    /// Cell being scored
    pub id: CellId,
    /// Screen fraction
    pub score: f32,
}

/// Decides when to refine or collapse mesh cells
#[derive(Debug, Default)]
pub struct LodController {
    settings: LodSettings,
    converged: bool,
}

impl LodController {
    /// Builds a new controller with the given thresholds
    pub fn new(settings: LodSettings) -> Self {
        Self {
            settings,
            converged: false,
        }
    }

    /// Checks whether a previous tick found nothing to do
    pub fn is_converged(&self) -> bool {
        self.converged
    }

    /// Clears the "converged" latch, e.g. because the camera moved or the
    /// octree changed
    pub fn invalidate(&mut self) {
        self.converged = false;
    }

    /// Sets the "converged" latch, stopping further steps until the next
    /// call to [`invalidate`](Self::invalidate)
    pub fn settle(&mut self) {
        self.converged = true;
    }

    /// Considers a single refine or collapse step
    ///
    /// The caller is responsible for checking that no job is running and that
    /// the design is not in an error state; this function checks that the view
    /// is visible and that the controller hasn't already converged.
    pub fn tick(
        &mut self,
        roots: &[MeshCell],
        sampler: &mut dyn ScreenSampler,
    ) -> Option<LodStep> {
        if self.converged || !sampler.is_shown() {
            return None;
        }

        let leaves = roots.iter().flat_map(|r| r.leafs()).collect::<Vec<_>>();
        if !leaves.iter().any(|c| c.expandable()) {
            debug!("no expandable leaves; LOD is converged");
            self.converged = true;
            return None;
        }

        let scores = sampler.sample(&leaves);
        let step = self.choose(roots, &leaves, &scores);
        if step.is_none() {
            debug!("no cells cross LOD thresholds; LOD is converged");
            self.converged = true;
        }
        step
    }

    /// Picks a step from a set of sampled scores
    fn choose(
        &self,
        roots: &[MeshCell],
        leaves: &[&MeshCell],
        scores: &HashMap<CellId, f32>,
    ) -> Option<LodStep> {
        let expandable = leaves.iter().filter(|c| c.expandable()).map(|c| {
            Candidate {
                depth: c.depth(),
                id: c.id(),
                score: scores.get(&c.id()).copied().unwrap_or(0.0),
            }
        });

        let mut collapsible = vec![];
        for r in roots {
            let fills = r.get_fills(scores);
            for (id, score) in fills {
                // get_fills only returns cells within this tree
                let Some(c) = r.find(id) else { continue };
                if c.collapsible() {
                    collapsible.push(Candidate {
                        depth: c.depth(),
                        id,
                        score,
                    });
                }
            }
        }

        let best = pick_refine(expandable, self.settings.refine_threshold);
        let worst =
            pick_collapse(collapsible, self.settings.collapse_threshold);

        if let Some(c) = worst {
            debug!("collapsing cell {} with score {}", c.id, c.score);
            Some(LodStep::Collapse(c.id))
        } else if let Some(c) = best {
            debug!("refining cell {} with score {}", c.id, c.score);
            Some(LodStep::Refine(c.id))
        } else {
            None
        }
    }
}

/// Groups candidates by depth, ordered from shallowest to deepest
fn by_depth<I: IntoIterator<Item = Candidate>>(
    cs: I,
) -> BTreeMap<u8, Vec<Candidate>> {
    let mut out: BTreeMap<u8, Vec<Candidate>> = BTreeMap::new();
    for c in cs {
        out.entry(c.depth).or_default().push(c);
    }
    out
}

/// Picks the refine candidate
///
/// Scanning depths from shallowest to deepest, returns the highest-scoring
/// cell of the first depth whose highest score is at least `threshold`.  Ties
/// go to the lowest cell id.
pub fn pick_refine<I: IntoIterator<Item = Candidate>>(
    cs: I,
    threshold: f32,
) -> Option<Candidate> {
    by_depth(cs).into_values().find_map(|cs| {
        let best = cs.into_iter().reduce(|a, b| {
            if b.score > a.score || (b.score == a.score && b.id < a.id) {
                b
            } else {
                a
            }
        })?;
        (best.score >= threshold).then_some(best)
    })
}

/// Picks the collapse candidate
///
/// Scanning depths from shallowest to deepest, returns the lowest-scoring
/// cell of the first depth whose lowest score is at most `threshold`.  Ties go
/// to the lowest cell id.
pub fn pick_collapse<I: IntoIterator<Item = Candidate>>(
    cs: I,
    threshold: f32,
) -> Option<Candidate> {
    by_depth(cs).into_values().find_map(|cs| {
        let worst = cs.into_iter().reduce(|a, b| {
            if b.score < a.score || (b.score == a.score && b.id < a.id) {
                b
            } else {
                a
            }
        })?;
        (worst.score <= threshold).then_some(worst)
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::{FixedSampler, leaf, refined};

    fn cand(depth: u8, id: &MeshCell, score: f32) -> Candidate {
        Candidate {
            depth,
            id: id.id(),
            score,
        }
    }

    #[test]
    fn refine_prefers_shallow_depths() {
        let (a, b, c) = (leaf(0), leaf(0), leaf(0));
        // Depth 1 crosses the threshold, so the larger depth-2 score is
        // ignored
        let out = pick_refine(
            [cand(2, &a, 0.9), cand(1, &b, 0.06), cand(1, &c, 0.01)],
            0.05,
        )
        .unwrap();
        assert_eq!(out.id, b.id());

        // Depth 1 doesn't cross the threshold, so we move on to depth 2
        let out = pick_refine(
            [cand(2, &a, 0.9), cand(1, &b, 0.04), cand(1, &c, 0.01)],
            0.05,
        )
        .unwrap();
        assert_eq!(out.id, a.id());

        assert!(pick_refine([cand(0, &a, 0.049)], 0.05).is_none());
        assert!(pick_refine([], 0.05).is_none());
    }

    #[test]
    fn collapse_prefers_shallow_depths() {
        let (a, b, c) = (leaf(0), leaf(0), leaf(0));
        let out = pick_collapse(
            [cand(2, &a, 0.0), cand(1, &b, 0.02), cand(1, &c, 0.5)],
            0.025,
        )
        .unwrap();
        assert_eq!(out.id, b.id());

        let out = pick_collapse(
            [cand(2, &a, 0.0), cand(1, &b, 0.03), cand(1, &c, 0.5)],
            0.025,
        )
        .unwrap();
        assert_eq!(out.id, a.id());
    }

    #[test]
    fn refine_root() {
        let root = leaf(0);
        let mut sampler = FixedSampler::new([(root.id(), 0.10)]);
        let mut lod = LodController::default();
        let roots = [root];
        assert_eq!(
            lod.tick(&roots, &mut sampler),
            Some(LodStep::Refine(roots[0].id()))
        );
        assert!(!lod.is_converged());
    }

    #[test]
    fn collapse_beats_refine() {
        let root = refined(leaf(0));
        let mut sampler = FixedSampler::new(
            root.leafs().map(|c| (c.id(), 0.002)).collect::<Vec<_>>(),
        );
        let mut lod = LodController::default();
        let roots = [root];
        assert_eq!(
            lod.tick(&roots, &mut sampler),
            Some(LodStep::Collapse(roots[0].id()))
        );

        // If one leaf is large enough to refine, the root is no longer a
        // collapse candidate and refinement wins
        let big = roots[0].children()[2].id();
        sampler.scores.insert(big, 0.2);
        assert_eq!(lod.tick(&roots, &mut sampler), Some(LodStep::Refine(big)));
    }

    #[test]
    fn collapse_wins_across_roots() {
        // Root A is refined into eight tiny leaves, while root B is a leaf
        // which is large enough to refine
        let a = refined(leaf(0));
        let b = leaf(0);
        let mut scores = a.leafs().map(|c| (c.id(), 0.002)).collect::<Vec<_>>();
        scores.push((b.id(), 0.10));
        let mut sampler = FixedSampler::new(scores);
        let mut lod = LodController::default();
        let roots = [a, b];
        assert_eq!(
            lod.tick(&roots, &mut sampler),
            Some(LodStep::Collapse(roots[0].id()))
        );
    }

    #[test]
    fn hysteresis() {
        // A single leaf whose score is stuck between the two thresholds
        let root = leaf(0);
        let mut sampler = FixedSampler::new([(root.id(), 0.03)]);
        let mut lod = LodController::default();
        let roots = [root];
        for _ in 0..100 {
            assert_eq!(lod.tick(&roots, &mut sampler), None);
            lod.invalidate();
        }

        // Same thing for an internal cell made of eight leaves
        let root = refined(leaf(0));
        let mut sampler = FixedSampler::new(
            root.leafs().map(|c| (c.id(), 0.03 / 8.0)).collect::<Vec<_>>(),
        );
        let roots = [root];
        for _ in 0..100 {
            assert_eq!(lod.tick(&roots, &mut sampler), None);
            lod.invalidate();
        }
    }

    #[test]
    fn convergence_latch() {
        let root = leaf(0);
        let mut sampler = FixedSampler::new([(root.id(), 0.0)]);
        let mut lod = LodController::default();
        let roots = [root];
        assert_eq!(lod.tick(&roots, &mut sampler), None);
        assert!(lod.is_converged());
        assert_eq!(sampler.calls, 1);

        // Once converged, we don't sample again until invalidated
        sampler.scores.insert(roots[0].id(), 0.5);
        assert_eq!(lod.tick(&roots, &mut sampler), None);
        assert_eq!(sampler.calls, 1);

        lod.invalidate();
        assert_eq!(
            lod.tick(&roots, &mut sampler),
            Some(LodStep::Refine(roots[0].id()))
        );
        assert_eq!(sampler.calls, 2);
    }

    #[test]
    fn hidden_view() {
        let root = leaf(0);
        let mut sampler = FixedSampler::new([(root.id(), 0.5)]);
        sampler.shown = false;
        let mut lod = LodController::default();
        assert_eq!(lod.tick(&[root], &mut sampler), None);
        assert!(!lod.is_converged());
        assert_eq!(sampler.calls, 0);
    }

    #[test]
    fn nothing_expandable() {
        let root = leaf(crate::mesh::MAX_DEPTH);
        let mut sampler = FixedSampler::new([(root.id(), 0.5)]);
        let mut lod = LodController::default();
        assert_eq!(lod.tick(&[root], &mut sampler), None);
        assert!(lod.is_converged());
        assert_eq!(sampler.calls, 0);
    }
}
