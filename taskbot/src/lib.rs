//! Taskbot is the background-work engine behind an interactive implicit-surface
//! design tool.
//!
//! A user edits a design script and watches it render while slow work (script
//! evaluation, triangulation, export, toolpath generation, and an external
//! "fab" process) proceeds without blocking the interface.  This crate decides
//! which of those jobs may run at the same time, how a stale job is cancelled
//! when it's superseded, and how a displayed 3D mesh is progressively
//! subdivided or merged based on how much of the screen each piece covers.
//!
//! # Jobs and the orchestrator
//! The [`TaskOrchestrator`](orchestrator::TaskOrchestrator) is owned by the
//! control thread, which calls its `tick` function once per frame.  User
//! actions start jobs:
//!
//! - `start_render` evaluates a script (or re-renders the current design) and
//!   always supersedes any render in progress
//! - `start_export`, `start_cam`, and `start_fab` are single-flight: a second
//!   request fails with [`Error::JobAlreadyRunning`] instead of spawning
//!
//! Each [`Job`](job::Job) runs on its own thread and carries a pair of
//! cancellation flags (see [`JobCancel`](cancel::JobCancel)): a coarse flag
//! checked between units of work, and a fine flag threaded into every call to
//! the geometry engine.  Job threads never touch shared state; they return a
//! value, which the orchestrator publishes when it reaps the job.
//!
//! # Mesh streaming
//! Meshes are stored as an octree of [`MeshCell`](mesh::MeshCell) objects.
//! When nothing else is running, the orchestrator asks the
//! [`LodController`](lod::LodController) for a single refine or collapse step,
//! based on per-leaf screen occupancy reported by a
//! [`ScreenSampler`](sampler::ScreenSampler).
//!
//! Screen occupancy is measured by drawing each leaf in a unique flat color
//! and counting pixels:
//! ```
//! use taskbot::sampler::{color_index, flat_color};
//!
//! // Leaf 0 is drawn in the darkest non-black color
//! assert_eq!(flat_color(0), [0, 0, 1]);
//! assert_eq!(color_index(flat_color(1234)), Some(1234));
//!
//! // Black is reserved for the background
//! assert_eq!(color_index([0, 0, 0]), None);
//! ```
//!
//! Leaves covering at least 5% of the screen are refined, and internal cells
//! covering at most 2.5% are collapsed; the gap between those thresholds keeps
//! the octree from oscillating.
//! ```
//! use taskbot::lod::LodSettings;
//!
//! let s = LodSettings::default();
//! assert!(s.collapse_threshold < s.refine_threshold);
//! ```
//!
//! # External collaborators
//! Script evaluation and the geometry engine live outside of this crate, and
//! are consumed through the traits in [`design`].
//!
//! # Feature flags
#![doc = document_features::document_features!()]
#![warn(missing_docs)]

mod error;
pub use error::Error;

pub mod cam;
pub mod cancel;
pub mod design;
pub mod export;
pub mod fab;
pub mod job;
pub mod lod;
pub mod mesh;
pub mod orchestrator;
pub mod raster;
pub mod refine;
pub mod region;
pub mod render;
pub mod sampler;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
