//! Task orchestration: single-flight background jobs and mesh streaming
//!
//! The [`TaskOrchestrator`] lives on the control (UI) thread, which calls
//! [`tick`](TaskOrchestrator::tick) once per frame.  Each tick reaps finished
//! jobs in the order in which they completed, publishes their results, and
//! (when nothing else is happening) asks the [`LodController`] whether one
//! mesh cell should be refined or collapsed.
//!
//! Job threads never touch the orchestrator's state.  Render results are
//! tagged with a generation number, and only the newest generation is ever
//! published; refine and collapse jobs return a detached replacement cell,
//! which is swapped into the live octree by id.
use crate::{
    Error,
    cam::{CamWorkflow, Toolpath},
    cancel::JobCancel,
    design::{AsdfLoader, DesignResult, Evaluator, RenderMode},
    export::{ExportOptions, ExportProgress, ExportTask},
    fab::FabProcess,
    job::{Completion, Job, JobId, JobKind, JobState, Outcome},
    lod::{LodController, LodSettings, LodStep},
    mesh::MeshCell,
    raster::Image,
    refine::{collapse, refine},
    render::{RenderInput, RenderOutput, RenderTask, StageCell, View},
    sampler::ScreenSampler,
};
use crossbeam_channel::{Receiver, Sender, unbounded};
use enum_map::EnumMap;
use log::{debug, info, warn};
use std::{
    collections::{BTreeMap, VecDeque},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

/// Viewport border color used to flag a failed render
pub const ERROR_BORDER: [u8; 3] = [255, 0, 0];

/// Settings for a [`TaskOrchestrator`]
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    /// Level-of-detail thresholds
    pub lod: LodSettings,
    /// Command used to launch the fab modules
    pub fab_command: String,
    /// Time to wait for job threads when shutting down
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            lod: LodSettings::default(),
            fab_command: "fab".to_owned(),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}

/// External collaborators used by the orchestrator
pub struct OrchestratorContext {
    /// Script evaluator
    pub evaluator: Arc<dyn Evaluator>,
    /// Loader for pre-subdivided distance fields on disk
    pub loader: Arc<dyn AsdfLoader>,
    /// Screen-occupancy sampler for the 3D view
    pub sampler: Box<dyn ScreenSampler>,
    /// Optional channel, poked whenever a job finishes
    ///
    /// A UI can use this to schedule a redraw (and therefore a `tick`).
    pub wake: Option<Sender<()>>,
}

/// A running job, tagged with the type of its result
enum Work {
    Render {
        job: Job<RenderOutput>,
        generation: u64,
        stage: StageCell,
    },
    Export(Job<PathBuf>),
    Cam(Job<Toolpath>),
    /// Refine or collapse
    Mesh(Job<MeshCell>),
}

impl Work {
    fn kind(&self) -> JobKind {
        match self {
            Work::Render { job, .. } => job.kind(),
            Work::Export(job) => job.kind(),
            Work::Cam(job) => job.kind(),
            Work::Mesh(job) => job.kind(),
        }
    }

    fn is_finished(&self) -> bool {
        match self {
            Work::Render { job, .. } => job.is_finished(),
            Work::Export(job) => job.is_finished(),
            Work::Cam(job) => job.is_finished(),
            Work::Mesh(job) => job.is_finished(),
        }
    }

    fn request_cancel(&self) {
        match self {
            Work::Render { job, .. } => job.request_cancel(),
            Work::Export(job) => job.request_cancel(),
            Work::Cam(job) => job.request_cancel(),
            Work::Mesh(job) => job.request_cancel(),
        }
    }
}

/// A render request waiting for the previous render thread to exit
struct PendingRender {
    view: View,
    input: RenderInput,
    generation: u64,
}

/// Manages background jobs and drives mesh level-of-detail
pub struct TaskOrchestrator {
    ctx: OrchestratorContext,
    settings: OrchestratorSettings,

    jobs: BTreeMap<JobId, Work>,
    next_id: u64,
    completion: Completion,
    done_rx: Receiver<JobId>,
    /// Jobs which have announced completion, in completion order
    finished: VecDeque<JobId>,
    states: EnumMap<JobKind, Option<JobState>>,

    /// Newest render generation which has been requested
    generation: u64,
    pending: Option<PendingRender>,
    fab: Option<FabProcess>,
    lod: LodController,

    design: Option<Arc<DesignResult>>,
    mode: Option<RenderMode>,
    failed: bool,
    meshes: Vec<MeshCell>,
    image: Option<Image>,
    flat: Option<Image>,
    output: String,
    status: String,
    error_line: Option<usize>,
    border: Option<[u8; 3]>,
    export_progress: Option<ExportProgress>,
    toolpath: Option<Toolpath>,

    /// Makes the next call to `spawn` fail
    #[cfg(test)]
    fail_spawn: bool,
}

impl TaskOrchestrator {
    /// Builds a new orchestrator, with no design loaded
    pub fn new(ctx: OrchestratorContext, settings: OrchestratorSettings) -> Self {
        let (done, done_rx) = unbounded();
        let completion = Completion {
            done,
            wake: ctx.wake.clone(),
        };
        Self {
            lod: LodController::new(settings.lod),
            ctx,
            settings,
            jobs: BTreeMap::new(),
            next_id: 0,
            completion,
            done_rx,
            finished: VecDeque::new(),
            states: EnumMap::default(),
            generation: 0,
            pending: None,
            fab: None,
            design: None,
            mode: None,
            failed: false,
            meshes: vec![],
            image: None,
            flat: None,
            output: String::new(),
            status: String::new(),
            error_line: None,
            border: None,
            export_progress: None,
            toolpath: None,
            #[cfg(test)]
            fail_spawn: false,
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // User actions

    /// Requests a new render, superseding any render in progress
    ///
    /// The running render (if any) is cancelled.  If its thread is still
    /// alive, this request is held as the pending render and started by the
    /// first [`tick`](Self::tick) after that thread exits; a newer request
    /// replaces an older pending one.  Running refine and collapse jobs are
    /// cancelled as well.
    ///
    /// This function never blocks.
    pub fn start_render(
        &mut self,
        view: View,
        input: RenderInput,
    ) -> Result<(), Error> {
        if matches!(input, RenderInput::Cached) && self.design.is_none() {
            return Err(Error::NoDesign);
        }
        self.generation += 1;
        for w in self.jobs.values() {
            if matches!(w.kind(), JobKind::Render | JobKind::Refine | JobKind::Collapse)
            {
                w.request_cancel();
            }
        }
        if let Some(p) = &self.pending {
            debug!("render {} superseded before starting", p.generation);
        }
        self.pending = Some(PendingRender {
            view,
            input,
            generation: self.generation,
        });
        self.states[JobKind::Render] = Some(JobState::Pending);
        self.start_pending_render()
    }

    /// Starts exporting the current design
    pub fn start_export(&mut self, options: ExportOptions) -> Result<JobId, Error> {
        if self.is_running(JobKind::Export) {
            return Err(Error::JobAlreadyRunning(JobKind::Export));
        }
        let design = self.healthy_design()?;
        let format = options.format()?;
        let progress = ExportProgress::default();
        let task = ExportTask {
            design,
            format,
            options,
            progress: progress.clone(),
        };
        let job = self.spawn(JobKind::Export, move |cancel| task.run(cancel))?;
        let id = job.id();
        self.jobs.insert(id, Work::Export(job));
        self.export_progress = Some(progress);
        self.status = format!("Exporting {format}");
        Ok(id)
    }

    /// Launches the fab modules on the current design
    ///
    /// The fab process is re-fed the design whenever a render is published.
    pub fn start_fab(&mut self) -> Result<(), Error> {
        let Some(design) = &self.design else {
            return Err(Error::NoDesign);
        };
        if self.fab.as_mut().is_some_and(|f| f.is_alive()) {
            return Err(Error::JobAlreadyRunning(JobKind::Fab));
        }
        self.fab = Some(FabProcess::spawn(&self.settings.fab_command, design)?);
        self.states[JobKind::Fab] = Some(JobState::Running);
        Ok(())
    }

    /// Starts generating a toolpath for the current design
    pub fn start_cam(
        &mut self,
        workflow: Arc<dyn CamWorkflow>,
    ) -> Result<JobId, Error> {
        if self.is_running(JobKind::Cam) {
            return Err(Error::JobAlreadyRunning(JobKind::Cam));
        }
        let design = self.healthy_design()?;
        self.status = format!("Generating {} toolpath", workflow.name());
        let job = self.spawn(JobKind::Cam, move |cancel| {
            workflow.run(&design, cancel)
        })?;
        let id = job.id();
        self.jobs.insert(id, Work::Cam(job));
        Ok(id)
    }

    /// Cancels every running job, drops the pending render, and stops the
    /// fab process
    ///
    /// Cancelled jobs are reaped by later calls to [`tick`](Self::tick).
    pub fn cancel_all(&mut self) {
        for w in self.jobs.values() {
            w.request_cancel();
        }
        if self.pending.take().is_some() {
            self.states[JobKind::Render] = Some(JobState::Cancelled);
        }
        // Results from renders which are still running must not be published
        self.generation += 1;
        if let Some(mut fab) = self.fab.take() {
            fab.kill();
            self.states[JobKind::Fab] = Some(JobState::Cancelled);
        }
    }

    /// Cancels everything and forgets the current design
    pub fn reset(&mut self) {
        self.cancel_all();
        self.design = None;
        self.mode = None;
        self.failed = false;
        self.meshes.clear();
        self.image = None;
        self.flat = None;
        self.output.clear();
        self.status.clear();
        self.error_line = None;
        self.border = None;
        self.toolpath = None;
        self.lod.invalidate();
    }

    /// Notifies the orchestrator that the 3D camera moved
    pub fn view_changed(&mut self) {
        self.lod.invalidate();
    }

    ////////////////////////////////////////////////////////////////////////////
    // Per-frame work

    /// Reaps finished jobs, then runs one level-of-detail step if idle
    ///
    /// This function never blocks.
    pub fn tick(&mut self) {
        self.reap();
        self.poll_fab();
        if let Err(e) = self.start_pending_render() {
            warn!("could not start render: {e}");
            self.status = format!("Error: {e}");
        }
        if let Err(e) = self.lod_step() {
            warn!("could not start mesh job: {e}");
        }
    }

    /// Joins every job which has finished, in completion order
    fn reap(&mut self) {
        self.finished.extend(self.done_rx.try_iter());
        while let Some(&id) = self.finished.front() {
            let Some(w) = self.jobs.get(&id) else {
                self.finished.pop_front();
                continue;
            };
            // The id is posted just before the thread exits; wait for the
            // exit to preserve ordering without blocking.
            if !w.is_finished() {
                break;
            }
            self.finished.pop_front();
            if let Some(w) = self.jobs.remove(&id) {
                self.publish(w);
            }
        }
    }

    fn publish(&mut self, w: Work) {
        match w {
            Work::Render {
                job, generation, ..
            } => {
                let out = job.join();
                if generation != self.generation {
                    debug!("discarding stale render {generation}");
                    return;
                }
                self.states[JobKind::Render] = Some(out.state());
                match out {
                    Outcome::Done(r) => self.publish_render(r),
                    Outcome::Failed(e) => self.render_failed(e),
                    Outcome::Cancelled => (),
                }
            }
            Work::Export(job) => {
                let out = job.join();
                self.states[JobKind::Export] = Some(out.state());
                match out {
                    Outcome::Done(path) => {
                        self.status = format!("Exported to {}", path.display())
                    }
                    Outcome::Failed(e) => self.status = format!("Export failed: {e}"),
                    Outcome::Cancelled => self.status = "Export cancelled".into(),
                }
            }
            Work::Cam(job) => {
                let out = job.join();
                self.states[JobKind::Cam] = Some(out.state());
                match out {
                    Outcome::Done(t) => {
                        info!("generated toolpath with {} paths", t.paths.len());
                        self.status.clear();
                        self.toolpath = Some(t);
                    }
                    Outcome::Failed(e) => self.status = format!("CAM failed: {e}"),
                    Outcome::Cancelled => (),
                }
            }
            Work::Mesh(job) => {
                let kind = job.kind();
                let out = job.join();
                self.states[kind] = Some(out.state());
                match out {
                    Outcome::Done(cell) => self.publish_cell(cell),
                    Outcome::Failed(e) => {
                        // Stop streaming instead of retrying the same cell on
                        // every frame; moving the camera will try again.
                        self.status = format!("Error: {e}");
                        self.lod.settle();
                    }
                    Outcome::Cancelled => (),
                }
            }
        }
    }

    fn publish_render(&mut self, r: RenderOutput) {
        info!("publishing render of {} shapes", r.design.shapes.len());
        // Cached renders reuse the same design, so the fab input and the
        // toolpath only go stale when the script was re-evaluated.
        if r.from_script {
            if let Some(fab) = &mut self.fab {
                if let Err(e) = fab.update(&r.design) {
                    warn!("could not update fab input: {e}");
                }
            }
            self.toolpath = None;
        }
        self.design = Some(r.design);
        self.mode = Some(r.mode);
        self.failed = false;
        self.error_line = None;
        self.border = None;
        self.status.clear();
        self.image = r.image;
        self.flat = r.flat;
        self.output = r.log;
        if let Some(meshes) = r.meshes {
            self.meshes = meshes;
            self.lod.invalidate();
        }
    }

    fn render_failed(&mut self, e: Error) {
        self.failed = true;
        self.border = Some(ERROR_BORDER);
        self.error_line = match &e {
            Error::ScriptEvaluation { line, .. } => *line,
            _ => None,
        };
        self.status = match &e {
            Error::ScriptEvaluation { line: Some(i), .. } => {
                format!("Script failed (line {})", i + 1)
            }
            Error::ScriptEvaluation { line: None, .. } => "Script failed".into(),
            e => format!("Error: {e}"),
        };
        self.output = e.to_string();
    }

    fn publish_cell(&mut self, mut cell: MeshCell) {
        for root in &mut self.meshes {
            match root.replace(cell) {
                Ok(()) => {
                    self.lod.invalidate();
                    return;
                }
                Err(c) => cell = c,
            }
        }
        debug!("discarding result for cell {}, which is gone", cell.id());
    }

    fn poll_fab(&mut self) {
        if self.fab.as_mut().is_some_and(|f| !f.is_alive()) {
            self.fab = None;
            self.states[JobKind::Fab] = Some(JobState::Done);
        }
    }

    fn start_pending_render(&mut self) -> Result<(), Error> {
        if self.is_running(JobKind::Render) {
            return Ok(());
        }
        let Some(p) = self.pending.take() else {
            return Ok(());
        };
        let script = match p.input {
            RenderInput::Script(s) => Some(s),
            RenderInput::Cached => None,
        };
        let task = RenderTask {
            view: p.view,
            make_mesh: script.is_some() || self.meshes.is_empty(),
            script,
            design: self.design.clone(),
            evaluator: self.ctx.evaluator.clone(),
            stage: StageCell::default(),
        };
        let stage = task.stage.clone();
        let job = match self.spawn(JobKind::Render, move |cancel| task.run(cancel))
        {
            Ok(job) => job,
            Err(e) => {
                // The request is gone, so it must not stay pending
                self.states[JobKind::Render] = Some(JobState::Failed);
                self.status = format!("Error: {e}");
                return Err(e);
            }
        };
        self.jobs.insert(
            job.id(),
            Work::Render {
                job,
                generation: p.generation,
                stage,
            },
        );
        Ok(())
    }

    /// Runs one level-of-detail step, if nothing else is happening
    fn lod_step(&mut self) -> Result<(), Error> {
        if self.is_busy() || self.fab.is_some() {
            return Ok(());
        }
        if self.failed || self.design.is_none() || self.meshes.is_empty() {
            return Ok(());
        }
        let Some(step) = self.lod.tick(&self.meshes, self.ctx.sampler.as_mut())
        else {
            return Ok(());
        };
        let (kind, id) = match step {
            LodStep::Refine(id) => (JobKind::Refine, id),
            LodStep::Collapse(id) => (JobKind::Collapse, id),
        };
        let cell = self
            .meshes
            .iter()
            .find_map(|r| r.find(id))
            .cloned()
            .ok_or(Error::BadCell)?;
        let loader = self.ctx.loader.clone();
        let job = self.spawn(kind, move |cancel| match kind {
            JobKind::Refine => refine(cell, loader.as_ref(), cancel),
            _ => collapse(cell, loader.as_ref(), cancel),
        })?;
        self.jobs.insert(job.id(), Work::Mesh(job));
        Ok(())
    }

    fn spawn<T, F>(&mut self, kind: JobKind, f: F) -> Result<Job<T>, Error>
    where
        T: Send + 'static,
        F: FnOnce(&JobCancel) -> Result<T, Error> + Send + 'static,
    {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_spawn) {
            return Err(std::io::Error::other("could not spawn thread").into());
        }
        let id = JobId(self.next_id);
        self.next_id += 1;
        let job =
            Job::spawn(id, kind, JobCancel::new(), self.completion.clone(), f)?;
        self.states[kind] = Some(JobState::Running);
        Ok(job)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Teardown

    /// Cancels everything, then waits for job threads to exit
    ///
    /// Threads which are still stuck in a native call after `timeout` are
    /// abandoned.  Returns `true` if every thread was joined.
    pub fn shutdown(&mut self, timeout: Duration) -> bool {
        self.cancel_all();
        let end = Instant::now() + timeout;
        while !self.jobs.is_empty() && Instant::now() < end {
            let done = self
                .jobs
                .iter()
                .filter(|(_, w)| w.is_finished())
                .map(|(id, _)| *id)
                .collect::<Vec<_>>();
            for id in done {
                if let Some(w) = self.jobs.remove(&id) {
                    // Stale generation, so renders are discarded
                    self.publish(w);
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let joined = self.jobs.is_empty();
        for (id, w) in std::mem::take(&mut self.jobs) {
            warn!("abandoning {} job {id}", w.kind());
        }
        self.finished.clear();
        joined
    }

    ////////////////////////////////////////////////////////////////////////////
    // Exposed state

    fn is_running(&self, kind: JobKind) -> bool {
        self.jobs.values().any(|w| w.kind() == kind)
    }

    fn healthy_design(&self) -> Result<Arc<DesignResult>, Error> {
        match &self.design {
            None => Err(Error::NoDesign),
            Some(..) if self.failed => Err(Error::DesignFailed),
            Some(d) => Ok(d.clone()),
        }
    }

    /// Checks whether any job thread is alive or a render is pending
    ///
    /// The fab process is not counted.
    pub fn is_busy(&self) -> bool {
        !self.jobs.is_empty() || self.pending.is_some()
    }

    /// Checks whether the level-of-detail controller has nothing left to do
    pub fn lod_converged(&self) -> bool {
        self.lod.is_converged()
    }

    /// Last known state of the given kind of job
    ///
    /// Returns `None` if no job of that kind has ever been started.
    pub fn job_state(&self, kind: JobKind) -> Option<JobState> {
        self.states[kind]
    }

    /// Status line text
    pub fn status(&self) -> &str {
        let stage = self.jobs.values().find_map(|w| match w {
            Work::Render {
                stage, generation, ..
            } if *generation == self.generation => Some(stage.get().status()),
            _ => None,
        });
        match stage {
            Some(s) if !s.is_empty() => s,
            _ => &self.status,
        }
    }

    /// Zero-indexed script line which caused the last render to fail
    pub fn error_line(&self) -> Option<usize> {
        self.error_line
    }

    /// Viewport border color, which is set when the last render failed
    pub fn border(&self) -> Option<[u8; 3]> {
        self.border
    }

    /// Most recently published design
    pub fn current_design(&self) -> Option<&Arc<DesignResult>> {
        self.design.as_ref()
    }

    /// Render mode of the most recently published render, after applying the
    /// design's override
    pub fn render_mode(&self) -> Option<RenderMode> {
        self.mode
    }

    /// Checks whether the most recent render failed
    pub fn design_failed(&self) -> bool {
        self.failed
    }

    /// Mesh octree roots, one per 3D shape
    pub fn meshes(&self) -> &[MeshCell] {
        &self.meshes
    }

    /// First mesh octree root, if any
    pub fn current_mesh_root(&self) -> Option<&MeshCell> {
        self.meshes.first()
    }

    /// Merged height-map image
    pub fn image(&self) -> Option<&Image> {
        self.image.as_ref()
    }

    /// Merged image of flat (2D) shapes, for display in the 3D view
    pub fn flat_image(&self) -> Option<&Image> {
        self.flat.as_ref()
    }

    /// Log from the most recent render
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Progress of the most recent export, as a percentage
    pub fn export_progress(&self) -> Option<u8> {
        self.export_progress.as_ref().map(|p| p.get())
    }

    /// Most recently generated toolpath
    pub fn toolpath(&self) -> Option<&Toolpath> {
        self.toolpath.as_ref()
    }
}

impl Drop for TaskOrchestrator {
    fn drop(&mut self) {
        self.shutdown(self.settings.shutdown_timeout);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        cam::RasterWorkflow,
        design::Shape,
        mesh::GeometrySource,
        test_util::{
            DepthSampler, FakeEvaluator, FakeLoader, FakeShape, FixedSampler,
            cancellable_sleep, triangle_in, unit_box,
        },
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn slow_cube(ms: u64) -> FakeShape {
        let mut s = FakeShape::cube();
        s.delay = Duration::from_millis(ms);
        s
    }

    fn orchestrator_with(sampler: Box<dyn ScreenSampler>) -> TaskOrchestrator {
        TaskOrchestrator::new(
            OrchestratorContext {
                evaluator: Arc::new(FakeEvaluator::default()),
                loader: Arc::new(FakeLoader),
                sampler,
                wake: None,
            },
            OrchestratorSettings::default(),
        )
    }

    /// Orchestrator whose sampler scores every leaf as zero
    fn orchestrator() -> TaskOrchestrator {
        orchestrator_with(Box::new(FixedSampler::new([])))
    }

    /// Ticks until the predicate is true, panicking after a few seconds
    fn tick_until<F: Fn(&TaskOrchestrator) -> bool>(
        t: &mut TaskOrchestrator,
        f: F,
    ) {
        let end = Instant::now() + Duration::from_secs(5);
        loop {
            t.tick();
            if f(t) {
                return;
            }
            assert!(Instant::now() < end, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn render(t: &mut TaskOrchestrator, script: &str) {
        t.start_render(View::default(), RenderInput::Script(script.to_owned()))
            .unwrap();
        tick_until(t, |t| !t.is_busy());
    }

    #[test]
    fn single_flight_export() {
        let mut t = orchestrator();
        let path = std::env::temp_dir()
            .join(format!("taskbot-orch-{}.math", std::process::id()));
        assert!(matches!(
            t.start_export(ExportOptions::new(&path)),
            Err(Error::NoDesign)
        ));

        // Use a slow shape so that the export is still running
        render(&mut t, "cube");
        let mut opts = ExportOptions::new(&path);
        opts.format = Some(crate::export::ExportFormat::Asdf);
        let slow: Arc<dyn Shape> = Arc::new(slow_cube(200));
        t.design = Some(Arc::new(DesignResult::new(vec![slow])));

        t.start_export(opts.clone()).unwrap();
        assert_eq!(t.job_state(JobKind::Export), Some(JobState::Running));
        match t.start_export(opts.clone()) {
            Err(Error::JobAlreadyRunning(JobKind::Export)) => (),
            r => panic!("unexpected result {r:?}"),
        }
        assert_eq!(t.jobs.len(), 1);
        tick_until(&mut t, |t| !t.is_busy());
        assert_eq!(t.job_state(JobKind::Export), Some(JobState::Done));
        assert_eq!(t.export_progress(), Some(100));
        std::fs::remove_file(&path).unwrap();
    }

    /// CAM workflow which sleeps before producing an empty toolpath
    struct SlowWorkflow(Duration);

    impl CamWorkflow for SlowWorkflow {
        fn name(&self) -> &str {
            "slow"
        }

        fn run(
            &self,
            _design: &DesignResult,
            cancel: &JobCancel,
        ) -> Result<Toolpath, Error> {
            cancellable_sleep(self.0, &cancel.hard)?;
            Ok(Toolpath::default())
        }
    }

    #[test]
    fn single_flight_cam() {
        let mut t = orchestrator();
        render(&mut t, "cube");
        let slow = Arc::new(SlowWorkflow(Duration::from_secs(5)));
        t.start_cam(slow.clone()).unwrap();
        assert_eq!(t.job_state(JobKind::Cam), Some(JobState::Running));
        match t.start_cam(slow) {
            Err(Error::JobAlreadyRunning(JobKind::Cam)) => (),
            r => panic!("unexpected result {r:?}"),
        }
        assert_eq!(t.jobs.len(), 1);

        t.cancel_all();
        tick_until(&mut t, |t| !t.is_busy());
        assert_eq!(t.job_state(JobKind::Cam), Some(JobState::Cancelled));
        assert!(t.toolpath().is_none());
    }

    #[test]
    fn render_spawn_failure() {
        let mut t = orchestrator();
        t.fail_spawn = true;
        assert!(matches!(
            t.start_render(View::default(), RenderInput::Script("cube".into())),
            Err(Error::IoError(..))
        ));
        assert_eq!(t.job_state(JobKind::Render), Some(JobState::Failed));
        assert!(!t.is_busy());
        assert!(t.status().starts_with("Error: "));

        // The next request goes through
        render(&mut t, "cube");
        assert_eq!(t.job_state(JobKind::Render), Some(JobState::Done));
    }

    #[test]
    fn render_mode_is_published() {
        let mut t = orchestrator();
        assert_eq!(t.render_mode(), None);
        render(&mut t, "cube");
        assert_eq!(t.render_mode(), Some(RenderMode::Shaded));
        render(&mut t, "cube\nheight");
        assert_eq!(t.render_mode(), Some(RenderMode::Height));
        t.reset();
        assert_eq!(t.render_mode(), None);
    }

    #[test]
    fn script_render_clears_toolpath() {
        let mut t = orchestrator();
        render(&mut t, "cube");
        t.start_cam(Arc::new(RasterWorkflow::default())).unwrap();
        tick_until(&mut t, |t| !t.is_busy());
        assert!(t.toolpath().is_some());

        t.start_render(View::default(), RenderInput::Cached).unwrap();
        tick_until(&mut t, |t| !t.is_busy());
        assert!(t.toolpath().is_some());

        render(&mut t, "cube");
        assert!(t.toolpath().is_none());
    }

    #[test]
    fn render_supersession() {
        let mut t = orchestrator();
        let evaluator = Arc::new(FakeEvaluator::default());
        t.ctx.evaluator = evaluator.clone();
        t.start_render(
            View::default(),
            RenderInput::Script("delay 5000\ncube".to_owned()),
        )
        .unwrap();
        t.start_render(
            View::default(),
            RenderInput::Script("cube\ncube".to_owned()),
        )
        .unwrap();
        // The first render's thread is still alive, so the second waits
        assert!(t.pending.is_some());
        assert_eq!(t.job_state(JobKind::Render), Some(JobState::Pending));

        tick_until(&mut t, |t| !t.is_busy());
        let d = t.current_design().unwrap();
        assert_eq!(d.shapes.len(), 2);
        assert_eq!(t.meshes().len(), 2);
        assert_eq!(evaluator.calls.load(Ordering::Relaxed), 2);
        assert_eq!(t.job_state(JobKind::Render), Some(JobState::Done));
    }

    #[test]
    fn pending_render_is_replaced() {
        let mut t = orchestrator();
        let evaluator = Arc::new(FakeEvaluator::default());
        t.ctx.evaluator = evaluator.clone();
        let script = |s: &str| RenderInput::Script(s.to_owned());
        t.start_render(View::default(), script("delay 5000\ncube"))
            .unwrap();
        t.start_render(View::default(), script("cube")).unwrap();
        t.start_render(View::default(), script("cube\ncube\ncube"))
            .unwrap();
        tick_until(&mut t, |t| !t.is_busy());
        assert_eq!(t.current_design().unwrap().shapes.len(), 3);
        // The middle request never started
        assert_eq!(evaluator.calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn failed_render_keeps_design() {
        let mut t = orchestrator();
        render(&mut t, "cube");
        let before = t.current_design().unwrap().clone();
        assert_eq!(t.border(), None);

        render(&mut t, "cube\n\nfail");
        assert!(Arc::ptr_eq(t.current_design().unwrap(), &before));
        assert!(t.design_failed());
        assert_eq!(t.error_line(), Some(2));
        assert_eq!(t.border(), Some(ERROR_BORDER));
        assert_eq!(t.status(), "Script failed (line 3)");
        assert_eq!(t.job_state(JobKind::Render), Some(JobState::Failed));

        assert!(matches!(
            t.start_export(ExportOptions::new("out.stl")),
            Err(Error::DesignFailed)
        ));
        assert!(matches!(
            t.start_cam(Arc::new(RasterWorkflow::default())),
            Err(Error::DesignFailed)
        ));

        // A later successful render clears the error state
        render(&mut t, "cube");
        assert!(!t.design_failed());
        assert_eq!(t.border(), None);
        assert_eq!(t.error_line(), None);
    }

    #[test]
    fn cached_render() {
        let mut t = orchestrator();
        assert!(matches!(
            t.start_render(View::default(), RenderInput::Cached),
            Err(Error::NoDesign)
        ));
        render(&mut t, "cube");
        let root = t.current_mesh_root().unwrap().id();
        t.start_render(View::default(), RenderInput::Cached).unwrap();
        tick_until(&mut t, |t| !t.is_busy());
        // Cached renders keep the existing meshes
        assert_eq!(t.current_mesh_root().unwrap().id(), root);
    }

    #[test]
    fn refine_root() {
        let mut t = orchestrator_with(Box::new(DepthSampler {
            f: |d: u8| if d == 0 { 0.1 } else { 0.03 },
        }));
        render(&mut t, "cube");
        tick_until(&mut t, |t| !t.is_busy() && t.lod_converged());

        let root = t.current_mesh_root().unwrap();
        assert_eq!(root.children().len(), 8);
        assert!(root.geometry().is_none());
        for c in root.children() {
            assert_eq!(c.depth(), 1);
            assert!(c.is_leaf());
        }
        assert!(root.check().is_ok());
        assert_eq!(t.job_state(JobKind::Refine), Some(JobState::Done));
        assert_eq!(t.job_state(JobKind::Collapse), None);
    }

    #[test]
    fn refine_then_collapse() {
        let phase = Arc::new(AtomicUsize::new(0));
        let p = phase.clone();
        let mut t = orchestrator_with(Box::new(DepthSampler {
            f: move |d: u8| match (p.load(Ordering::Relaxed), d) {
                (0, 0) => 0.1,
                (0, _) => 0.03,
                _ => 0.0,
            },
        }));
        render(&mut t, "cube");
        tick_until(&mut t, |t| !t.is_busy() && t.lod_converged());
        let id = t.current_mesh_root().unwrap().id();
        assert!(!t.current_mesh_root().unwrap().is_leaf());

        // Zoom out, so that the children are tiny
        phase.store(1, Ordering::Relaxed);
        t.view_changed();
        tick_until(&mut t, |t| !t.is_busy() && t.lod_converged());
        let root = t.current_mesh_root().unwrap();
        assert_eq!(root.id(), id);
        assert!(root.is_leaf());
        assert!(root.check().is_ok());
        assert_eq!(t.job_state(JobKind::Collapse), Some(JobState::Done));
    }

    #[test]
    fn render_discards_stale_refine() {
        let mut t = orchestrator_with(Box::new(DepthSampler {
            f: |d: u8| if d == 0 { 0.1 } else { 0.03 },
        }));
        // Start from a design whose refinement is slow
        let slow: Arc<dyn Shape> = Arc::new(slow_cube(100));
        t.design = Some(Arc::new(DesignResult::new(vec![slow.clone()])));
        t.meshes = vec![MeshCell::new(
            unit_box(),
            triangle_in(&unit_box()),
            GeometrySource::Expression {
                shape: slow,
                depth: 0,
                scale: 1.0,
            },
        )];
        let old = t.meshes[0].id();
        t.tick();
        assert_eq!(t.job_state(JobKind::Refine), Some(JobState::Running));

        // A new render cancels the refinement and replaces the roots
        t.start_render(View::default(), RenderInput::Script("cube".into()))
            .unwrap();
        tick_until(&mut t, |t| !t.is_busy() && t.lod_converged());
        let root = t.current_mesh_root().unwrap();
        assert_ne!(root.id(), old);
        assert!(t.meshes().iter().all(|r| r.find(old).is_none()));
        assert_eq!(root.children().len(), 8);
        assert!(root.check().is_ok());
    }

    #[test]
    fn cam_job() {
        let mut t = orchestrator();
        render(&mut t, "cube");
        t.start_cam(Arc::new(RasterWorkflow::default())).unwrap();
        tick_until(&mut t, |t| !t.is_busy());
        assert!(!t.toolpath().unwrap().is_empty());
        assert_eq!(t.job_state(JobKind::Cam), Some(JobState::Done));
    }

    #[test]
    fn wake_channel() {
        let (tx, rx) = unbounded();
        let mut t = TaskOrchestrator::new(
            OrchestratorContext {
                evaluator: Arc::new(FakeEvaluator::default()),
                loader: Arc::new(FakeLoader),
                sampler: Box::new(FixedSampler::new([])),
                wake: Some(tx),
            },
            OrchestratorSettings::default(),
        );
        t.start_render(View::default(), RenderInput::Script("cube".into()))
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        tick_until(&mut t, |t| !t.is_busy());
        assert!(t.current_design().is_some());
    }

    #[test]
    fn reset_and_shutdown() {
        let mut t = orchestrator();
        render(&mut t, "cube");
        t.start_render(
            View::default(),
            RenderInput::Script("delay 5000\ncube".into()),
        )
        .unwrap();
        t.reset();
        assert!(t.current_design().is_none());
        assert!(t.meshes().is_empty());
        assert!(t.shutdown(Duration::from_secs(5)));
        assert!(!t.is_busy());
    }

    #[test]
    fn status_text() {
        let mut t = orchestrator();
        t.start_render(
            View::default(),
            RenderInput::Script("delay 5000\ncube".into()),
        )
        .unwrap();
        let end = Instant::now() + Duration::from_secs(5);
        while t.status() != "Converting to math string" {
            assert!(Instant::now() < end, "timed out");
            std::thread::sleep(Duration::from_millis(1));
        }
        t.cancel_all();
        tick_until(&mut t, |t| !t.is_busy());
        assert_eq!(t.status(), "");
        assert!(t.current_design().is_none());
    }
}
