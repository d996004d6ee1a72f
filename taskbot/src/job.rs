//! Cancellable background jobs, each running on its own thread
//!
//! A [`Job`] never touches shared state: its closure computes a value on the
//! job thread, and the orchestrator publishes that value after joining the
//! thread.  When the closure returns (or panics), the job posts its id on a
//! completion channel, which lets the orchestrator reap jobs in the order in
//! which they finished.
use crate::{Error, cancel::JobCancel};
use crossbeam_channel::Sender;
use log::{debug, warn};
use std::{panic::AssertUnwindSafe, thread::JoinHandle};

/// Kinds of background work
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, strum::Display, enum_map::Enum,
)]
#[strum(serialize_all = "lowercase")]
pub enum JobKind {
    /// Evaluates a script and builds images and meshes
    Render,
    /// Writes the current design to a file
    Export,
    /// External fab-modules process
    Fab,
    /// Toolpath generation
    Cam,
    /// Subdivides one mesh cell
    Refine,
    /// Merges one mesh cell's children
    Collapse,
}

/// Lifecycle state of a job
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    /// Accepted, but not yet started
    Pending,
    /// Thread (or process) is alive
    Running,
    /// Finished successfully
    Done,
    /// Finished with an error
    Failed,
    /// Stopped early because it was cancelled
    Cancelled,
}

impl JobState {
    /// Checks whether this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }
}

/// Unique job identifier
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct JobId(pub(crate) u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of joining a job
#[derive(Debug)]
pub enum Outcome<T> {
    /// The job produced a value
    Done(T),
    /// The job returned an error (or panicked)
    Failed(Error),
    /// The job noticed a cancellation and stopped early
    Cancelled,
}

impl<T> Outcome<T> {
    /// Terminal state corresponding to this outcome
    pub fn state(&self) -> JobState {
        match self {
            Outcome::Done(..) => JobState::Done,
            Outcome::Failed(..) => JobState::Failed,
            Outcome::Cancelled => JobState::Cancelled,
        }
    }
}

/// Channels used by a job thread to announce that it has finished
#[derive(Clone)]
pub(crate) struct Completion {
    pub done: Sender<JobId>,
    pub wake: Option<Sender<()>>,
}

impl Completion {
    fn notify(&self, id: JobId) {
        // The receivers may be gone if the orchestrator was torn down while
        // this job was running; nobody is waiting for us in that case.
        let _ = self.done.send(id);
        if let Some(w) = &self.wake {
            let _ = w.send(());
        }
    }
}

/// A unit of background work running on a dedicated thread
pub struct Job<T> {
    id: JobId,
    kind: JobKind,
    cancel: JobCancel,
    handle: JoinHandle<Result<T, Error>>,
}

impl<T: Send + 'static> Job<T> {
    /// Spawns a thread running `f`
    ///
    /// Errors and panics inside `f` are captured and returned from
    /// [`join`](Self::join); they never unwind into the caller.
    pub(crate) fn spawn<F>(
        id: JobId,
        kind: JobKind,
        cancel: JobCancel,
        completion: Completion,
        f: F,
    ) -> Result<Self, Error>
    where
        F: FnOnce(&JobCancel) -> Result<T, Error> + Send + 'static,
    {
        let c = cancel.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{kind}-{id}"))
            .spawn(move || {
                let r = std::panic::catch_unwind(AssertUnwindSafe(|| f(&c)))
                    .unwrap_or_else(|p| Err(Error::Panicked(panic_message(&p))));
                completion.notify(id);
                r
            })?;
        debug!("spawned {kind} job {id}");
        Ok(Self {
            id,
            kind,
            cancel,
            handle,
        })
    }
}

impl<T> Job<T> {
    /// Unique id of this job
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Kind of this job
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Checks whether the job's thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Requests that the job stop, setting both cancellation flags
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Joins the job's thread
    ///
    /// This blocks if the thread has not exited; the orchestrator only calls
    /// it after [`is_finished`](Self::is_finished) returns `true`.
    pub fn join(self) -> Outcome<T> {
        let (id, kind) = (self.id, self.kind);
        let out = match self.handle.join() {
            Ok(Ok(v)) => Outcome::Done(v),
            Ok(Err(Error::Aborted)) => Outcome::Cancelled,
            Ok(Err(e)) => Outcome::Failed(e),
            // Panics are caught inside the thread, so this is unreachable in
            // practice; treat it as a failure anyways.
            Err(p) => Outcome::Failed(Error::Panicked(panic_message(&p))),
        };
        match &out {
            Outcome::Failed(e) => warn!("{kind} job {id} failed: {e}"),
            o => debug!("{kind} job {id} finished: {}", o.state()),
        }
        out
    }
}

fn panic_message(p: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crossbeam_channel::unbounded;

    fn completion() -> (Completion, crossbeam_channel::Receiver<JobId>) {
        let (tx, rx) = unbounded();
        (Completion { done: tx, wake: None }, rx)
    }

    #[test]
    fn job_done() {
        let (c, rx) = completion();
        let job = Job::spawn(JobId(1), JobKind::Cam, JobCancel::new(), c, |_| {
            Ok(42)
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap(), JobId(1));
        assert!(matches!(job.join(), Outcome::Done(42)));
    }

    #[test]
    fn job_failed() {
        let (c, rx) = completion();
        let job =
            Job::<()>::spawn(JobId(2), JobKind::Export, JobCancel::new(), c, |_| {
                Err(Error::UnboundedGeometry)
            })
            .unwrap();
        rx.recv().unwrap();
        match job.join() {
            Outcome::Failed(Error::UnboundedGeometry) => (),
            o => panic!("unexpected outcome {o:?}"),
        }
    }

    #[test]
    fn job_panic_is_captured() {
        let (c, rx) = completion();
        let job =
            Job::<()>::spawn(JobId(3), JobKind::Render, JobCancel::new(), c, |_| {
                panic!("oh no")
            })
            .unwrap();
        rx.recv().unwrap();
        match job.join() {
            Outcome::Failed(Error::Panicked(s)) => assert_eq!(s, "oh no"),
            o => panic!("unexpected outcome {o:?}"),
        }
    }

    #[test]
    fn job_cancelled() {
        let (c, rx) = completion();
        let (go_tx, go_rx) = unbounded::<()>();
        let job = Job::<()>::spawn(
            JobId(4),
            JobKind::Refine,
            JobCancel::new(),
            c,
            move |cancel| {
                go_rx.recv().unwrap();
                cancel.checkpoint()?;
                Ok(())
            },
        )
        .unwrap();
        job.request_cancel();
        go_tx.send(()).unwrap();
        rx.recv().unwrap();
        assert!(matches!(job.join(), Outcome::Cancelled));
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert_eq!(JobKind::Collapse.to_string(), "collapse");
    }
}
