//! External fab-modules process
//!
//! The fab process reads the current design from a math file on disk.  The
//! orchestrator rewrites that file whenever a new design is published, so the
//! external tool always sees the latest render.
use crate::{Error, design::DesignResult};
use log::{debug, warn};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::{Child, Command},
    sync::atomic::{AtomicU64, Ordering},
};

/// A running fab process, along with the math file that it reads
pub struct FabProcess {
    child: Child,
    path: PathBuf,
}

impl FabProcess {
    /// Writes the design to a temporary file and launches `command` on it
    ///
    /// `command` is split on whitespace; the first word is the program and
    /// the remaining words are passed before the file name.
    pub fn spawn(command: &str, design: &DesignResult) -> Result<Self, Error> {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "taskbot-fab-{}-{}.math",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        write_design(&path, design)?;

        let mut words = command.split_whitespace();
        let program = words.next().unwrap_or("fab");
        let child = Command::new(program)
            .args(words)
            .arg(&path)
            .spawn()
            .map_err(|source| {
                let _ = std::fs::remove_file(&path);
                Error::FabSpawn {
                    command: command.to_owned(),
                    source,
                }
            })?;
        debug!("started fab process {} on {path:?}", child.id());
        Ok(Self { child, path })
    }

    /// Path of the math file read by the process
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Checks whether the process is still running
    pub fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("fab process exited with {status}");
                false
            }
            Err(e) => {
                warn!("could not poll fab process: {e}");
                false
            }
        }
    }

    /// Rewrites the math file with a new design
    pub fn update(&mut self, design: &DesignResult) -> Result<(), Error> {
        write_design(&self.path, design)
    }

    /// Kills the process, if it is still running
    pub fn kill(&mut self) {
        if self.is_alive() {
            if let Err(e) = self.child.kill() {
                warn!("could not kill fab process: {e}");
            }
            let _ = self.child.wait();
        }
    }
}

impl Drop for FabProcess {
    fn drop(&mut self) {
        self.kill();
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_design(path: &Path, design: &DesignResult) -> Result<(), Error> {
    let mut f = BufWriter::new(File::create(path)?);
    design.write(&mut f)?;
    f.flush()?;
    Ok(())
}
