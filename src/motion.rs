//! Slice-level motion correction between reconstruction passes.
//!
//! Registration itself lives outside this crate. A [`MotionCorrection`]
//! driver receives the current volume, the stacks and their transforms, and
//! returns an updated transform set of the same shape.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{Result, SrrError};
use crate::io;
use crate::stack::{Stack, TransformSet};
use crate::volume::Volume;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub trait MotionCorrection {
    fn correct(
        &mut self,
        volume: &Volume,
        stacks: &[Stack],
        transforms: &TransformSet,
    ) -> Result<TransformSet>;
}

impl<M: MotionCorrection + ?Sized> MotionCorrection for Box<M> {
    fn correct(
        &mut self,
        volume: &Volume,
        stacks: &[Stack],
        transforms: &TransformSet,
    ) -> Result<TransformSet> {
        (**self).correct(volume, stacks, transforms)
    }
}

/// Keeps every transform as it is.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticDriver;

impl MotionCorrection for StaticDriver {
    fn correct(
        &mut self,
        _volume: &Volume,
        _stacks: &[Stack],
        transforms: &TransformSet,
    ) -> Result<TransformSet> {
        Ok(transforms.clone())
    }
}

/// Runs an external registration command once per cycle.
///
/// Each invocation gets a fresh directory `<work_dir>/cycleNN` containing
/// `volume.npy` (+ `volume.json`), `stacks/stacks.json` with its arrays and
/// `transforms_in.json`. The directory is passed as the last argument; the
/// command must write `transforms_out.json` there and exit with status 0.
/// Its stdout and stderr go to `driver.log` in the same directory.
#[derive(Debug, Clone)]
pub struct CommandDriver {
    program: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
    timeout: Duration,
    invocations: usize,
}

impl CommandDriver {
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: work_dir.into(),
            timeout: Duration::from_secs(600),
            invocations: 0,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn invocations(&self) -> usize {
        self.invocations
    }

    fn prepare(
        &self,
        dir: &Path,
        volume: &Volume,
        stacks: &[Stack],
        transforms: &TransformSet,
    ) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| SrrError::io(format!("Failed to create {}: {e}", dir.display())))?;
        io::write_volume(&dir.join("volume.npy"), volume)?;
        io::write_stacks(&dir.join("stacks"), stacks)?;
        io::write_transforms(&dir.join("transforms_in.json"), transforms)
    }

    fn execute(&self, dir: &Path) -> Result<ExitStatus> {
        let log_path = dir.join("driver.log");
        let log = File::create(&log_path)
            .map_err(|e| SrrError::io(format!("Failed to create {}: {e}", log_path.display())))?;
        let log_err = log
            .try_clone()
            .map_err(|e| SrrError::io(format!("Failed to share {}: {e}", log_path.display())))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| {
                SrrError::driver(format!("failed to start {}: {e}", self.program.display()))
            })?;

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if start.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SrrError::driver(format!(
                        "{} timed out after {:.1?}",
                        self.program.display(),
                        self.timeout
                    )));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    return Err(SrrError::driver(format!(
                        "failed to wait for {}: {e}",
                        self.program.display()
                    )))
                }
            }
        }
    }

    fn run(
        &mut self,
        volume: &Volume,
        stacks: &[Stack],
        transforms: &TransformSet,
    ) -> Result<TransformSet> {
        self.invocations += 1;
        let dir = self.work_dir.join(format!("cycle{:02}", self.invocations));
        self.prepare(&dir, volume, stacks, transforms)?;
        info!(
            "running motion correction '{}' in {}",
            self.program.display(),
            dir.display()
        );

        let started = Instant::now();
        let status = self.execute(&dir)?;
        if !status.success() {
            return Err(SrrError::driver(format!(
                "{} exited with {status}; see {}",
                self.program.display(),
                dir.join("driver.log").display()
            )));
        }
        debug!("motion correction finished in {:.2?}", started.elapsed());

        let updated = io::read_transforms(&dir.join("transforms_out.json"))?;
        check_shape(transforms, &updated)?;
        Ok(updated)
    }
}

impl MotionCorrection for CommandDriver {
    fn correct(
        &mut self,
        volume: &Volume,
        stacks: &[Stack],
        transforms: &TransformSet,
    ) -> Result<TransformSet> {
        self.run(volume, stacks, transforms)
            .map_err(into_driver_failure)
    }
}

/// Fold any error raised while driving motion correction into
/// [`SrrError::ExternalDriverFailure`].
pub fn into_driver_failure(err: SrrError) -> SrrError {
    match err {
        SrrError::ExternalDriverFailure(_) => err,
        other => SrrError::driver(other.to_string()),
    }
}

/// The updated set must have one transform per slice, stack by stack.
pub fn check_shape(expected: &TransformSet, actual: &TransformSet) -> Result<()> {
    let lengths = |set: &TransformSet| set.iter().map(Vec::len).collect::<Vec<_>>();
    let (e, a) = (lengths(expected), lengths(actual));
    if e != a {
        return Err(SrrError::driver(format!(
            "transform set shape changed: expected {e:?} slices per stack, got {a:?}"
        )));
    }
    Ok(())
}
