// Copyright 2025 Zurich Instruments AG
// SPDX-License-Identifier: Apache-2.0

//! Compile and upload of sequencer sources with a content addressed cache.
//!
//! [`ElfManager::begin`] starts the work for a source and returns a
//! [`ProgressHandle`]. The owner then calls [`ElfManager::step`] in a poll
//! loop of its own choosing until it reports [`ProgressState::Done`]. Each
//! step polls the AWG module once and returns immediately.
//!
//! Phases of a handle:
//!
//! ```text
//! begin ─┬─ binary cached ─────────────────────┬─> Uploading ──> Done
//!        └─> Compiling ──(success/warning)─────┘        │
//!                 └──(failure)──> Failed  <──(failure)──┘
//! ```
//!
//! Binaries are never re-verified: if `<hash>.elf` exists, compilation is
//! skipped. Two managers sharing a module directory may both decide that a
//! binary is missing and compile the same source twice. The result is the
//! same file, so no lock is taken.

use std::thread;
use std::time::{Duration, Instant};

use crate::artifacts::{ArtifactStore, SourceHash};
use crate::nodes::{CompilerStatus, ElfStatus, ModuleNode, NodeValue};
use crate::session::AwgModule;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressState {
    Compiling,
    Uploading { progress: f64 },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compiling,
    Uploading,
    Done,
    Failed,
}

/// Progress of one [`ElfManager::begin`] call.
#[derive(Debug)]
pub struct ProgressHandle {
    hash: SourceHash,
    phase: Phase,
}

impl ProgressHandle {
    pub fn hash(&self) -> &SourceHash {
        &self.hash
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }
}

pub struct ElfManager {
    module: Box<dyn AwgModule>,
    store: ArtifactStore,
    compile_job: Option<SourceHash>,
    upload_job: Option<(SourceHash, Instant)>,
}

impl ElfManager {
    /// Create a manager for `module`, creating the artifact folders in its directory.
    pub fn new(module: Box<dyn AwgModule>) -> Result<Self> {
        let directory = module.get_string(ModuleNode::Directory)?;
        let store = ArtifactStore::new(directory);
        store.ensure_layout()?;
        Ok(Self {
            module,
            store,
            compile_job: None,
            upload_job: None,
        })
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn is_compiling(&self) -> bool {
        self.compile_job.is_some()
    }

    pub fn is_uploading(&self) -> bool {
        self.upload_job.is_some()
    }

    /// Start compiling and uploading `source`.
    ///
    /// Returns promptly. Compilation is skipped if the binary is cached, and
    /// the handle is already done if that binary is the one on the device.
    /// Jobs are not queued: while a compile job runs, or while the binary of
    /// another source is being uploaded, `begin` fails with
    /// [`Error::NotImplemented`]. A `begin` for the source that is being
    /// uploaded follows the running upload.
    pub fn begin(&mut self, source: &str) -> Result<ProgressHandle> {
        let hash = SourceHash::from_source(source);
        if let Some(running) = &self.compile_job {
            return Err(Error::NotImplemented(format!(
                "Compile job for {running} is still running and compile jobs cannot be queued"
            )));
        }
        if let Some((uploading, _)) = self.upload_job.as_ref().filter(|(h, _)| *h != hash) {
            return Err(Error::NotImplemented(format!(
                "Upload of {} is still running and uploads cannot be queued",
                uploading.binary_file_name()
            )));
        }
        self.store.store_source(&hash, source)?;
        if self.store.has_binary(&hash) {
            awg_log::debug!("Binary {} cached, skipping compilation", hash);
            let phase = if self.start_upload(&hash)? {
                Phase::Uploading
            } else {
                Phase::Done
            };
            return Ok(ProgressHandle { hash, phase });
        }
        self.start_compile(&hash)?;
        Ok(ProgressHandle {
            hash,
            phase: Phase::Compiling,
        })
    }

    /// Advance `handle` by one poll of the device.
    ///
    /// Aborting is supported while uploading only.
    pub fn step(
        &mut self,
        handle: &mut ProgressHandle,
        command: Option<Command>,
    ) -> Result<ProgressState> {
        match handle.phase {
            Phase::Done => Ok(ProgressState::Done),
            Phase::Failed => Err(Error::runtime(format!(
                "Compile and upload of {} has already failed",
                handle.hash
            ))),
            Phase::Compiling => {
                if command == Some(Command::Abort) {
                    return Err(Error::NotImplemented(
                        "Aborting a running compilation".to_string(),
                    ));
                }
                let result = self.poll_compile(handle);
                if result.is_err() {
                    handle.phase = Phase::Failed;
                    self.compile_job = None;
                }
                result
            }
            Phase::Uploading => {
                if command == Some(Command::Abort) {
                    handle.phase = Phase::Failed;
                    if self.owns_upload(handle) {
                        self.cancel_upload()?;
                    }
                    return Err(Error::Upload(format!(
                        "Upload of {} aborted",
                        handle.hash.binary_file_name()
                    )));
                }
                let result = self.poll_upload(handle);
                if result.is_err() {
                    handle.phase = Phase::Failed;
                    if self.owns_upload(handle) {
                        self.upload_job = None;
                    }
                }
                result
            }
        }
    }

    /// Step `handle` until it is done, sleeping `poll_interval` between steps.
    ///
    /// Fails with [`Error::Timeout`] only if a `deadline` is given and exceeded.
    pub fn run_to_completion(
        &mut self,
        handle: &mut ProgressHandle,
        poll_interval: Duration,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            let state = self.step(handle, None)?;
            awg_log::diagnostic!("Compile and upload of {}: {:?}", handle.hash, state);
            if state == ProgressState::Done {
                return Ok(());
            }
            if let Some(deadline) = deadline.filter(|d| start.elapsed() >= *d) {
                return Err(Error::Timeout(deadline));
            }
            thread::sleep(poll_interval);
        }
    }

    /// Delete all hash named sources and binaries from the module directory.
    pub fn clear(&self) -> Result<usize> {
        let deleted = self.store.clear()?;
        awg_log::info!(
            "Deleted {} cached artifacts from {}",
            deleted,
            self.store.src_dir().display()
        );
        Ok(deleted)
    }

    fn start_compile(&mut self, hash: &SourceHash) -> Result<()> {
        awg_log::info!("Compiling sequencer program {}", hash);
        self.module.set(ModuleNode::CompilerUpload, false.into())?;
        self.module
            .set(ModuleNode::CompilerSourceFile, hash.source_file_name().into())?;
        self.module.set(ModuleNode::CompilerStart, true.into())?;
        self.compile_job = Some(hash.clone());
        Ok(())
    }

    fn poll_compile(&mut self, handle: &mut ProgressHandle) -> Result<ProgressState> {
        if self.module.get_int(ModuleNode::CompilerStart)? == 1 {
            return Ok(ProgressState::Compiling);
        }
        let status = CompilerStatus::try_from(self.module.get_int(ModuleNode::CompilerStatus)?)?;
        match status {
            CompilerStatus::Idle => return Ok(ProgressState::Compiling),
            CompilerStatus::Failure => {
                self.compile_job = None;
                let status = self.module.get_string(ModuleNode::CompilerStatusString)?;
                return Err(Error::Compilation { status });
            }
            CompilerStatus::Warning => {
                let status = self.module.get_string(ModuleNode::CompilerStatusString)?;
                awg_log::warn!("Compiler warnings for {}: {}", handle.hash, status);
            }
            CompilerStatus::Success => {}
        }
        self.compile_job = None;
        if !self.store.has_binary(&handle.hash) {
            return Err(Error::Compilation {
                status: format!(
                    "compiler reported success but {} is missing",
                    handle.hash.binary_file_name()
                ),
            });
        }
        awg_log::info!("Compilation of {} finished", handle.hash);
        if self.start_upload(&handle.hash)? {
            handle.phase = Phase::Uploading;
            Ok(ProgressState::Uploading { progress: 0.0 })
        } else {
            handle.phase = Phase::Done;
            Ok(ProgressState::Done)
        }
    }

    /// Point the module at the binary of `hash`. Returns whether the binary
    /// still has to be uploaded.
    fn start_upload(&mut self, hash: &SourceHash) -> Result<bool> {
        if self.upload_job.as_ref().is_some_and(|(h, _)| h == hash) {
            return Ok(true);
        }
        let elf_file = hash.binary_file_name();
        let current = self.module.get_string(ModuleNode::ElfFile)?;
        if current == elf_file {
            awg_log::debug!("{} is already on the device", elf_file);
            return Ok(false);
        }
        awg_log::info!("Uploading {}", elf_file);
        self.module.set(ModuleNode::ElfFile, elf_file.into())?;
        self.module.set(ModuleNode::ElfUpload, true.into())?;
        self.upload_job = Some((hash.clone(), Instant::now()));
        Ok(true)
    }

    fn owns_upload(&self, handle: &ProgressHandle) -> bool {
        self.upload_job
            .as_ref()
            .is_some_and(|(hash, _)| *hash == handle.hash)
    }

    fn poll_upload(&mut self, handle: &mut ProgressHandle) -> Result<ProgressState> {
        if !self.owns_upload(handle) {
            // Another handle of the same source finished the upload, or the
            // upload was aborted.
            let elf_file = handle.hash.binary_file_name();
            let finished = self.upload_job.is_none()
                && self.module.get_string(ModuleNode::ElfFile)? == elf_file;
            if finished {
                handle.phase = Phase::Done;
                return Ok(ProgressState::Done);
            }
            return Err(Error::Upload(format!("Upload of {elf_file} was superseded")));
        }
        let progress = self.module.get_double(ModuleNode::Progress)?;
        if self.module.get_int(ModuleNode::ElfUpload)? == 1 {
            return Ok(ProgressState::Uploading { progress });
        }
        match ElfStatus::try_from(self.module.get_int(ModuleNode::ElfStatus)?)? {
            ElfStatus::Success => {
                if let Some((hash, started)) = self.upload_job.take() {
                    awg_log::info!(
                        "Upload of {} finished after {:?}",
                        hash.binary_file_name(),
                        started.elapsed()
                    );
                }
                handle.phase = Phase::Done;
                Ok(ProgressState::Done)
            }
            ElfStatus::Failure => {
                self.upload_job = None;
                // Forget the file name so the next attempt uploads again.
                self.module.set(ModuleNode::ElfFile, NodeValue::from(""))?;
                Err(Error::Upload(format!(
                    "Device reported failure uploading {}",
                    handle.hash.binary_file_name()
                )))
            }
            ElfStatus::Busy | ElfStatus::Idle => Ok(ProgressState::Uploading { progress }),
        }
    }

    fn cancel_upload(&mut self) -> Result<()> {
        self.upload_job = None;
        self.module.set(ModuleNode::ElfUpload, false.into())?;
        self.module.set(ModuleNode::ElfFile, NodeValue::from(""))
    }
}
