//! The breakpoint table and its compilation into kernel probes
//!
//! The user-visible registry is append-only: deleting tombstones an entry so
//! ids stay stable. Each resume compiles the registry plus the one-shot
//! temporary slot into a fresh probe installation; nothing kernel-side
//! outlives a stop.

use std::sync::atomic::{AtomicBool, Ordering};

use uprobe::{attach_hw_breakpoint, attach_uprobe, HwBreakpointKind, ProbeScope, ProbeSet};

use crate::address::Address;
use crate::error::{DebugError, Result};
use crate::library::{LibraryArena, LibraryId};
use crate::memory;
use crate::predictor;
use crate::process::Process;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BreakpointKind {
    /// Realised as a uprobe on the library file
    Uprobe,
    /// Realised as a per-thread debug-register event
    Hardware(HwBreakpointKind),
}

#[derive(Clone, Debug)]
pub struct Breakpoint {
    pub library: Option<LibraryId>,
    /// Code offset within the library, or the absolute address for entries
    /// without library attribution
    pub offset: u64,
    pub enable: bool,
    pub deleted: bool,
    pub kind: BreakpointKind,
}

impl Breakpoint {
    fn identity(&self) -> (Option<LibraryId>, u64) {
        (self.library, self.offset)
    }
}

/// One-shot breakpoint armed by step/next/finish/until, consumed by the next
/// install
#[derive(Clone, Debug)]
pub struct TemporaryBreakpoint {
    pub address: Address,
    pub tid: u32,
}

/// An entry of the compiled installation snapshot
#[derive(Clone, Debug)]
pub struct InstallEntry {
    pub library: Option<LibraryId>,
    pub offset: u64,
    pub kind: BreakpointKind,
    pub temporary: bool,
    pub label: String,
}

/// What `install` hands to the coordinator
pub struct Installation {
    pub set: ProbeSet,
    pub temp_tid: u32,
    pub has_temporary: bool,
}

pub struct BreakpointManager {
    pub enable_hw: bool,
    breakpoints: Vec<Breakpoint>,
    /// At most one step request is pending; a data-dependent branch arms two
    /// addresses under the same slot
    temporaries: Vec<TemporaryBreakpoint>,
    temp_tid: u32,
}

impl BreakpointManager {
    pub fn new(enable_hw: bool) -> Self {
        Self {
            enable_hw,
            breakpoints: Vec::new(),
            temporaries: Vec::new(),
            temp_tid: 0,
        }
    }

    /// Add a persistent breakpoint, or update the enable state of an
    /// existing one with the same identity. Returns the entry id.
    pub fn add(&mut self, address: &Address, enable: bool, kind: BreakpointKind) -> Result<usize> {
        if !address.is_aligned() {
            return Err(DebugError::Parse(format!(
                "misaligned offset {:#x}",
                address.offset
            )));
        }
        let identity = (address.library, address.offset);
        if let Some(id) = self
            .breakpoints
            .iter()
            .position(|b| !b.deleted && b.identity() == identity)
        {
            self.breakpoints[id].enable = enable;
            return Ok(id);
        }
        self.breakpoints.push(Breakpoint {
            library: address.library,
            offset: address.offset,
            enable,
            deleted: false,
            kind,
        });
        Ok(self.breakpoints.len() - 1)
    }

    /// Replace the temporary slot with a single one-shot breakpoint
    pub fn set_temporary(&mut self, address: Address, tid: u32) -> Result<()> {
        self.temporaries.clear();
        self.push_temporary(address, tid)
    }

    /// Add a second address to the pending one-shot slot (the data-dependent
    /// branch pair)
    pub fn push_temporary(&mut self, address: Address, tid: u32) -> Result<()> {
        if !address.is_aligned() {
            return Err(DebugError::Parse(format!(
                "misaligned offset {:#x}",
                address.offset
            )));
        }
        // A live enabled breakpoint at the same spot already stops us there
        if self.breakpoints.iter().any(|b| {
            !b.deleted && b.enable && b.identity() == (address.library, address.offset)
        }) {
            return Ok(());
        }
        self.temp_tid = tid;
        self.temporaries.push(TemporaryBreakpoint { address, tid });
        Ok(())
    }

    pub fn clear_temporaries(&mut self) {
        self.temporaries.clear();
        self.temp_tid = 0;
    }

    pub fn has_temporary(&self) -> bool {
        !self.temporaries.is_empty()
    }

    /// Toggle a breakpoint by id
    pub fn change(&mut self, id: usize, enable: bool) -> Result<()> {
        match self.breakpoints.get_mut(id) {
            Some(b) if !b.deleted => {
                b.enable = enable;
                Ok(())
            }
            _ => Err(DebugError::Parse(format!("breakpoint {} doesn't exist", id))),
        }
    }

    /// Tombstone a breakpoint by id; ids of the remaining entries are stable
    pub fn delete(&mut self, id: usize) -> Result<()> {
        match self.breakpoints.get_mut(id) {
            Some(b) if !b.deleted => {
                b.enable = false;
                b.deleted = true;
                Ok(())
            }
            _ => Err(DebugError::Parse(format!("breakpoint {} doesn't exist", id))),
        }
    }

    /// Live (non-deleted) entries with their stable ids, for display
    pub fn list(&self) -> impl Iterator<Item = (usize, &Breakpoint)> {
        self.breakpoints
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.deleted)
    }

    /// The set to install on the next resume: every enabled persistent
    /// breakpoint plus the temporary slot, deduplicated by identity
    pub fn snapshot_for_install(&self, libraries: &LibraryArena) -> Vec<InstallEntry> {
        let mut entries: Vec<InstallEntry> = Vec::new();
        let mut seen: Vec<(Option<LibraryId>, u64)> = Vec::new();

        for breakpoint in self.breakpoints.iter().filter(|b| !b.deleted && b.enable) {
            let identity = breakpoint.identity();
            if seen.contains(&identity) {
                continue;
            }
            seen.push(identity);
            entries.push(InstallEntry {
                library: breakpoint.library,
                offset: breakpoint.offset,
                kind: breakpoint.kind,
                temporary: false,
                label: label(libraries, breakpoint.library, breakpoint.offset),
            });
        }

        for temp in &self.temporaries {
            let identity = (temp.address.library, temp.address.offset);
            if seen.contains(&identity) {
                continue;
            }
            seen.push(identity);
            entries.push(InstallEntry {
                library: temp.address.library,
                offset: temp.address.offset,
                kind: BreakpointKind::Uprobe,
                temporary: true,
                label: label(libraries, temp.address.library, temp.address.offset),
            });
        }

        entries
    }

    /// Compile the registry into a live probe installation.
    ///
    /// Either every attachment succeeds, or all partial state is dropped and
    /// the error names the first failing breakpoint. The temporary slot is
    /// consumed on success and must be cleared by the caller on failure.
    pub fn install(&mut self, process: &Process, cancel: &AtomicBool) -> Result<Installation> {
        let entries = {
            let libraries = process.libraries.lock().unwrap();
            self.snapshot_for_install(&libraries)
        };

        let threads = process.threads()?;
        let mut set = ProbeSet::new();

        for entry in &entries {
            if cancel.load(Ordering::SeqCst) {
                return Err(DebugError::Install {
                    breakpoint: entry.label.clone(),
                    reason: "cancelled".to_string(),
                });
            }
            self.attach_entry(process, &threads, entry, &mut set)?;
        }

        set.enable_all().map_err(|e| DebugError::Install {
            breakpoint: "probe set".to_string(),
            reason: e.to_string(),
        })?;

        let installation = Installation {
            set,
            temp_tid: self.temp_tid,
            has_temporary: !self.temporaries.is_empty(),
        };
        self.clear_temporaries();
        Ok(installation)
    }

    fn attach_entry(
        &self,
        process: &Process,
        threads: &[crate::process::Thread],
        entry: &InstallEntry,
        set: &mut ProbeSet,
    ) -> Result<()> {
        let absolute = self.resolve_absolute(process, entry)?;

        match entry.kind {
            BreakpointKind::Hardware(kind) => {
                attach_hw_entry(threads, absolute, kind, entry, set)
            }
            BreakpointKind::Uprobe => {
                // Stepping breakpoints may ride the debug registers instead,
                // unless the target instruction needs the uprobe register
                // snapshot to predict past it
                if entry.temporary && self.enable_hw {
                    let insn = memory::read_instruction(process.work_pid(), absolute)?;
                    if !predictor::hw_unsafe(insn) {
                        match attach_hw_entry(
                            threads,
                            absolute,
                            HwBreakpointKind::Execute,
                            entry,
                            set,
                        ) {
                            Ok(()) => return Ok(()),
                            Err(e) => {
                                log::warn!(
                                    "hw breakpoint at {} unavailable ({}), using uprobe",
                                    entry.label,
                                    e
                                );
                            }
                        }
                    }
                }
                self.attach_uprobe_entry(process, entry, absolute, set)
            }
        }
    }

    fn resolve_absolute(&self, process: &Process, entry: &InstallEntry) -> Result<u64> {
        let address = match entry.library {
            Some(id) => Address::new(id, entry.offset),
            None => Address::absolute_only(entry.offset),
        };
        match self.temporaries.iter().find(|t| {
            t.address.library == entry.library && t.address.offset == entry.offset
        }) {
            Some(temp) if temp.address.absolute != 0 => Ok(temp.address.absolute),
            _ => process.absolute_address(&address),
        }
    }

    fn attach_uprobe_entry(
        &self,
        process: &Process,
        entry: &InstallEntry,
        absolute: u64,
        set: &mut ProbeSet,
    ) -> Result<()> {
        let id = entry.library.ok_or_else(|| DebugError::Install {
            breakpoint: entry.label.clone(),
            reason: "uprobes need a library-relative address".to_string(),
        })?;

        let path = {
            let libraries = process.libraries.lock().unwrap();
            libraries.get(id).path.clone()
        };
        let path = match path {
            Some(path) => path,
            None => {
                let name = process.libraries.lock().unwrap().name(id).to_string();
                process
                    .find_library_file(&name)
                    .ok_or_else(|| DebugError::Resolve(format!("no file found for {}", name)))?
            }
        };

        for cpu in online_cpus() {
            let event = attach_uprobe(&path, entry.offset, ProbeScope::Cpu(cpu), absolute)
                .map_err(|e| DebugError::Install {
                    breakpoint: entry.label.clone(),
                    reason: e.to_string(),
                })?;
            set.push(event);
        }
        Ok(())
    }
}

fn attach_hw_entry(
    threads: &[crate::process::Thread],
    absolute: u64,
    kind: HwBreakpointKind,
    entry: &InstallEntry,
    set: &mut ProbeSet,
) -> Result<()> {
    // Collect first: a failure part-way through must not leave events for
    // some threads behind in the installation
    let mut events = Vec::with_capacity(threads.len());
    for thread in threads {
        let event =
            attach_hw_breakpoint(thread.tid, absolute, kind, 4, absolute).map_err(|e| {
                DebugError::Install {
                    breakpoint: entry.label.clone(),
                    reason: e.to_string(),
                }
            })?;
        events.push(event);
    }
    for event in events {
        set.push(event);
    }
    Ok(())
}

fn online_cpus() -> Vec<i32> {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    (0..n.max(1) as i32).collect()
}

fn label(libraries: &LibraryArena, library: Option<LibraryId>, offset: u64) -> String {
    match library {
        Some(id) => format!("{}+{:#x}", libraries.name(id), offset),
        None => format!("{:#x}", offset),
    }
}

#[cfg(test)]
mod tests;
