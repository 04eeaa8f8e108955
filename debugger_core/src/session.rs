//! The execution coordinator: STOP -> install -> CONT -> event -> STOP
//!
//! Three long-lived workers cooperate over single-slot channels:
//! the command thread (owned by the caller) resumes the target, the event
//! reader blocks on the probe rings, and the cleanup worker tears
//! installations down so a ctrl-c during a long install cannot deadlock.
//! Publishers never block: a signal posted while one is pending coalesces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use uprobe::{ProbeEvent, ProbeSet};

use crate::breakpoints::BreakpointManager;
use crate::error::{DebugError, Result};
use crate::process::Process;
use crate::registers::RegisterContext;

/// User-supplied predicate suppressing events from non-matching threads.
/// Either a tid or a thread name; the probe still fires, filtering is
/// post-facto.
#[derive(Clone, Debug)]
pub struct ThreadFilter {
    pub tid: u32,
    pub name: String,
    pub enable: bool,
}

/// Published to the command side whenever the target stops at a probe
#[derive(Clone, Debug)]
pub struct StopInfo {
    pub pid: u32,
    pub tid: u32,
    pub key: u64,
    pub context: RegisterContext,
}

/// Everything the event reader needs for one RUNNING period, captured at
/// install time so the reader never touches mutable command-side state
struct Running {
    set: ProbeSet,
    filters: Vec<ThreadFilter>,
    temp_tid: u32,
    has_temporary: bool,
    pids: Vec<u32>,
}

pub struct Session {
    pub process: Arc<Process>,
    pub manager: Mutex<BreakpointManager>,
    pub filters: Mutex<Vec<ThreadFilter>>,
    /// Registers of the thread that hit the last stop
    pub context: Mutex<RegisterContext>,
    working: Arc<AtomicBool>,
    teardown: Arc<AtomicBool>,
    install_tx: Sender<Running>,
    incoming_rx: Receiver<StopInfo>,
    do_clean_tx: Sender<()>,
    done_rx: Receiver<()>,
}

impl Session {
    pub fn new(process: Arc<Process>, enable_hw: bool) -> Arc<Self> {
        let (install_tx, install_rx) = bounded::<Running>(1);
        let (incoming_tx, incoming_rx) = bounded::<StopInfo>(1);
        let (do_clean_tx, do_clean_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);

        let working = Arc::new(AtomicBool::new(false));
        let teardown = Arc::new(AtomicBool::new(false));

        let session = Arc::new(Self {
            process: Arc::clone(&process),
            manager: Mutex::new(BreakpointManager::new(enable_hw)),
            filters: Mutex::new(Vec::new()),
            context: Mutex::new(RegisterContext::default()),
            working: Arc::clone(&working),
            teardown: Arc::clone(&teardown),
            install_tx,
            incoming_rx,
            do_clean_tx,
            done_rx: done_rx.clone(),
        });

        {
            let session = Arc::clone(&session);
            std::thread::Builder::new()
                .name("event-reader".to_string())
                .spawn(move || session.event_loop(install_rx, incoming_tx, done_tx))
                .expect("failed to spawn event reader");
        }
        {
            let session = Arc::clone(&session);
            std::thread::Builder::new()
                .name("cleanup".to_string())
                .spawn(move || session.cleanup_loop(do_clean_rx, done_rx))
                .expect("failed to spawn cleanup worker");
        }

        session
    }

    pub fn working(&self) -> bool {
        self.working.load(Ordering::SeqCst)
    }

    /// Stops published by the coordinator, consumed by the display side
    pub fn incoming(&self) -> &Receiver<StopInfo> {
        &self.incoming_rx
    }

    /// Snapshot the registry, install the probe set, and let the target run.
    /// On install failure the target stays stopped and the temporary slot is
    /// cleared.
    pub fn resume(&self) -> Result<()> {
        if self.working() {
            return Err(DebugError::State(
                "target is already running, wait for a stop".to_string(),
            ));
        }

        let running = {
            let mut manager = self.manager.lock().unwrap();
            match manager.install(&self.process, &self.teardown) {
                Ok(installation) => Running {
                    set: installation.set,
                    filters: self.filters.lock().unwrap().clone(),
                    temp_tid: installation.temp_tid,
                    has_temporary: installation.has_temporary,
                    pids: self.process.update_pid_list(),
                },
                Err(e) => {
                    manager.clear_temporaries();
                    return Err(e);
                }
            }
        };

        // Mark RUNNING before the reader can see the installation; the first
        // event may arrive before continue_all returns and must win the flag
        self.working.store(true, Ordering::SeqCst);
        if self.install_tx.send(running).is_err() {
            self.working.store(false, Ordering::SeqCst);
            return Err(DebugError::State("event reader is gone".to_string()));
        }

        if let Err(e) = self.process.continue_all() {
            self.teardown.store(true, Ordering::SeqCst);
            self.working.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Request an asynchronous teardown (the ctrl-c path). The cleanup
    /// worker finishes the job and exits the process.
    pub fn request_cleanup(&self) {
        let _ = self.do_clean_tx.try_send(());
    }

    /// Synchronous teardown for `quit`: detach everything and leave the
    /// target running. Never leaves the target stopped.
    pub fn shutdown(&self) {
        if self.working() {
            self.teardown.store(true, Ordering::SeqCst);
            let _ = self.done_rx.recv_timeout(Duration::from_secs(2));
        }
        let _ = self.process.continue_all();
    }

    fn event_loop(
        &self,
        install_rx: Receiver<Running>,
        incoming_tx: Sender<StopInfo>,
        done_tx: Sender<()>,
    ) {
        while let Ok(mut running) = install_rx.recv() {
            let stop = loop {
                if self.teardown.swap(false, Ordering::SeqCst) {
                    break None;
                }
                let events = match running.set.poll(200) {
                    Ok(events) => events,
                    Err(e) => {
                        log::warn!("probe poll failed: {}", e);
                        continue;
                    }
                };
                if let Some(event) = events.into_iter().find(|e| self.matches(&running, e)) {
                    break Some(event);
                }
            };

            match stop {
                Some(event) => {
                    // SIGSTOP first so nothing runs past the probe while we
                    // detach; events still in the ring after this are stale
                    if let Err(e) = self.process.stop_all() {
                        log::warn!("stop fan-out failed: {}", e);
                    }
                    running.set.disable_all();
                    let discarded = running.set.drain().len();
                    if discarded > 0 {
                        log::debug!("discarded {} stale probe events", discarded);
                    }
                    running.set.detach_all();

                    self.publish_stop(&incoming_tx, event);
                }
                None => {
                    running.set.disable_all();
                    running.set.drain();
                    running.set.detach_all();
                    self.working.store(false, Ordering::SeqCst);
                    let _ = done_tx.try_send(());
                }
            }
        }
    }

    fn publish_stop(&self, incoming_tx: &Sender<StopInfo>, event: ProbeEvent) {
        let context = RegisterContext {
            regs: event.regs,
            tid: event.tid,
            regs_valid: event.regs_valid,
            // perf samples never carry PSTATE, conditional branches take the
            // two-breakpoint path
            pstate_valid: false,
        };

        self.process.set_work_pid(event.pid);
        self.process.set_work_tid(event.tid);
        if let Err(e) = self.process.refresh_maps(event.pid) {
            log::warn!("maps refresh failed: {}", e);
        }
        *self.context.lock().unwrap() = context.clone();

        self.working.store(false, Ordering::SeqCst);
        let _ = incoming_tx.try_send(StopInfo {
            pid: event.pid,
            tid: event.tid,
            key: event.key,
            context,
        });
    }

    /// Post-facto event filtering: package pids, user thread filters, and
    /// the temporary breakpoint's thread binding
    fn matches(&self, running: &Running, event: &ProbeEvent) -> bool {
        if !running.pids.contains(&event.pid) {
            // The pid set can change while running, rescan before discarding
            if !self.process.update_pid_list().contains(&event.pid) {
                return false;
            }
        }

        let name = self.process.thread_name(event.tid).unwrap_or_default();
        if !filters_allow(&running.filters, event.tid, &name) {
            return false;
        }

        temporary_allows(running.has_temporary, running.temp_tid, event.tid)
    }

    fn cleanup_loop(&self, do_clean_rx: Receiver<()>, done_rx: Receiver<()>) {
        while do_clean_rx.recv().is_ok() {
            if self.working() {
                self.teardown.store(true, Ordering::SeqCst);
                let _ = done_rx.recv_timeout(Duration::from_secs(2));
            }
            // Whatever happened, do not leave the target frozen
            let _ = self.process.continue_all();
            log::info!("detached, exiting");
            std::process::exit(0);
        }
    }
}

/// When any filter is enabled, only events from a matching thread pass
fn filters_allow(filters: &[ThreadFilter], tid: u32, name: &str) -> bool {
    if !filters.iter().any(|f| f.enable) {
        return true;
    }
    filters
        .iter()
        .filter(|f| f.enable)
        .any(|f| (f.tid != 0 && f.tid == tid) || (!f.name.is_empty() && f.name == name))
}

/// A live temporary breakpoint with a thread binding suppresses events from
/// every other thread
fn temporary_allows(has_temporary: bool, temp_tid: u32, tid: u32) -> bool {
    !(has_temporary && temp_tid != 0 && tid != temp_tid)
}

#[cfg(test)]
mod tests {
    use super::{filters_allow, temporary_allows, ThreadFilter};

    fn tid_filter(tid: u32) -> ThreadFilter {
        ThreadFilter {
            tid,
            name: String::new(),
            enable: true,
        }
    }

    fn name_filter(name: &str) -> ThreadFilter {
        ThreadFilter {
            tid: 0,
            name: name.to_string(),
            enable: true,
        }
    }

    #[test]
    pub fn when_no_filters_then_every_thread_passes() {
        assert!(filters_allow(&[], 1234, "worker"));
    }

    #[test]
    pub fn when_tid_filter_enabled_then_only_that_thread_passes() {
        let filters = vec![tid_filter(1234)];
        assert!(filters_allow(&filters, 1234, "worker"));
        assert!(!filters_allow(&filters, 1235, "worker"));
    }

    #[test]
    pub fn when_name_filter_enabled_then_name_decides() {
        let filters = vec![name_filter("RenderThread")];
        assert!(filters_allow(&filters, 1, "RenderThread"));
        assert!(!filters_allow(&filters, 1, "Binder:1"));
    }

    #[test]
    pub fn when_filter_is_disabled_then_it_is_ignored() {
        let mut filter = tid_filter(1234);
        filter.enable = false;
        assert!(filters_allow(&[filter], 9999, "anything"));
    }

    #[test]
    pub fn when_several_filters_then_any_match_passes() {
        let filters = vec![tid_filter(10), name_filter("main")];
        assert!(filters_allow(&filters, 10, "other"));
        assert!(filters_allow(&filters, 11, "main"));
        assert!(!filters_allow(&filters, 11, "other"));
    }

    #[test]
    pub fn when_temporary_has_thread_binding_then_other_threads_are_ignored() {
        assert!(temporary_allows(true, 55, 55));
        assert!(!temporary_allows(true, 55, 56));
        // No binding, or no temporary at all: everything passes
        assert!(temporary_allows(true, 0, 56));
        assert!(temporary_allows(false, 55, 56));
    }
}
