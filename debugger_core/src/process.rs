//! The target process: pid discovery, job-control signals, maps and
//! address resolution
//!
//! Nothing here attaches to the target. Execution is only influenced by
//! SIGSTOP/SIGCONT fan-outs, and the pid set is rescanned from /proc on
//! every transition because the thread and process set of an app can change
//! between stops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use linux_memory_map::{get_memory_map, MemoryMap};

use crate::address::{Address, ABSOLUTE_CUTOFF};
use crate::error::{DebugError, Result};
use crate::eval::{eval, parse_int};
use crate::library::{LibraryArena, LibraryId};
use crate::registers::RegisterContext;

/// Android system locations always worth searching for a library file
const SYSTEM_SEARCH_PATHS: &[&str] = &[
    "/system/lib64",
    "/apex/com.android.art/lib64",
    "/apex/com.android.conscrypt/lib64",
    "/apex/com.android.runtime/bin",
    "/apex/com.android.runtime/lib64/bionic",
];

#[derive(Clone, Debug)]
pub struct Thread {
    pub tid: u32,
    pub name: String,
}

pub struct Process {
    pub package: String,
    work_pid: AtomicU32,
    work_tid: AtomicU32,
    maps: Mutex<HashMap<u32, MemoryMap>>,
    pub libraries: Mutex<LibraryArena>,
    /// User-assigned names for absolute addresses (the `set` command)
    pub symbols: Mutex<HashMap<u64, String>>,
}

impl Process {
    /// Locate the running package and build a process handle around it.
    /// Fails fatally when no live pid matches the package name.
    pub fn attach(package: &str) -> Result<Self> {
        let process = Self {
            package: package.to_string(),
            work_pid: AtomicU32::new(0),
            work_tid: AtomicU32::new(0),
            maps: Mutex::new(HashMap::new()),
            libraries: Mutex::new(LibraryArena::default()),
            symbols: Mutex::new(HashMap::new()),
        };

        let pids = process.update_pid_list();
        let first = *pids
            .first()
            .ok_or_else(|| DebugError::Fatal(format!("cannot locate package {}", package)))?;
        process.set_work_pid(first);
        process.refresh_maps(first)?;
        Ok(process)
    }

    pub fn work_pid(&self) -> u32 {
        self.work_pid.load(Ordering::SeqCst)
    }

    pub fn set_work_pid(&self, pid: u32) {
        self.work_pid.store(pid, Ordering::SeqCst);
    }

    pub fn work_tid(&self) -> u32 {
        self.work_tid.load(Ordering::SeqCst)
    }

    pub fn set_work_tid(&self, tid: u32) {
        self.work_tid.store(tid, Ordering::SeqCst);
    }

    /// Scan /proc for pids whose cmdline names the package. Entries that
    /// cannot be read are skipped, processes come and go while we scan.
    pub fn update_pid_list(&self) -> Vec<u32> {
        let mut pids = Vec::new();
        let entries = match std::fs::read_dir("/proc") {
            Ok(entries) => entries,
            Err(_) => return pids,
        };
        for entry in entries.flatten() {
            let pid = match entry.file_name().to_string_lossy().parse::<u32>() {
                Ok(pid) => pid,
                Err(_) => continue,
            };
            let cmdline = match std::fs::read(format!("/proc/{}/cmdline", pid)) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            let name = cmdline.split(|b| *b == 0).next().unwrap_or(&[]);
            let name = String::from_utf8_lossy(name);
            if name == self.package || name.starts_with(&format!("{}:", self.package)) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        pids
    }

    pub fn refresh_maps(&self, pid: u32) -> Result<()> {
        let map = get_memory_map(pid).ok_or(DebugError::TargetLost(pid))?;
        self.maps.lock().unwrap().insert(pid, map);
        // Load bases may have moved with the mappings
        self.libraries.lock().unwrap().invalidate_all();
        Ok(())
    }

    /// A clone of the maps of `pid`, reading them fresh if not cached
    pub fn maps_snapshot(&self, pid: u32) -> Result<MemoryMap> {
        if let Some(map) = self.maps.lock().unwrap().get(&pid) {
            return Ok(map.clone());
        }
        self.refresh_maps(pid)?;
        Ok(self.maps.lock().unwrap().get(&pid).unwrap().clone())
    }

    /// Reverse-resolve an absolute address to (library, offset) through the
    /// working pid's maps
    pub fn parse_address(&self, absolute: u64) -> Result<Address> {
        let pid = self.work_pid();
        let maps = self.maps_snapshot(pid)?;
        let entry = maps
            .entry_for_address(absolute)
            .filter(|e| !e.basename().is_empty())
            .ok_or_else(|| DebugError::Resolve(format!("no mapping contains {:#x}", absolute)))?;

        let name = entry.basename().to_string();
        let mut libraries = self.libraries.lock().unwrap();
        let id = libraries.intern(&name);
        let base = libraries.get_mut(id).base(pid, &maps)?;
        let offset = absolute
            .checked_sub(base)
            .ok_or_else(|| DebugError::Resolve(format!("{:#x} is below {}", absolute, name)))?;

        Ok(Address {
            library: Some(id),
            offset,
            absolute,
        })
    }

    /// Resolve an address to its absolute location in the working pid
    pub fn absolute_address(&self, address: &Address) -> Result<u64> {
        if address.absolute != 0 {
            return Ok(address.absolute);
        }
        let id = address
            .library
            .ok_or_else(|| DebugError::Resolve("address has no library".to_string()))?;
        let pid = self.work_pid();
        let maps = self.maps_snapshot(pid)?;
        let mut libraries = self.libraries.lock().unwrap();
        let base = libraries.get_mut(id).base(pid, &maps)?;
        Ok(base + address.offset)
    }

    /// Turn a user token into an `Address`.
    ///
    /// Tries arithmetic evaluation first; values above the absolute cutoff
    /// are reverse-resolved, everything else is an offset into the default
    /// library. Tokens that do not evaluate are split on the last `+` into
    /// `lib+offset`, with `$` standing for the current PC (offset counted in
    /// instructions).
    pub fn parse_user_address(
        &self,
        token: &str,
        default_library: LibraryId,
        ctx: &RegisterContext,
    ) -> Result<Address> {
        match eval(token, ctx) {
            Ok(value) => {
                if value >= ABSOLUTE_CUTOFF {
                    return match self.parse_address(value) {
                        Ok(address) => Ok(address),
                        Err(_) => Ok(Address::absolute_only(value)),
                    };
                }
                Ok(Address::new(default_library, value))
            }
            Err(eval_err) => {
                let (lib_name, offset_str) = match token.rsplit_once('+') {
                    Some(parts) => parts,
                    None => return Err(eval_err),
                };
                let offset = parse_int(offset_str)?;
                if lib_name == "$" {
                    return self.parse_address(ctx.pc().wrapping_add(offset.wrapping_mul(4)));
                }
                let id = self.libraries.lock().unwrap().intern(lib_name);
                Ok(Address::new(id, offset))
            }
        }
    }

    /// Like `parse_user_address` but for commands that only need a raw
    /// location (memory reads, displays)
    pub fn parse_user_address_to_absolute(
        &self,
        token: &str,
        default_library: LibraryId,
        ctx: &RegisterContext,
    ) -> Result<u64> {
        match eval(token, ctx) {
            Ok(value) => {
                if value >= ABSOLUTE_CUTOFF {
                    return Ok(value);
                }
                self.absolute_address(&Address::new(default_library, value))
            }
            Err(eval_err) => {
                let (lib_name, offset_str) = match token.rsplit_once('+') {
                    Some(parts) => parts,
                    None => return Err(eval_err),
                };
                let offset = parse_int(offset_str)?;
                if lib_name == "$" {
                    return Ok(ctx.pc().wrapping_add(offset.wrapping_mul(4)));
                }
                let id = self.libraries.lock().unwrap().intern(lib_name);
                self.absolute_address(&Address::new(id, offset))
            }
        }
    }

    /// Format an absolute address with its library attribution and any
    /// user-assigned symbol name
    pub fn format_address(&self, absolute: u64) -> String {
        if let Some(name) = self.symbols.lock().unwrap().get(&absolute) {
            return format!("{:#x}<{}>", absolute, name);
        }
        match self.parse_address(absolute) {
            Ok(address) => {
                let libraries = self.libraries.lock().unwrap();
                let name = address
                    .library
                    .map(|id| libraries.name(id).to_string())
                    .unwrap_or_default();
                format!("{:#x}<{}+{:#x}>", absolute, name, address.offset)
            }
            Err(_) => format!("{:#x}", absolute),
        }
    }

    /// SIGSTOP everything currently belonging to the package
    pub fn stop_all(&self) -> Result<()> {
        self.signal_all(libc::SIGSTOP)
    }

    /// SIGCONT everything currently belonging to the package
    pub fn continue_all(&self) -> Result<()> {
        self.signal_all(libc::SIGCONT)
    }

    fn signal_all(&self, signal: libc::c_int) -> Result<()> {
        let pids = self.update_pid_list();
        if pids.is_empty() {
            return Err(DebugError::TargetLost(self.work_pid()));
        }
        for pid in pids {
            let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
            if rc != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ESRCH) {
                    log::warn!("pid {} vanished during signal fan-out", pid);
                } else {
                    log::warn!("kill({}, {}) failed: {}", pid, signal, err);
                }
            }
        }
        Ok(())
    }

    /// The threads of the working pid, freshly read from /proc
    pub fn threads(&self) -> Result<Vec<Thread>> {
        let pid = self.work_pid();
        let mut threads = Vec::new();
        let entries = std::fs::read_dir(format!("/proc/{}/task", pid))
            .map_err(|_| DebugError::TargetLost(pid))?;
        for entry in entries.flatten() {
            let tid = match entry.file_name().to_string_lossy().parse::<u32>() {
                Ok(tid) => tid,
                Err(_) => continue,
            };
            let name = std::fs::read_to_string(format!("/proc/{}/task/{}/comm", pid, tid))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            threads.push(Thread { tid, name });
        }
        threads.sort_by_key(|t| t.tid);
        Ok(threads)
    }

    pub fn thread_name(&self, tid: u32) -> Option<String> {
        std::fs::read_to_string(format!("/proc/{}/task/{}/comm", self.work_pid(), tid))
            .map(|s| s.trim().to_string())
            .ok()
    }

    /// Directories to search when a breakpoint names a library that has no
    /// live mapping yet: system paths, the directories of everything the
    /// target already mapped, and the package's own apk/lib locations.
    pub fn library_search_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = SYSTEM_SEARCH_PATHS.iter().map(|s| s.to_string()).collect();

        for pid in self.update_pid_list() {
            if let Ok(maps) = self.maps_snapshot(pid) {
                for path in maps.library_search_paths() {
                    if !paths.contains(&path) {
                        paths.push(path);
                    }
                }
            }
        }

        for path in package_lib_paths(&self.package) {
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }

    /// Look for the on-disk file of a library by basename
    pub fn find_library_file(&self, name: &str) -> Option<PathBuf> {
        for dir in self.library_search_paths() {
            let candidate = PathBuf::from(dir).join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }
}

/// Paths derived from `pm path <package>`: the apk itself (libraries may be
/// loaded straight out of it) and its lib/arm64 sibling. A missing or
/// unparseable pm is not an error, the command simply contributes nothing.
fn package_lib_paths(package: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let output = match std::process::Command::new("pm")
        .args(["path", package])
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            log::debug!("pm path {} failed: {}", package, e);
            return paths;
        }
    };
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let apk = match line.split_once(':') {
            Some((_, path)) => path.trim(),
            None => continue,
        };
        if std::path::Path::new(apk).is_file() {
            paths.push(apk.to_string());
        }
        if let Some(dir) = std::path::Path::new(apk).parent() {
            let lib_dir = dir.join("lib/arm64");
            if lib_dir.is_dir() {
                paths.push(lib_dir.to_string_lossy().into_owned());
            }
        }
    }
    paths
}

/// The directory this debugger was started from, needed at startup
pub fn exec_dir() -> Result<PathBuf> {
    let exe = std::fs::read_link("/proc/self/exe")
        .map_err(|e| DebugError::Fatal(format!("cannot read /proc/self/exe: {}", e)))?;
    Ok(exe
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/")))
}
