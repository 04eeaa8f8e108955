//! Shared libraries of the target, interned in a process-owned arena
//!
//! Both breakpoints and addresses refer to a library by index into the
//! arena rather than by pointer, so the process, the breakpoint table and
//! the address values can all name the same library without ownership
//! cycles.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use linux_memory_map::MemoryMap;

use crate::error::{DebugError, Result};

/// Index of a library in the process arena
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LibraryId(pub usize);

#[derive(Clone, Debug)]
pub struct Library {
    /// Basename the user refers to the library by, e.g. `libfoo.so`
    pub name: String,
    /// On-disk path, filled in once a live mapping or a search path hit
    /// reveals it
    pub path: Option<PathBuf>,
    /// Cached load base per pid, invalidated whenever the maps are refreshed
    bases: HashMap<u32, u64>,
}

impl Library {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            bases: HashMap::new(),
        }
    }

    pub fn invalidate(&mut self) {
        self.bases.clear();
    }

    /// The load base of this library in `pid`: the lowest start address of
    /// its executable mappings, minus the page-aligned file offset the first
    /// executable ELF segment is loaded from.
    pub fn base(&mut self, pid: u32, maps: &MemoryMap) -> Result<u64> {
        if let Some(base) = self.bases.get(&pid) {
            return Ok(*base);
        }

        let entry = maps
            .executable_entries_named(&self.name)
            .min_by_key(|e| e.range.start)
            .ok_or_else(|| DebugError::Resolve(format!("{} is not mapped", self.name)))?;

        if self.path.is_none() && entry.path.starts_with('/') {
            self.path = Some(PathBuf::from(&entry.path));
        }

        let segment_offset = self
            .path
            .as_ref()
            .and_then(|p| first_exec_segment_offset(p))
            .unwrap_or(entry.offset);

        let base = entry.range.start.checked_sub(segment_offset).ok_or_else(|| {
            DebugError::Resolve(format!("bad segment offset {:#x} for {}", segment_offset, self.name))
        })?;
        self.bases.insert(pid, base);
        Ok(base)
    }
}

/// The page-aligned file offset of the first executable PT_LOAD segment
fn first_exec_segment_offset(path: &Path) -> Option<u64> {
    let bytes = std::fs::read(path).ok()?;
    let elf = goblin::elf::Elf::parse(&bytes).ok()?;
    use goblin::elf::program_header::{PF_X, PT_LOAD};
    elf.program_headers
        .iter()
        .find(|ph| ph.p_type == PT_LOAD && ph.p_flags & PF_X != 0)
        .map(|ph| ph.p_offset & !0xfff)
}

#[derive(Default, Debug)]
pub struct LibraryArena {
    libraries: Vec<Library>,
    by_name: HashMap<String, usize>,
}

impl LibraryArena {
    /// Get or create the library with the given basename
    pub fn intern(&mut self, name: &str) -> LibraryId {
        if let Some(&idx) = self.by_name.get(name) {
            return LibraryId(idx);
        }
        let idx = self.libraries.len();
        self.libraries.push(Library::new(name));
        self.by_name.insert(name.to_string(), idx);
        LibraryId(idx)
    }

    pub fn get(&self, id: LibraryId) -> &Library {
        &self.libraries[id.0]
    }

    pub fn get_mut(&mut self, id: LibraryId) -> &mut Library {
        &mut self.libraries[id.0]
    }

    pub fn name(&self, id: LibraryId) -> &str {
        &self.libraries[id.0].name
    }

    pub fn invalidate_all(&mut self) {
        for lib in &mut self.libraries {
            lib.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LibraryArena;
    use linux_memory_map::parse_memory_map;

    #[test]
    pub fn when_intern_same_name_then_same_id() {
        let mut arena = LibraryArena::default();
        let a = arena.intern("libfoo.so");
        let b = arena.intern("libfoo.so");
        let c = arena.intern("libbar.so");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(arena.name(a), "libfoo.so");
    }

    #[test]
    pub fn when_resolve_base_then_lowest_exec_mapping_minus_offset() {
        let sample = "7000002000-7000003000 r-xp 00002000 fc:02 1 /fake/libfoo.so\n
7000005000-7000006000 r-xp 00005000 fc:02 1 /fake/libfoo.so\n";
        let maps = parse_memory_map(sample).unwrap();

        let mut arena = LibraryArena::default();
        let id = arena.intern("libfoo.so");
        // /fake/libfoo.so does not exist on disk, so the mapping's own file
        // offset stands in for the segment offset
        let base = arena.get_mut(id).base(1234, &maps).unwrap();
        assert_eq!(base, 0x7000000000);
    }

    #[test]
    pub fn when_resolve_unmapped_library_then_resolve_error() {
        let maps = parse_memory_map("").unwrap();
        let mut arena = LibraryArena::default();
        let id = arena.intern("libmissing.so");
        assert!(arena.get_mut(id).base(1, &maps).is_err());
    }
}
