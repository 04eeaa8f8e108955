use std::ops::Range;
use std::path::Path;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone)]
pub struct MemoryMap(pub Vec<MemoryMapEntry>);

/// The kind of a given memory map entry
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryMapEntryPermissionsKind {
    Private,
    Shared,
}

impl core::fmt::Display for MemoryMapEntryPermissionsKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::Shared => write!(f, "shared"),
        }
    }
}

/// The permissions for a given memory map section
#[derive(Copy, Clone, Debug)]
pub struct MemoryMapEntryPermissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub kind: MemoryMapEntryPermissionsKind,
}

/// A single entry in the memory map
#[derive(Clone, Debug)]
pub struct MemoryMapEntry {
    pub range: Range<u64>,
    pub permissions: MemoryMapEntryPermissions,
    /// File offset of the start of this mapping, parsed from the third column
    pub offset: u64,
    pub dev: String,
    pub inode: String,
    pub path: String,
}

impl MemoryMapEntry {
    /// The basename of the mapped file, empty for anonymous mappings
    pub fn basename(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("")
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.range.start <= addr && addr < self.range.end
    }
}

impl MemoryMap {
    /// Find the mapping containing the given address
    pub fn entry_for_address(&self, addr: u64) -> Option<&MemoryMapEntry> {
        self.0.iter().find(|e| e.contains(addr))
    }

    /// All executable mappings whose file basename matches `name`
    pub fn executable_entries_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a MemoryMapEntry> {
        self.0
            .iter()
            .filter(move |e| e.permissions.execute && e.basename() == name)
    }

    /// The directories of every executable file-backed mapping, deduplicated
    pub fn library_search_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for entry in &self.0 {
            if !entry.permissions.execute || !entry.path.starts_with('/') {
                continue;
            }
            if let Some(dir) = Path::new(&entry.path).parent().and_then(|p| p.to_str()) {
                if !paths.iter().any(|p| p == dir) {
                    paths.push(dir.to_string());
                }
            }
        }
        paths
    }
}

/// Get the memory map from /proc/<pid>/maps and parse it
/// Will return none if parsing failed or the file couldn't be opened (generally because the
/// process no longer exists)
pub fn get_memory_map(pid: u32) -> Option<MemoryMap> {
    let content = std::fs::read_to_string(format!("/proc/{}/maps", pid)).ok()?;
    parse_memory_map(&content)
}

/// Parse the content of a maps file
pub fn parse_memory_map(content: &str) -> Option<MemoryMap> {
    let mut map = Vec::new();
    for line in content.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split_ascii_whitespace();
        let addr_range = parts.next()?;
        let mut addr_range_parts = addr_range.split('-');
        let addr_range_start = u64::from_str_radix(addr_range_parts.next()?, 16).ok()?;
        let addr_range_end = u64::from_str_radix(addr_range_parts.next()?, 16).ok()?;

        let perms = parts.next()?;
        let offset = u64::from_str_radix(parts.next()?, 16).ok()?;
        let dev = parts.next()?;
        let inode = parts.next()?;
        // The path column may contain spaces, or be absent for anonymous mappings
        let pathname = match (line.find('/'), line.find('[')) {
            (Some(pos), _) => line[pos..].trim(),
            (None, Some(pos)) => line[pos..].trim(),
            (None, None) => "",
        };

        map.push(MemoryMapEntry {
            range: addr_range_start..addr_range_end,
            permissions: MemoryMapEntryPermissions {
                read: perms.contains('r'),
                write: perms.contains('w'),
                execute: perms.contains('x'),
                kind: if perms.contains('s') {
                    MemoryMapEntryPermissionsKind::Shared
                } else {
                    MemoryMapEntryPermissionsKind::Private
                },
            },
            offset,
            dev: dev.to_string(),
            inode: inode.to_string(),
            path: pathname.to_string(),
        })
    }

    Some(MemoryMap(map))
}
