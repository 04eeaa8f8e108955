use crate::MemoryMapEntryPermissionsKind;
use std::error::Error;

#[test]
pub fn when_parse_memory_map_then_result_is_success() -> Result<(), Box<dyn Error>> {
    let sample = "aaaad9d30000-aaaad9d31000 r-xp 00000000 fc:02 7219570                    /data/local/tmp/a.out\n
aaab0ad73000-aaab0ad94000 rw-p 00000000 00:00 0                          [heap]\n
ffff85665000-ffff857c0000 r-xp 00040000 fc:02 262780                     /apex/com.android.runtime/lib64/bionic/libc.so\n
ffff857d5000-ffff857d8000 rw-p 00000000 00:00 0\n
ffff85818000-ffff85819000 r-xp 00000000 00:00 0                          [vdso]\n
ffffdbd5f000-ffffdbd80000 rw-p 00000000 00:00 0                          [stack]\n";

    let maps = crate::parse_memory_map(sample);
    assert_eq!(maps.is_some(), true);
    let maps = maps.unwrap();
    assert_eq!(maps.0.len(), 6);

    let m1 = maps.0.first().unwrap();
    assert_eq!(m1.path, "/data/local/tmp/a.out");
    assert_eq!(m1.basename(), "a.out");
    assert_eq!(m1.permissions.read, true);
    assert_eq!(m1.permissions.write, false);
    assert_eq!(m1.permissions.execute, true);
    assert_eq!(m1.permissions.kind, MemoryMapEntryPermissionsKind::Private);
    assert_eq!(m1.range.start, 0xaaaad9d30000);
    assert_eq!(m1.range.end, 0xaaaad9d31000);
    assert_eq!(m1.offset, 0);
    assert_eq!(m1.dev, "fc:02");
    assert_eq!(m1.inode, "7219570");

    let libc = &maps.0[2];
    assert_eq!(libc.basename(), "libc.so");
    assert_eq!(libc.offset, 0x40000);

    Ok(())
}

#[test]
pub fn when_parse_invalid_memory_map_then_result_is_none() -> Result<(), Box<dyn Error>> {
    let sample = "ZZZZZZZZZZZZ-aaaad9d31000 r-xp 00000000 fc:02 7219570                    /data/local/tmp/a.out\n";

    let maps = crate::parse_memory_map(sample);
    assert_eq!(maps.is_none(), true);

    Ok(())
}

#[test]
pub fn when_lookup_address_then_containing_entry_is_found() {
    let sample = "aaaad9d30000-aaaad9d31000 r-xp 00000000 fc:02 1 /data/local/tmp/a.out\n";
    let maps = crate::parse_memory_map(sample).unwrap();

    assert!(maps.entry_for_address(0xaaaad9d30800).is_some());
    assert!(maps.entry_for_address(0xaaaad9d31000).is_none());
    assert!(maps.entry_for_address(0).is_none());
}

#[test]
pub fn when_lookup_executable_entries_by_name_then_only_matching_returned() {
    let sample = "7000000000-7000001000 r-xp 00000000 fc:02 1 /system/lib64/libfoo.so\n
7000001000-7000002000 r--p 00001000 fc:02 1 /system/lib64/libfoo.so\n
7000002000-7000003000 r-xp 00000000 fc:02 2 /system/lib64/libbar.so\n";
    let maps = crate::parse_memory_map(sample).unwrap();

    let found: Vec<_> = maps.executable_entries_named("libfoo.so").collect();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].range.start, 0x7000000000);
}

#[test]
pub fn when_collect_search_paths_then_directories_are_deduplicated() {
    let sample = "7000000000-7000001000 r-xp 00000000 fc:02 1 /system/lib64/libfoo.so\n
7000002000-7000003000 r-xp 00000000 fc:02 2 /system/lib64/libbar.so\n
7000004000-7000005000 rw-p 00000000 00:00 0 [anon:libc_malloc]\n";
    let maps = crate::parse_memory_map(sample).unwrap();

    assert_eq!(maps.library_search_paths(), vec!["/system/lib64".to_string()]);
}
