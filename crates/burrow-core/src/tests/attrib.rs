use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use burrow_types::Digest;

use crate::attrib::{
    attrib_file_name, attrib_files, current_attrib, encode_container, AttribStore,
    AttributeRecord, Container, FileType,
};
use crate::compress::CompressMode;
use crate::layout::Layout;
use crate::refcnt::RefCountDelta;

fn store_with_sink(dir: &Path) -> (AttribStore, Rc<RefCell<RefCountDelta>>) {
    let layout = Layout::new(dir.parent().unwrap());
    let mut ac = AttribStore::new(dir, CompressMode::None, layout);
    let drc = Rc::new(RefCell::new(RefCountDelta::new(dir)));
    ac.set_delta_sink(Rc::clone(&drc));
    (ac, drc)
}

fn file_rec(name: &str, content: &[u8]) -> AttributeRecord {
    AttributeRecord {
        name: name.to_string(),
        ftype: FileType::File,
        mode: 0o644,
        uid: 0,
        gid: 0,
        size: content.len() as u64,
        mtime: 0,
        digest: Some(Digest::of(content)),
        compress: CompressMode::None,
        inode: 0,
        nlinks: 0,
        no_attrib: false,
    }
}

#[test]
fn first_flush_creates_container_and_emits_plus_one() {
    let tmp = tempfile::tempdir().unwrap();
    let backup = tmp.path().join("1");
    std::fs::create_dir_all(&backup).unwrap();
    let (mut ac, drc) = store_with_sink(&backup);

    ac.set(Path::new("fdir"), file_rec("a", b"alpha")).unwrap();
    ac.flush(false).unwrap();

    let files = attrib_files(&backup.join("fdir")).unwrap();
    assert_eq!(files.len(), 1);
    let (name, digest) = &files[0];

    // The file name's embedded digest matches the digest of its bytes.
    let bytes = std::fs::read(backup.join("fdir").join(name)).unwrap();
    assert_eq!(Digest::of(&bytes), *digest);
    assert_eq!(drc.borrow().pending(CompressMode::None, digest), 1);
}

#[test]
fn rewrite_swaps_digests_and_unlinks_old() {
    let tmp = tempfile::tempdir().unwrap();
    let backup = tmp.path().join("1");
    std::fs::create_dir_all(&backup).unwrap();
    let (mut ac, drc) = store_with_sink(&backup);

    ac.set(Path::new("fdir"), file_rec("a", b"alpha")).unwrap();
    ac.flush(false).unwrap();
    let (_, d_old) = attrib_files(&backup.join("fdir")).unwrap()[0];

    ac.set(Path::new("fdir"), file_rec("b", b"beta")).unwrap();
    ac.flush(false).unwrap();

    let files = attrib_files(&backup.join("fdir")).unwrap();
    assert_eq!(files.len(), 1, "old container must be unlinked");
    let (_, d_new) = files[0];
    assert_ne!(d_old, d_new);
    assert_eq!(drc.borrow().pending(CompressMode::None, &d_old), 0); // +1 then -1
    assert_eq!(drc.borrow().pending(CompressMode::None, &d_new), 1);
}

#[test]
fn identical_content_flush_is_a_no_op() {
    let tmp = tempfile::tempdir().unwrap();
    let backup = tmp.path().join("1");
    std::fs::create_dir_all(&backup).unwrap();
    let (mut ac, drc) = store_with_sink(&backup);

    ac.set(Path::new("fdir"), file_rec("a", b"alpha")).unwrap();
    ac.flush(false).unwrap();
    let (_, digest) = attrib_files(&backup.join("fdir")).unwrap()[0];

    // Same record again: dirty, but content unchanged.
    ac.set(Path::new("fdir"), file_rec("a", b"alpha")).unwrap();
    ac.flush(false).unwrap();

    assert_eq!(drc.borrow().pending(CompressMode::None, &digest), 1);
    assert_eq!(attrib_files(&backup.join("fdir")).unwrap().len(), 1);
}

#[test]
fn emptied_container_is_removed_with_decrement() {
    let tmp = tempfile::tempdir().unwrap();
    let backup = tmp.path().join("1");
    std::fs::create_dir_all(&backup).unwrap();
    let (mut ac, drc) = store_with_sink(&backup);

    ac.set(Path::new("fdir"), file_rec("a", b"alpha")).unwrap();
    ac.flush(false).unwrap();
    let (_, digest) = attrib_files(&backup.join("fdir")).unwrap()[0];

    ac.remove(Path::new("fdir"), "a").unwrap();
    ac.flush(false).unwrap();

    assert!(attrib_files(&backup.join("fdir")).unwrap().is_empty());
    assert_eq!(drc.borrow().pending(CompressMode::None, &digest), 0);
}

#[test]
fn legacy_zero_length_container_reads_from_pool() {
    let tmp = tempfile::tempdir().unwrap();
    let top = tmp.path();
    let backup = top.join("1");
    let dir = backup.join("fdir");
    std::fs::create_dir_all(&dir).unwrap();

    // Container content lives in the pool; the attrib file is empty with
    // the digest in its name.
    let mut container = Container::new();
    container.insert("a".into(), file_rec("a", b"alpha"));
    let bytes = encode_container(&container).unwrap();
    let digest = Digest::of(&bytes);
    let layout = Layout::new(top);
    crate::compress::write_file(
        &layout.pool_path(CompressMode::None, &digest),
        CompressMode::None,
        &bytes,
    )
    .unwrap();
    std::fs::write(dir.join(attrib_file_name(&digest)), b"").unwrap();

    let mut ac = AttribStore::new(&backup, CompressMode::None, layout);
    let entries = ac.load_dir(Path::new("fdir")).unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries.contains_key("a"));
}

#[test]
fn legacy_container_upgrades_in_place_without_deltas() {
    let tmp = tempfile::tempdir().unwrap();
    let top = tmp.path();
    let backup = top.join("1");
    let dir = backup.join("fdir");
    std::fs::create_dir_all(&dir).unwrap();

    let mut container = Container::new();
    container.insert("a".into(), file_rec("a", b"alpha"));
    let bytes = encode_container(&container).unwrap();
    let digest = Digest::of(&bytes);
    let layout = Layout::new(top);
    crate::compress::write_file(
        &layout.pool_path(CompressMode::None, &digest),
        CompressMode::None,
        &bytes,
    )
    .unwrap();
    std::fs::write(dir.join(attrib_file_name(&digest)), b"").unwrap();

    let (mut ac, drc) = store_with_sink(&backup);
    ac.set_legacy_read_only(false);
    ac.load_dir(Path::new("fdir")).unwrap();
    ac.flush(false).unwrap();

    // Same digest, now inlined; no refcount change.
    let raw = std::fs::read(dir.join(attrib_file_name(&digest))).unwrap();
    assert_eq!(raw, bytes);
    assert!(drc.borrow().is_empty());
}

#[test]
fn inode_table_roundtrip() {
    let tmp = tempfile::tempdir().unwrap();
    let backup = tmp.path().join("1");
    std::fs::create_dir_all(&backup).unwrap();
    let (mut ac, _drc) = store_with_sink(&backup);

    let mut rec = file_rec("77", b"shared content");
    rec.nlinks = 2;
    ac.set_inode(77, rec).unwrap();
    ac.flush(false).unwrap();

    assert!(backup.join("inode").join("00").is_dir());
    let back = ac.get_inode(77).unwrap().unwrap();
    assert_eq!(back.nlinks, 2);
    assert!(ac.delete_inode(77).unwrap());
    assert_eq!(ac.get_inode(77).unwrap(), None);
}

#[test]
fn current_attrib_prefers_newest() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let d1 = Digest::of(b"one");
    let d2 = Digest::of(b"two");
    let f1 = dir.join(attrib_file_name(&d1));
    let f2 = dir.join(attrib_file_name(&d2));
    std::fs::write(&f1, b"x").unwrap();
    std::fs::write(&f2, b"y").unwrap();
    let old = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
    let file = std::fs::File::options().write(true).open(&f1).unwrap();
    file.set_modified(old).unwrap();
    drop(file);

    let (name, digest) = current_attrib(dir).unwrap().unwrap();
    assert_eq!(digest, d2);
    assert_eq!(name, attrib_file_name(&d2));
}
