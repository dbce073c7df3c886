use fuser::FileType;
use std::sync::Arc;
use tokio::runtime::Runtime;
use valtown_lib::ValType;

use crate::inode::ROOT_INODE;
use crate::root::MountRoot;
use crate::test_support::{MockValTown, TestEnv};
use crate::valfs::ValFs;

fn create_test_fs(api: Arc<MockValTown>) -> (ValFs, TestEnv) {
    let runtime = Arc::new(Runtime::new().expect("create runtime"));
    let env = TestEnv::new(api);
    let root = Arc::new(MountRoot::assemble(&env.ctx));
    runtime.block_on(root.refresh_all());
    (ValFs::new(runtime, env.ctx.clone(), root), env)
}

fn dir_ino(fs: &ValFs, name: &str) -> u64 {
    fs.lookup_entry(ROOT_INODE, name)
        .unwrap_or_else(|e| panic!("lookup {} failed: {}", name, e))
        .ino
}

#[test]
fn test_root_lists_containers_and_static_files() {
    let (fs, _env) = create_test_fs(MockValTown::new());
    let names: Vec<String> = fs
        .readdir_entries(ROOT_INODE, 0)
        .expect("readdir root")
        .into_iter()
        .map(|(_, _, name, _)| name)
        .collect();
    assert_eq!(names, vec![".", "..", "vals", "blobs", "deno.json"]);

    let vals = fs.lookup_entry(ROOT_INODE, "vals").expect("lookup vals");
    assert_eq!(vals.kind, FileType::Directory);
    assert_eq!(vals.perm, 0o555);
    let deno = fs.lookup_entry(ROOT_INODE, "deno.json").expect("lookup deno.json");
    assert_eq!(deno.kind, FileType::RegularFile);
    assert_eq!(deno.perm, 0o644);
    assert!(deno.size > 0);

    assert_eq!(fs.lookup_entry(ROOT_INODE, ".cursorrules").unwrap_err(), libc::ENOENT);
}

#[test]
fn test_readdir_resumes_from_offset() {
    let api = MockValTown::new();
    api.add_blob("a", b"1");
    api.add_blob("b", b"2");
    api.add_blob("c", b"3");
    let (fs, _env) = create_test_fs(api);
    let blobs = dir_ino(&fs, "blobs");

    let all = fs.readdir_entries(blobs, 0).expect("readdir");
    assert_eq!(all.len(), 5);
    let (_, _, name, offset) = &all[3];
    assert_eq!(name, "b");

    let rest = fs.readdir_entries(blobs, *offset).expect("readdir rest");
    let names: Vec<&str> = rest.iter().map(|(_, _, n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["c"]);

    // Stopped right after ".": ".." is still owed.
    let after_dot = fs.readdir_entries(blobs, 1).expect("readdir after dot");
    let names: Vec<&str> = after_dot.iter().map(|(_, _, n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["..", "a", "b", "c"]);
    let offsets: Vec<i64> = after_dot.iter().map(|(_, _, _, o)| *o).collect();
    assert_eq!(offsets, vec![2, 3, 4, 5]);
}

#[test]
fn test_create_write_read_blob() {
    let api = MockValTown::new();
    let (fs, _env) = create_test_fs(api.clone());
    let blobs = dir_ino(&fs, "blobs");

    let (attr, fh, _) = fs.create_file(blobs, "note.txt").expect("create blob");
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.perm, 0o666);
    assert_eq!(fs.write_handle(fh, 0, b"hello").expect("write"), 5);
    assert_eq!(fs.read_handle(fh, 0, 100).expect("read"), b"hello");
    assert_eq!(fs.getattr_entry(attr.ino).expect("getattr").size, 5);
    fs.release_handle(fh).expect("release");

    assert_eq!(fs.open_handles(), 0);
    assert_eq!(api.blob_data("note.txt").expect("uploaded"), b"hello");
}

#[test]
fn test_val_open_is_direct_io() {
    let api = MockValTown::new();
    api.add_val("v1", "hello", ValType::Script, "export const x = 1;\n");
    let (fs, _env) = create_test_fs(api);
    let vals = dir_ino(&fs, "vals");

    let attr = fs.lookup_entry(vals, "hello.S.tsx").expect("lookup val");
    assert_eq!(attr.perm, 0o666);
    let (fh, flags) = fs.open_file(attr.ino, libc::O_RDWR).expect("open val");
    assert_eq!(flags, fuser::consts::FOPEN_DIRECT_IO);

    let text = String::from_utf8(fs.read_handle(fh, 0, 4096).expect("read")).expect("utf-8");
    assert!(text.contains("id: v1"));
    assert!(text.ends_with("export const x = 1;\n"));
    assert_eq!(fs.getattr_entry(attr.ino).expect("getattr").size, text.len() as u64);
    fs.release_handle(fh).expect("release");
}

#[test]
fn test_val_write_through_handle() {
    let api = MockValTown::new();
    api.add_val("v1", "hello", ValType::Script, "old();\n");
    let (fs, _env) = create_test_fs(api.clone());
    let vals = dir_ino(&fs, "vals");
    let attr = fs.lookup_entry(vals, "hello.S.tsx").expect("lookup val");

    let (fh, _) = fs.open_file(attr.ino, libc::O_WRONLY).expect("open");
    fs.write_handle(fh, 0, b"new();\n").expect("write");
    fs.release_handle(fh).expect("release");
    assert_eq!(api.val("v1").expect("val").code, "new();\n");

    assert_eq!(fs.write_handle(fh, 0, b"x").unwrap_err(), libc::EBADF);
    assert_eq!(fs.write_handle(fh, -1, b"x").unwrap_err(), libc::EINVAL);
}

#[test]
fn test_static_file_is_read_only() {
    let (fs, _env) = create_test_fs(MockValTown::new());
    let attr = fs.lookup_entry(ROOT_INODE, "deno.json").expect("lookup");

    assert_eq!(fs.open_file(attr.ino, libc::O_RDWR).unwrap_err(), libc::EACCES);
    let (fh, _) = fs.open_file(attr.ino, libc::O_RDONLY).expect("open");
    let data = fs.read_handle(fh, 0, 1 << 16).expect("read");
    assert_eq!(data.len() as u64, attr.size);
    assert_eq!(fs.write_handle(fh, 0, b"{}").unwrap_err(), libc::EACCES);
    fs.release_handle(fh).expect("release");
}

#[test]
fn test_errno_mapping_at_the_boundary() {
    let api = MockValTown::new();
    api.add_val("v1", "hello", ValType::Script, "1");
    let (fs, _env) = create_test_fs(api);
    let vals = dir_ino(&fs, "vals");
    let blobs = dir_ino(&fs, "blobs");

    assert_eq!(fs.lookup_entry(vals, "nope.S.tsx").unwrap_err(), libc::ENOENT);
    assert_eq!(fs.create_file(ROOT_INODE, "x").unwrap_err(), libc::EPERM);
    assert_eq!(fs.create_file(vals, "x.txt").unwrap_err(), libc::EINVAL);
    assert_eq!(fs.create_file(vals, "hello.S.tsx").unwrap_err(), libc::EEXIST);
    assert_eq!(fs.unlink_entry(blobs, "missing").unwrap_err(), libc::ENOENT);
    assert_eq!(
        fs.rename_entry(vals, "hello.S.tsx", blobs, "hello").unwrap_err(),
        libc::EINVAL
    );
    assert_eq!(fs.open_file(vals, libc::O_RDONLY).unwrap_err(), libc::EISDIR);
    assert_eq!(fs.read_handle(999, 0, 1).unwrap_err(), libc::EBADF);
    assert_eq!(fs.getattr_entry(12345).unwrap_err(), libc::ENOENT);
}

#[test]
fn test_rename_and_unlink_through_glue() {
    let api = MockValTown::new();
    api.add_blob("a.txt", b"data");
    let (fs, _env) = create_test_fs(api.clone());
    let blobs = dir_ino(&fs, "blobs");

    fs.rename_entry(blobs, "a.txt", blobs, "b.txt").expect("rename");
    assert!(fs.lookup_entry(blobs, "b.txt").is_ok());
    assert_eq!(fs.lookup_entry(blobs, "a.txt").unwrap_err(), libc::ENOENT);
    assert_eq!(api.blob_data("b.txt").expect("copied"), b"data");

    fs.unlink_entry(blobs, "b.txt").expect("unlink");
    assert!(api.blob_data("b.txt").is_none());
}

#[test]
fn test_setattr_truncates_open_blob() {
    let api = MockValTown::new();
    api.add_blob("t", b"0123456789");
    let (fs, _env) = create_test_fs(api);
    let blobs = dir_ino(&fs, "blobs");
    let attr = fs.lookup_entry(blobs, "t").expect("lookup");

    let (fh, flags) = fs.open_file(attr.ino, libc::O_RDWR).expect("open");
    assert_eq!(flags, 0);
    let attr = fs.setattr_entry(attr.ino, Some(3)).expect("setattr");
    assert_eq!(attr.size, 3);
    assert_eq!(fs.read_handle(fh, 0, 100).expect("read"), b"012");
    fs.release_handle(fh).expect("release");

    assert_eq!(fs.setattr_entry(blobs, Some(0)).unwrap_err(), libc::EISDIR);
}
