//! End-to-end scenarios exercised against the public [`branchfs::Filesystem`]
//! facade, built on an in-process region. Per-module unit tests already cover
//! bump monotonicity, scan termination and dirent hash collisions at the
//! index level; these integration tests cover the behavior visible once
//! branches, commits and the base image are layered together.

use branchfs::format::ROOT_INO;
use branchfs::{Error, Filesystem};

fn small_fs() -> Filesystem {
	Filesystem::create_empty(1 << 20, 1 << 18).unwrap()
}

#[test]
fn scenario_1_create_read_unlink_on_main() {
	let fs = small_fs();
	let ino = fs.create(1, ROOT_INO, "a", 0o100644, 1).unwrap();
	fs.write(1, ino, 0, b"hello", 2).unwrap();
	assert_eq!(fs.read(1, ino, 0, 5).unwrap(), b"hello");
	fs.unlink(1, ROOT_INO, "a", 3).unwrap();
	assert_eq!(fs.lookup(1, ROOT_INO, "a").unwrap(), None);
}

#[test]
fn scenario_2_branch_isolation() {
	let fs = small_fs();
	let ino_f = fs.create(1, ROOT_INO, "f", 0o100644, 1).unwrap();
	fs.write(1, ino_f, 0, b"base", 2).unwrap();

	let branch = fs.create_branch(1, "work").unwrap();
	fs.write(branch, ino_f, 0, b"work", 3).unwrap();

	assert_eq!(fs.read(branch, ino_f, 0, 4).unwrap(), b"work");
	assert_eq!(fs.read(1, ino_f, 0, 4).unwrap(), b"base");
}

#[test]
fn scenario_3_commit_merges() {
	let fs = small_fs();
	let ino_f = fs.create(1, ROOT_INO, "f", 0o100644, 1).unwrap();
	fs.write(1, ino_f, 0, b"base", 2).unwrap();

	let branch = fs.create_branch(1, "work").unwrap();
	fs.write(branch, ino_f, 0, b"work", 3).unwrap();
	fs.commit_branch(branch).unwrap();

	assert_eq!(fs.read(1, ino_f, 0, 4).unwrap(), b"work");
}

#[test]
fn scenario_4_tombstone_across_branches() {
	// No embedded base image in this harness, so "x" is created on main
	// first to stand in for a pre-existing base entry, then removed from a
	// child branch: the tombstone must still dominate the chain.
	let fs = small_fs();
	let ino_x = fs.create(1, ROOT_INO, "x", 0o100644, 1).unwrap();
	let branch = fs.create_branch(1, "work").unwrap();
	fs.unlink(branch, ROOT_INO, "x", 2).unwrap();

	assert_eq!(fs.lookup(branch, ROOT_INO, "x").unwrap(), None);
	let names: Vec<String> = fs.readdir(branch, ROOT_INO).unwrap().into_iter().map(|e| e.name).collect();
	assert!(!names.contains(&"x".to_string()));
	// main is untouched — the tombstone is branch-local until committed.
	assert_eq!(fs.lookup(1, ROOT_INO, "x").unwrap(), Some(ino_x));
}

#[test]
fn scenario_5_overlapping_writes_last_writer_wins_per_byte() {
	let fs = small_fs();
	let ino = fs.create(1, ROOT_INO, "a", 0o100644, 1).unwrap();
	fs.write(1, ino, 0, b"AAAA", 2).unwrap();
	fs.write(1, ino, 2, b"BB", 3).unwrap();
	assert_eq!(fs.read(1, ino, 0, 4).unwrap(), b"AABB");
}

#[test]
fn scenario_6_enospc_on_append_leaves_watermark_unchanged() {
	// branch_log_capacity = delta_region_size / MAX_BRANCHES = 51200 / 256 = 200.
	let fs = Filesystem::create_empty(1 << 20, 51200).unwrap();
	// root bootstrap (48 bytes) + create "a" (49 bytes) = 97 used, 103 left.
	let ino = fs.create(1, ROOT_INO, "a", 0o100644, 1).unwrap();
	// pad to leave exactly header + write-record + 1 = 41 bytes free.
	fs.write(1, ino, 0, &[b'x'; 22], 2).unwrap();

	let pre = fs.read(1, ino, 0, 22).unwrap();
	let err = fs.write(1, ino, 100, &[1u8; 8], 3).unwrap_err();
	assert_eq!(err, Error::OutOfSpace);

	// pre-failure state is untouched...
	assert_eq!(fs.read(1, ino, 0, 22).unwrap(), pre);
	// ...and the watermark never advanced: a write sized to exactly the
	// remaining 41 bytes still succeeds.
	assert!(fs.write(1, ino, 200, &[2u8; 1], 4).is_ok());
}

#[test]
fn property_shadowing_child_write_hides_parent_write_same_branch_sees_own() {
	let fs = small_fs();
	let ino = fs.create(1, ROOT_INO, "f", 0o100644, 1).unwrap();
	fs.write(1, ino, 0, b"parent", 1).unwrap();
	let child = fs.create_branch(1, "child").unwrap();
	fs.write(child, ino, 0, b"child!", 2).unwrap();

	assert_eq!(fs.read(child, ino, 0, 6).unwrap(), b"child!");
	assert_eq!(fs.read(1, ino, 0, 6).unwrap(), b"parent");
}

#[test]
fn property_commit_equivalence() {
	let fs = small_fs();
	let ino = fs.create(1, ROOT_INO, "f", 0o100644, 1).unwrap();
	let branch = fs.create_branch(1, "work").unwrap();
	fs.write(branch, ino, 0, b"merged", 1).unwrap();

	let before_commit = fs.read(branch, ino, 0, 6).unwrap();
	fs.commit_branch(branch).unwrap();
	let after_commit = fs.read(1, ino, 0, 6).unwrap();
	assert_eq!(before_commit, after_commit);
}

#[test]
fn property_abort_leaves_no_trace() {
	let fs = small_fs();
	let before = fs.readdir(1, ROOT_INO).unwrap().len();
	let branch = fs.create_branch(1, "scratch").unwrap();
	fs.create(branch, ROOT_INO, "throwaway", 0o100644, 1).unwrap();
	fs.abort_branch(branch).unwrap();
	let after = fs.readdir(1, ROOT_INO).unwrap().len();
	assert_eq!(before, after);
}

#[test]
fn property_readdir_coverage_merges_chain_and_skips_tombstones() {
	let fs = small_fs();
	fs.create(1, ROOT_INO, "kept", 0o100644, 1).unwrap();
	let branch = fs.create_branch(1, "work").unwrap();
	fs.create(branch, ROOT_INO, "added", 0o100644, 2).unwrap();
	fs.unlink(branch, ROOT_INO, "kept", 3).unwrap();

	let names: Vec<String> = fs.readdir(branch, ROOT_INO).unwrap().into_iter().map(|e| e.name).collect();
	assert!(names.contains(&"added".to_string()));
	assert!(!names.contains(&"kept".to_string()));

	// main's own view is unaffected by the branch's tombstone.
	let main_names: Vec<String> = fs.readdir(1, ROOT_INO).unwrap().into_iter().map(|e| e.name).collect();
	assert!(main_names.contains(&"kept".to_string()));
	assert!(!main_names.contains(&"added".to_string()));
}
