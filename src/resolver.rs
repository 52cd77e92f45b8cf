//! Read-only queries that answer "what is true right now" by walking a
//! branch chain from the active branch back to the root, falling back to the
//! embedded base image at the end of the chain.
//!
//! None of these functions mutate anything; they only ever call into
//! [`BranchCtx`]'s index lookups and [`BaseImage`]'s region reads. A chain is
//! passed as a slice ordered active-branch-first, parent-last (the order a
//! [`crate::manager::Filesystem`] already holds its ancestry in).

use crate::base::BaseImage;
use crate::branch::BranchCtx;
use crate::error::{Error, Result};
use crate::region::Region;

/// The resolved attributes of a live inode.
#[derive(Debug, Clone, Copy)]
pub struct InodeAttr {
	pub mode: u32,
	pub size: u64,
}

/// Walks `chain` (active-first) looking for the first branch that has an
/// opinion about `ino`, then falls back to `base`. A branch's opinion is
/// either "deleted here" (stop, absent) or "here's its current mode/size"
/// (stop, found) — a branch with no index entry at all defers to its parent.
pub fn resolve_inode(
	chain: &[&BranchCtx],
	base: Option<&BaseImage>,
	region: &Region,
	ino: u64,
) -> Result<InodeAttr> {
	for branch in chain {
		if branch.is_deleted(ino) {
			return Err(Error::Absent);
		}
		if let Some(entry) = branch.lookup_inode(ino) {
			return Ok(InodeAttr {
				mode: entry.mode,
				size: entry.size,
			});
		}
	}
	let base = base.ok_or(Error::Absent)?;
	let inode = base.inode(region, ino)?;
	Ok(InodeAttr {
		mode: inode.mode,
		size: inode.size,
	})
}

/// Resolves the directory `ino` currently lives in, walking `chain` the same
/// way `resolve_inode` does. Answers the `..` entry in a readdir listing.
pub fn resolve_parent(
	chain: &[&BranchCtx],
	base: Option<&BaseImage>,
	region: &Region,
	ino: u64,
) -> Result<u64> {
	for branch in chain {
		if branch.is_deleted(ino) {
			return Err(Error::Absent);
		}
		if let Some(entry) = branch.lookup_inode(ino) {
			return Ok(entry.parent_ino);
		}
	}
	let base = base.ok_or(Error::Absent)?;
	let inode = base.inode(region, ino)?;
	Ok(inode.parent_ino as u64)
}

/// Resolves `(parent_ino, name)` to a live inode number, or `None` if the
/// name does not currently exist. The first branch in the chain with any
/// opinion about this name wins, live or tombstoned; only once every branch
/// is silent on the name do we consult the base image, and even then a
/// tombstone anywhere in the chain must still shadow it.
pub fn name_exists(
	chain: &[&BranchCtx],
	base: Option<&BaseImage>,
	region: &Region,
	parent_ino: u64,
	name: &str,
) -> Result<Option<u64>> {
	for branch in chain {
		if let Some(entry) = branch.lookup_dirent(parent_ino, name) {
			return Ok(if entry.deleted { None } else { Some(entry.ino) });
		}
	}
	let base = match base {
		Some(base) => base,
		None => return Ok(None),
	};
	match base.lookup_child(region, parent_ino, name)? {
		Some(child) => Ok(Some(child.ino as u64)),
		None => Ok(None),
	}
}

/// Resolves up to `len` bytes of `ino`'s data starting at `pos`, byte by
/// byte: the base image (if any) is the oldest layer, then each ancestor in
/// the chain overlays its own WRITEs over it in turn, ending with the active
/// branch, so a later WRITE always wins over an earlier one regardless of
/// whether they fully or only partially overlap. Returns the longest
/// contiguous run of resolved bytes starting at `pos` — shorter than `len`
/// if a hole is hit first, `None` if `pos` itself resolves to nothing.
pub fn resolve_file_data(
	chain: &[&BranchCtx],
	base: Option<&BaseImage>,
	region: &Region,
	ino: u64,
	pos: u64,
	len: usize,
) -> Result<Option<Vec<u8>>> {
	if len == 0 {
		return Ok(Some(Vec::new()));
	}

	let mut out: Vec<Option<u8>> = vec![None; len];
	if let Some(base) = base {
		if let Some(bytes) = base.data_range(region, ino, pos, len)? {
			for (slot, byte) in out.iter_mut().zip(bytes) {
				*slot = Some(byte);
			}
		}
	}
	for branch in chain.iter().rev() {
		branch.apply_writes_range(region, ino, pos, &mut out)?;
	}

	if out[0].is_none() {
		return Ok(None);
	}
	let run: Vec<u8> = out.into_iter().take_while(|b| b.is_some()).flatten().collect();
	Ok(Some(run))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::format::{CreateRecord, DeleteRecord, DeltaType, CREATE_RECORD_SIZE, DELETE_RECORD_SIZE, WriteRecord, WRITE_RECORD_SIZE};

	fn create_payload(parent: u64, new_ino: u64, mode: u32, name: &str) -> Vec<u8> {
		let rec = CreateRecord {
			parent_ino: parent,
			new_ino,
			mode,
			name_len: name.len() as u16,
			flags: 0,
		};
		let mut buf = vec![0u8; CREATE_RECORD_SIZE + name.len()];
		rec.encode(&mut buf[..CREATE_RECORD_SIZE]);
		buf[CREATE_RECORD_SIZE..].copy_from_slice(name.as_bytes());
		buf
	}

	fn write_payload(offset: u64, data: &[u8]) -> Vec<u8> {
		let rec = WriteRecord {
			offset,
			len: data.len() as u32,
			flags: 0,
		};
		let mut buf = vec![0u8; WRITE_RECORD_SIZE + data.len()];
		rec.encode(&mut buf[..WRITE_RECORD_SIZE]);
		buf[WRITE_RECORD_SIZE..].copy_from_slice(data);
		buf
	}

	#[test]
	fn resolve_inode_falls_through_to_parent_branch() {
		let region = Region::zeroed(8192);
		let parent = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let payload = create_payload(1, 2, 0o100644, "a");
		parent.append(&region, DeltaType::Create, 2, &payload, 1).unwrap();

		let child = BranchCtx::new(2, 1, "feature".into(), 4096, 4096, 0, 1);
		let chain = [&child, &parent];
		let attr = resolve_inode(&chain, None, &region, 2).unwrap();
		assert_eq!(attr.mode, 0o100644);
	}

	#[test]
	fn resolve_inode_stops_at_nearer_delete() {
		let region = Region::zeroed(8192);
		let parent = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let payload = create_payload(1, 2, 0o100644, "a");
		parent.append(&region, DeltaType::Create, 2, &payload, 1).unwrap();

		let child = BranchCtx::new(2, 1, "feature".into(), 4096, 4096, 0, 1);
		let del = DeleteRecord {
			parent_ino: 1,
			name_len: 1,
			flags: 0,
		};
		let mut buf = vec![0u8; DELETE_RECORD_SIZE + 1];
		del.encode(&mut buf[..DELETE_RECORD_SIZE]);
		buf[DELETE_RECORD_SIZE..].copy_from_slice(b"a");
		child.append(&region, DeltaType::Delete, 2, &buf, 2).unwrap();

		let chain = [&child, &parent];
		assert_eq!(resolve_inode(&chain, None, &region, 2).unwrap_err(), Error::Absent);
	}

	#[test]
	fn name_exists_first_opinion_wins() {
		let region = Region::zeroed(8192);
		let parent = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let payload = create_payload(1, 2, 0o100644, "a");
		parent.append(&region, DeltaType::Create, 2, &payload, 1).unwrap();

		let chain = [&parent];
		assert_eq!(name_exists(&chain, None, &region, 1, "a").unwrap(), Some(2));
		assert_eq!(name_exists(&chain, None, &region, 1, "missing").unwrap(), None);
	}

	#[test]
	fn resolve_file_data_prefers_most_recent_covering_write() {
		let region = Region::zeroed(8192);
		let branch = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		branch
			.append(&region, DeltaType::Write, 2, &write_payload(0, b"hello"), 1)
			.unwrap();
		branch
			.append(&region, DeltaType::Write, 2, &write_payload(0, b"HELLO"), 2)
			.unwrap();

		let chain = [&branch];
		let data = resolve_file_data(&chain, None, &region, 2, 0, 5).unwrap().unwrap();
		assert_eq!(data, b"HELLO");
	}

	#[test]
	fn resolve_parent_reflects_the_creating_directory() {
		let region = Region::zeroed(8192);
		let parent = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let payload = create_payload(1, 2, 0o100644, "a");
		parent.append(&region, DeltaType::Create, 2, &payload, 1).unwrap();

		let chain = [&parent];
		assert_eq!(resolve_parent(&chain, None, &region, 2).unwrap(), 1);
	}

	#[test]
	fn resolve_file_data_falls_back_to_base() {
		let region = Region::zeroed(8192);
		let branch = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let chain = [&branch];
		let data = resolve_file_data(&chain, None, &region, 2, 0, 5).unwrap();
		assert!(data.is_none());
	}
}
