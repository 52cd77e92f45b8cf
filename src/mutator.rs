//! Builds and appends the delta-log entries behind every mutating
//! operation: create, mkdir, unlink, rmdir, rename, write, truncate and
//! setattr. Each function here only ever appends to one branch — the
//! caller's currently active one — and relies on [`crate::resolver`] to
//! check preconditions (EEXIST, ENOENT) against the whole chain first.

use log::debug;

use crate::base::BaseImage;
use crate::branch::BranchCtx;
use crate::error::{Error, Result};
use crate::format::{
	CreateRecord, DeleteRecord, DeltaType, RenameRecord, SetattrRecord, TruncateRecord,
	WriteRecord, ATTR_GID, ATTR_MODE, ATTR_UID, CREATE_RECORD_SIZE, DELETE_RECORD_SIZE,
	RENAME_RECORD_SIZE, WRITE_RECORD_SIZE,
};
use crate::region::Region;
use crate::resolver;

fn check_absent(
	chain: &[&BranchCtx],
	base: Option<&BaseImage>,
	region: &Region,
	parent_ino: u64,
	name: &str,
) -> Result<()> {
	match resolver::name_exists(chain, base, region, parent_ino, name)? {
		Some(_) => Err(Error::Exists),
		None => Ok(()),
	}
}

/// Appends a CREATE entry for a plain file, allocating its inode on `branch`.
/// Returns the new inode number. Fails with `Exists` if `name` already
/// resolves to something live anywhere in `chain`.
pub fn create(
	branch: &BranchCtx,
	chain: &[&BranchCtx],
	base: Option<&BaseImage>,
	region: &Region,
	parent_ino: u64,
	name: &str,
	mode: u32,
	timestamp_ns: u64,
) -> Result<u64> {
	check_absent(chain, base, region, parent_ino, name)?;
	let new_ino = branch.alloc_ino();
	let rec = CreateRecord {
		parent_ino,
		new_ino,
		mode,
		name_len: name.len() as u16,
		flags: 0,
	};
	let mut payload = vec![0u8; CREATE_RECORD_SIZE + name.len()];
	rec.encode(&mut payload[..CREATE_RECORD_SIZE]);
	payload[CREATE_RECORD_SIZE..].copy_from_slice(name.as_bytes());
	branch.append(region, DeltaType::Create, new_ino, &payload, timestamp_ns)?;
	debug!("create '{name}' under {parent_ino} -> ino {new_ino} (branch {})", branch.branch_id);
	Ok(new_ino)
}

/// Appends a MKDIR entry. Identical wire shape to CREATE; kept distinct so
/// the delta type itself records what the original request meant, matching
/// the on-storage tag instead of leaning on a mode bit.
pub fn mkdir(
	branch: &BranchCtx,
	chain: &[&BranchCtx],
	base: Option<&BaseImage>,
	region: &Region,
	parent_ino: u64,
	name: &str,
	mode: u32,
	timestamp_ns: u64,
) -> Result<u64> {
	check_absent(chain, base, region, parent_ino, name)?;
	let new_ino = branch.alloc_ino();
	let rec = CreateRecord {
		parent_ino,
		new_ino,
		mode,
		name_len: name.len() as u16,
		flags: 0,
	};
	let mut payload = vec![0u8; CREATE_RECORD_SIZE + name.len()];
	rec.encode(&mut payload[..CREATE_RECORD_SIZE]);
	payload[CREATE_RECORD_SIZE..].copy_from_slice(name.as_bytes());
	branch.append(region, DeltaType::Mkdir, new_ino, &payload, timestamp_ns)?;
	debug!("mkdir '{name}' under {parent_ino} -> ino {new_ino} (branch {})", branch.branch_id);
	Ok(new_ino)
}

/// Appends a DELETE entry tombstoning `(parent_ino, name)`. Used for both
/// unlink and rmdir — directory emptiness is never checked, matching the
/// supported subset of rename/unlink semantics this core implements.
pub fn unlink(
	branch: &BranchCtx,
	chain: &[&BranchCtx],
	base: Option<&BaseImage>,
	region: &Region,
	parent_ino: u64,
	name: &str,
	timestamp_ns: u64,
) -> Result<()> {
	let ino = resolver::name_exists(chain, base, region, parent_ino, name)?.ok_or(Error::Absent)?;
	let rec = DeleteRecord {
		parent_ino,
		name_len: name.len() as u16,
		flags: 0,
	};
	let mut payload = vec![0u8; DELETE_RECORD_SIZE + name.len()];
	rec.encode(&mut payload[..DELETE_RECORD_SIZE]);
	payload[DELETE_RECORD_SIZE..].copy_from_slice(name.as_bytes());
	branch.append(region, DeltaType::Delete, ino, &payload, timestamp_ns)?;
	debug!("unlink '{name}' under {parent_ino} (was ino {ino}, branch {})", branch.branch_id);
	Ok(())
}

/// Directory removal: the supported subset is exactly unlink's tombstone,
/// with no check that the directory is empty.
pub fn rmdir(
	branch: &BranchCtx,
	chain: &[&BranchCtx],
	base: Option<&BaseImage>,
	region: &Region,
	parent_ino: u64,
	name: &str,
	timestamp_ns: u64,
) -> Result<()> {
	unlink(branch, chain, base, region, parent_ino, name, timestamp_ns)
}

/// Appends a RENAME entry moving `(old_parent, old_name)` to
/// `(new_parent, new_name)`. Only the no-replace case is supported: if the
/// destination name already resolves to something live, this returns
/// `Unsupported` rather than clobbering it.
pub fn rename(
	branch: &BranchCtx,
	chain: &[&BranchCtx],
	base: Option<&BaseImage>,
	region: &Region,
	old_parent: u64,
	old_name: &str,
	new_parent: u64,
	new_name: &str,
	timestamp_ns: u64,
) -> Result<()> {
	let ino =
		resolver::name_exists(chain, base, region, old_parent, old_name)?.ok_or(Error::Absent)?;
	if resolver::name_exists(chain, base, region, new_parent, new_name)?.is_some() {
		return Err(Error::Unsupported);
	}
	let rec = RenameRecord {
		old_parent_ino: old_parent,
		new_parent_ino: new_parent,
		ino,
		old_name_len: old_name.len() as u16,
		new_name_len: new_name.len() as u16,
	};
	let mut payload = vec![0u8; RENAME_RECORD_SIZE + old_name.len() + new_name.len()];
	rec.encode(&mut payload[..RENAME_RECORD_SIZE]);
	let old_end = RENAME_RECORD_SIZE + old_name.len();
	payload[RENAME_RECORD_SIZE..old_end].copy_from_slice(old_name.as_bytes());
	payload[old_end..].copy_from_slice(new_name.as_bytes());
	branch.append(region, DeltaType::Rename, ino, &payload, timestamp_ns)?;
	debug!(
		"rename ino {ino} '{old_parent}/{old_name}' -> '{new_parent}/{new_name}' (branch {})",
		branch.branch_id
	);
	Ok(())
}

/// Appends a WRITE entry. The payload carries the data itself, so the log
/// grows by exactly `data.len()` bytes beyond the fixed record — the delta
/// log is where the bytes live, there is no separate data area.
pub fn write(
	branch: &BranchCtx,
	region: &Region,
	ino: u64,
	pos: u64,
	data: &[u8],
	timestamp_ns: u64,
) -> Result<()> {
	if data.is_empty() {
		return Ok(());
	}
	let rec = WriteRecord {
		offset: pos,
		len: data.len() as u32,
		flags: 0,
	};
	let mut payload = vec![0u8; WRITE_RECORD_SIZE + data.len()];
	rec.encode(&mut payload[..WRITE_RECORD_SIZE]);
	payload[WRITE_RECORD_SIZE..].copy_from_slice(data);
	branch.append(region, DeltaType::Write, ino, &payload, timestamp_ns)?;
	Ok(())
}

/// Appends a TRUNCATE entry setting `ino`'s size directly, independent of
/// any WRITE history.
pub fn truncate(branch: &BranchCtx, region: &Region, ino: u64, new_size: u64, timestamp_ns: u64) -> Result<()> {
	let rec = TruncateRecord { new_size };
	let mut payload = vec![0u8; crate::format::TRUNCATE_RECORD_SIZE];
	rec.encode(&mut payload);
	branch.append(region, DeltaType::Truncate, ino, &payload, timestamp_ns)?;
	Ok(())
}

/// Appends a SETATTR entry carrying only the fields the caller actually
/// asked to change; each `None` leaves the corresponding `valid` bit unset
/// so the resolver does not clobber an untouched field.
pub fn setattr(
	branch: &BranchCtx,
	region: &Region,
	ino: u64,
	mode: Option<u32>,
	uid: Option<u32>,
	gid: Option<u32>,
	timestamp_ns: u64,
) -> Result<()> {
	let mut valid = 0u32;
	if mode.is_some() {
		valid |= ATTR_MODE;
	}
	if uid.is_some() {
		valid |= ATTR_UID;
	}
	if gid.is_some() {
		valid |= ATTR_GID;
	}
	let rec = SetattrRecord {
		mode: mode.unwrap_or(0),
		uid: uid.unwrap_or(0),
		gid: gid.unwrap_or(0),
		valid,
		size: 0,
	};
	let mut payload = vec![0u8; crate::format::SETATTR_RECORD_SIZE];
	rec.encode(&mut payload);
	branch.append(region, DeltaType::Setattr, ino, &payload, timestamp_ns)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn create_then_duplicate_fails_with_exists() {
		let region = Region::zeroed(4096);
		let branch = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let chain = [&branch];
		let ino = create(&branch, &chain, None, &region, 1, "a", 0o100644, 1).unwrap();
		assert!(ino > 0);
		let err = create(&branch, &chain, None, &region, 1, "a", 0o100644, 2).unwrap_err();
		assert_eq!(err, Error::Exists);
	}

	#[test]
	fn unlink_missing_name_fails_with_absent() {
		let region = Region::zeroed(4096);
		let branch = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let chain = [&branch];
		let err = unlink(&branch, &chain, None, &region, 1, "missing", 1).unwrap_err();
		assert_eq!(err, Error::Absent);
	}

	#[test]
	fn unlink_then_lookup_sees_tombstone() {
		let region = Region::zeroed(4096);
		let branch = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let chain = [&branch];
		create(&branch, &chain, None, &region, 1, "a", 0o100644, 1).unwrap();
		unlink(&branch, &chain, None, &region, 1, "a", 2).unwrap();
		assert_eq!(
			resolver::name_exists(&chain, None, &region, 1, "a").unwrap(),
			None
		);
	}

	#[test]
	fn rename_no_replace_rejects_existing_destination() {
		let region = Region::zeroed(4096);
		let branch = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let chain = [&branch];
		create(&branch, &chain, None, &region, 1, "a", 0o100644, 1).unwrap();
		create(&branch, &chain, None, &region, 1, "b", 0o100644, 2).unwrap();
		let err = rename(&branch, &chain, None, &region, 1, "a", 1, "b", 3).unwrap_err();
		assert_eq!(err, Error::Unsupported);
	}

	#[test]
	fn rename_moves_name_and_drops_old() {
		let region = Region::zeroed(4096);
		let branch = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let chain = [&branch];
		let ino = create(&branch, &chain, None, &region, 1, "a", 0o100644, 1).unwrap();
		rename(&branch, &chain, None, &region, 1, "a", 1, "b", 2).unwrap();
		assert_eq!(resolver::name_exists(&chain, None, &region, 1, "a").unwrap(), None);
		assert_eq!(
			resolver::name_exists(&chain, None, &region, 1, "b").unwrap(),
			Some(ino)
		);
	}

	#[test]
	fn write_then_read_round_trips_through_resolver() {
		let region = Region::zeroed(4096);
		let branch = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let chain = [&branch];
		let ino = create(&branch, &chain, None, &region, 1, "a", 0o100644, 1).unwrap();
		write(&branch, &region, ino, 0, b"hello", 2).unwrap();
		let data = resolver::resolve_file_data(&chain, None, &region, ino, 0, 5)
			.unwrap()
			.unwrap();
		assert_eq!(data, b"hello");
	}

	#[test]
	fn truncate_updates_resolved_size() {
		let region = Region::zeroed(4096);
		let branch = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let chain = [&branch];
		let ino = create(&branch, &chain, None, &region, 1, "a", 0o100644, 1).unwrap();
		write(&branch, &region, ino, 0, b"hello", 2).unwrap();
		truncate(&branch, &region, ino, 2, 3).unwrap();
		let attr = resolver::resolve_inode(&chain, None, &region, ino).unwrap();
		assert_eq!(attr.size, 2);
	}

	#[test]
	fn setattr_changes_mode_without_touching_size() {
		let region = Region::zeroed(4096);
		let branch = BranchCtx::new(1, 0, "main".into(), 0, 4096, 0, 1);
		let chain = [&branch];
		let ino = create(&branch, &chain, None, &region, 1, "a", 0o100644, 1).unwrap();
		write(&branch, &region, ino, 0, b"hello", 2).unwrap();
		setattr(&branch, &region, ino, Some(0o100600), None, None, 3).unwrap();
		let attr = resolver::resolve_inode(&chain, None, &region, ino).unwrap();
		assert_eq!(attr.mode, 0o100600);
		assert_eq!(attr.size, 5);
	}
}
