//! Per-branch append-only delta log plus its two in-memory indices.
//!
//! `BranchCtx` owns no bytes itself — it only knows the absolute byte range
//! of its log inside a [`Region`] and the offsets it has already indexed.
//! Every operation that touches storage takes the region as an explicit
//! argument, so a [`crate::manager::Filesystem`] can hold many branch
//! contexts alongside one region without fighting the borrow checker.

use std::collections::BTreeMap;
use std::sync::Mutex;

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::format::{
	CreateRecord, DeleteRecord, DeltaHeader, DeltaType, RenameRecord, SetattrRecord,
	TruncateRecord, WriteRecord, ATTR_MODE, ATTR_SIZE, CREATE_RECORD_SIZE, DELETE_RECORD_SIZE,
	DELTA_HEADER_SIZE, RENAME_RECORD_SIZE, WRITE_RECORD_SIZE,
};
use crate::hash::name_hash;
use crate::region::{Allocator, Region};

/// The latest known state of one inode as seen from one branch.
#[derive(Debug, Clone)]
pub struct InodeEntry {
	pub hdr_offset: u64,
	pub deleted: bool,
	pub size: u64,
	pub mode: u32,
	/// The directory this inode currently lives in: set by CREATE/MKDIR and
	/// updated by the live side of a RENAME. Used to answer `..` in readdir.
	pub parent_ino: u64,
}

/// The latest known state of one `(parent_ino, name)` pair as seen from one
/// branch.
#[derive(Debug, Clone)]
pub struct DirentEntry {
	pub hdr_offset: u64,
	pub deleted: bool,
	pub parent_ino: u64,
	pub name: String,
	/// The inode this name refers (or referred) to: `new_ino` for a live
	/// CREATE/MKDIR, the tombstoned inode for a DELETE, the moved inode for
	/// either side of a RENAME.
	pub ino: u64,
}

#[derive(Default)]
struct Indices {
	inode: BTreeMap<u64, InodeEntry>,
	/// Keyed by `(parent_ino << 32 | name_hash, insertion_sequence)`. The
	/// sequence number deterministically breaks hash collisions into the
	/// "right subtree": later-inserted colliding names simply sort after
	/// earlier ones under the same primary key.
	dirent: BTreeMap<(u64, u64), DirentEntry>,
	dirent_seq: u64,
}

impl Indices {
	fn upsert_inode(
		&mut self,
		ino: u64,
		hdr_offset: u64,
		deleted: bool,
		size: Option<u64>,
		mode: Option<u32>,
		parent: Option<u64>,
		extend: bool,
	) {
		let entry = self.inode.entry(ino).or_insert(InodeEntry {
			hdr_offset,
			deleted,
			size: 0,
			mode: 0,
			parent_ino: 0,
		});
		entry.hdr_offset = hdr_offset;
		entry.deleted = deleted;
		if let Some(size) = size {
			entry.size = if extend { entry.size.max(size) } else { size };
		}
		if let Some(mode) = mode {
			entry.mode = mode;
		}
		if let Some(parent) = parent {
			entry.parent_ino = parent;
		}
	}

	fn upsert_dirent(&mut self, parent_ino: u64, name: &str, hdr_offset: u64, deleted: bool, ino: u64) {
		let primary = ((parent_ino << 32) | name_hash(name, parent_ino) as u64, 0);
		let primary_next = (primary.0 + 1, 0);
		let existing = self
			.dirent
			.range(primary..primary_next)
			.find(|(_, e)| e.name == name)
			.map(|(k, _)| *k);
		match existing {
			Some(key) => {
				let entry = self.dirent.get_mut(&key).unwrap();
				entry.hdr_offset = hdr_offset;
				entry.deleted = deleted;
				entry.ino = ino;
			}
			None => {
				self.dirent_seq += 1;
				self.dirent.insert(
					(primary.0, self.dirent_seq),
					DirentEntry {
						hdr_offset,
						deleted,
						parent_ino,
						name: name.to_string(),
						ino,
					},
				);
			}
		}
	}

	fn lookup_dirent(&self, parent_ino: u64, name: &str) -> Option<DirentEntry> {
		let primary = ((parent_ino << 32) | name_hash(name, parent_ino) as u64, 0);
		let primary_next = (primary.0 + 1, 0);
		self.dirent
			.range(primary..primary_next)
			.find(|(_, e)| e.name == name)
			.map(|(_, e)| e.clone())
	}
}

/// An in-memory context for one branch: its delta-log allocator and its two
/// indices. Does not own region bytes.
pub struct BranchCtx {
	pub branch_id: u64,
	pub parent_id: u64,
	pub name: String,
	pub delta_log_offset: u64,
	pub alloc: Allocator,
	next_local_ino: Mutex<u64>,
	indices: Mutex<Indices>,
}

impl BranchCtx {
	pub fn new(
		branch_id: u64,
		parent_id: u64,
		name: String,
		delta_log_offset: u64,
		delta_log_capacity: u64,
		delta_log_used: u64,
		next_local_ino: u64,
	) -> Self {
		Self {
			branch_id,
			parent_id,
			name,
			delta_log_offset,
			alloc: Allocator::new(delta_log_offset, delta_log_capacity, delta_log_used),
			next_local_ino: Mutex::new(next_local_ino),
			indices: Mutex::new(Indices::default()),
		}
	}

	/// Bytes actually used in this branch's log, relative to its own start.
	pub fn used(&self) -> u64 {
		self.alloc.used()
	}

	pub fn capacity(&self) -> u64 {
		self.alloc.capacity()
	}

	/// Allocates a fresh branch-local inode id, carving from
	/// `branch_id * 2^20` so ids stay globally unique across every branch
	/// without coordinating a shared counter.
	pub fn alloc_ino(&self) -> u64 {
		let mut counter = self.next_local_ino.lock().unwrap();
		let ino = (self.branch_id << 20) | *counter;
		*counter += 1;
		ino
	}

	/// The next branch-local inode counter value, for the manager to persist
	/// into this branch's on-disk table slot after an allocation.
	pub fn next_local_ino(&self) -> u64 {
		*self.next_local_ino.lock().unwrap()
	}

	/// Scans the log from its start up to the current watermark, rebuilding
	/// both indices from scratch. Iterative, not recursive, so a long branch
	/// chain never threatens stack depth; the manager is responsible for
	/// calling this on every branch in parent-first order.
	pub fn build_index(&self, region: &Region) -> Result<()> {
		let mut indices = self.indices.lock().unwrap();
		*indices = Indices::default();
		let mut local_offset = 0u64;
		let used = self.alloc.used();
		while local_offset < used {
			let absolute = self.delta_log_offset + local_offset;
			let hdr_bytes = region.read_at(absolute, DELTA_HEADER_SIZE)?;
			let hdr = match DeltaHeader::decode(&hdr_bytes)? {
				Some(hdr) => hdr,
				None => break,
			};
			if (hdr.total_size as u64) < DELTA_HEADER_SIZE as u64 {
				return Err(Error::InvalidFormat);
			}
			let payload_len = hdr.total_size as usize - DELTA_HEADER_SIZE;
			let payload = region.read_at(absolute + DELTA_HEADER_SIZE as u64, payload_len)?;
			index_one(&mut indices, absolute, hdr, &payload)?;
			local_offset += hdr.total_size as u64;
		}
		debug!(
			"branch '{}' (id {}): indexed {} bytes, {} inodes, {} dirents",
			self.name,
			self.branch_id,
			local_offset,
			indices.inode.len(),
			indices.dirent.len()
		);
		Ok(())
	}

	/// Appends one delta entry: allocates `header + payload.len()` bytes,
	/// writes them, then updates both indices. `payload` is the
	/// already-encoded type-specific record plus any trailing name bytes.
	pub fn append(
		&self,
		region: &Region,
		ty: DeltaType,
		ino: u64,
		payload: &[u8],
		timestamp_ns: u64,
	) -> Result<u64> {
		let total_size = DELTA_HEADER_SIZE + payload.len();
		let offset = self.alloc.alloc(total_size)?;
		let mut buf = vec![0u8; total_size];
		let hdr = DeltaHeader {
			ty,
			total_size: total_size as u32,
			ino,
			timestamp_ns,
		};
		hdr.encode(&mut buf[..DELTA_HEADER_SIZE]);
		buf[DELTA_HEADER_SIZE..].copy_from_slice(payload);
		region.write_at(offset, &buf)?;
		region.sync(offset, total_size);
		let mut indices = self.indices.lock().unwrap();
		index_one(&mut indices, offset, hdr, payload)?;
		Ok(offset)
	}

	pub fn lookup_inode(&self, ino: u64) -> Option<InodeEntry> {
		self.indices.lock().unwrap().inode.get(&ino).cloned()
	}

	pub fn lookup_dirent(&self, parent_ino: u64, name: &str) -> Option<DirentEntry> {
		self.indices.lock().unwrap().lookup_dirent(parent_ino, name)
	}

	pub fn is_deleted(&self, ino: u64) -> bool {
		self.indices
			.lock()
			.unwrap()
			.inode
			.get(&ino)
			.map(|e| e.deleted)
			.unwrap_or(false)
	}

	pub fn get_size(&self, ino: u64) -> Option<u64> {
		self.indices.lock().unwrap().inode.get(&ino).map(|e| e.size)
	}

	/// Raw forward scan of this branch's log for every WRITE to `ino`
	/// overlapping `[pos, pos + out.len())`. Unlike every other query here
	/// this does not consult the index — the index only remembers an
	/// inode's *current* size, not the history of WRITE byte ranges, so
	/// answering "what bytes are at this position" requires rereading the
	/// log. Each overlapping WRITE unconditionally overwrites the bytes it
	/// covers in `out`, in log order, so a later WRITE in this branch always
	/// wins over an earlier one that touched the same byte — including a
	/// WRITE that only partially overlaps an older one.
	pub fn apply_writes_range(&self, region: &Region, ino: u64, pos: u64, out: &mut [Option<u8>]) -> Result<()> {
		if out.is_empty() {
			return Ok(());
		}
		let end = pos + out.len() as u64;
		let mut local_offset = 0u64;
		let used = self.alloc.used();
		while local_offset < used {
			let absolute = self.delta_log_offset + local_offset;
			let hdr_bytes = region.read_at(absolute, DELTA_HEADER_SIZE)?;
			let hdr = match DeltaHeader::decode(&hdr_bytes)? {
				Some(hdr) => hdr,
				None => break,
			};
			if hdr.ty == DeltaType::Write && hdr.ino == ino {
				let wr_bytes = region.read_at(absolute + DELTA_HEADER_SIZE as u64, WRITE_RECORD_SIZE)?;
				let wr = WriteRecord::decode(&wr_bytes);
				let wr_end = wr.offset + wr.len as u64;
				let overlap_start = pos.max(wr.offset);
				let overlap_end = end.min(wr_end);
				if overlap_start < overlap_end {
					let data_base = absolute + DELTA_HEADER_SIZE as u64 + WRITE_RECORD_SIZE as u64;
					let len = (overlap_end - overlap_start) as usize;
					let data = region.read_at(data_base + (overlap_start - wr.offset), len)?;
					let out_start = (overlap_start - pos) as usize;
					for (i, byte) in data.into_iter().enumerate() {
						out[out_start + i] = Some(byte);
					}
				}
			}
			local_offset += hdr.total_size as u64;
		}
		Ok(())
	}

	/// All live (non-tombstone) dirents with the given parent, for readdir.
	pub fn dirents_for_parent(&self, parent_ino: u64) -> Vec<DirentEntry> {
		self.indices
			.lock()
			.unwrap()
			.dirent
			.values()
			.filter(|e| e.parent_ino == parent_ino)
			.cloned()
			.collect()
	}

	/// Drops both indices. Storage bytes are untouched — a committed or
	/// aborted branch's log bytes remain exactly where the allocator put
	/// them (no reclamation).
	pub fn destroy(&self) {
		let mut indices = self.indices.lock().unwrap();
		*indices = Indices::default();
		warn!("branch '{}' (id {}) destroyed", self.name, self.branch_id);
	}
}

fn decode_name(payload: &[u8], start: usize, len: usize) -> Result<String> {
	let buf = payload.get(start..start + len).ok_or(Error::InvalidFormat)?;
	String::from_utf8(buf.to_vec()).map_err(|_| Error::InvalidFormat)
}

/// Shared by `append` (fresh entry) and `build_index` (replay from storage):
/// given a decoded header and its payload bytes, mutate the two indices the
/// same way regardless of where the entry came from.
fn index_one(indices: &mut Indices, hdr_offset: u64, hdr: DeltaHeader, payload: &[u8]) -> Result<()> {
	match hdr.ty {
		DeltaType::Create | DeltaType::Mkdir => {
			let cr = CreateRecord::decode(payload);
			let name = decode_name(payload, CREATE_RECORD_SIZE, cr.name_len as usize)?;
			indices.upsert_inode(cr.new_ino, hdr_offset, false, Some(0), Some(cr.mode), Some(cr.parent_ino), false);
			indices.upsert_dirent(cr.parent_ino, &name, hdr_offset, false, cr.new_ino);
		}
		DeltaType::Delete => {
			let del = DeleteRecord::decode(payload);
			let name = decode_name(payload, DELETE_RECORD_SIZE, del.name_len as usize)?;
			indices.upsert_inode(hdr.ino, hdr_offset, true, None, None, None, false);
			indices.upsert_dirent(del.parent_ino, &name, hdr_offset, true, hdr.ino);
		}
		DeltaType::Truncate => {
			let tr = TruncateRecord::decode(payload);
			indices.upsert_inode(hdr.ino, hdr_offset, false, Some(tr.new_size), None, None, false);
		}
		DeltaType::Write => {
			let wr = WriteRecord::decode(payload);
			let end = wr.offset + wr.len as u64;
			indices.upsert_inode(hdr.ino, hdr_offset, false, Some(end), None, None, true);
		}
		DeltaType::Setattr => {
			let sa = SetattrRecord::decode(payload);
			let size = (sa.valid & ATTR_SIZE != 0).then_some(sa.size);
			let mode = (sa.valid & ATTR_MODE != 0).then_some(sa.mode);
			indices.upsert_inode(hdr.ino, hdr_offset, false, size, mode, None, false);
		}
		DeltaType::Rename => {
			let rn = RenameRecord::decode(payload);
			let old_name = decode_name(payload, RENAME_RECORD_SIZE, rn.old_name_len as usize)?;
			let new_name = decode_name(
				payload,
				RENAME_RECORD_SIZE + rn.old_name_len as usize,
				rn.new_name_len as usize,
			)?;
			indices.upsert_dirent(rn.old_parent_ino, &old_name, hdr_offset, true, rn.ino);
			indices.upsert_dirent(rn.new_parent_ino, &new_name, hdr_offset, false, rn.ino);
			indices.upsert_inode(rn.ino, hdr_offset, false, None, None, Some(rn.new_parent_ino), false);
		}
	}
	Ok(())
}
