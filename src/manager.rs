//! The branch manager and top-level filesystem facade: owns the region, the
//! superblock, the branch table and every live [`BranchCtx`], and is the
//! only place that creates, commits or aborts a branch.
//!
//! Every operation a caller performs names the branch it targets explicitly
//! — there is no single implicit "current branch" the way a mounted Linux
//! filesystem has a current working context, since this core is meant to sit
//! underneath a host that may have many branches open as ordinary files at
//! once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::base::BaseImage;
use crate::branch::BranchCtx;
use crate::error::{Error, Result};
use crate::format::{
	BranchRecord, BranchState, CreateRecord, DeltaType, Superblock, BRANCH_RECORD_SIZE,
	CREATE_RECORD_SIZE, MAX_BRANCHES, ROOT_INO, SUPERBLOCK_SIZE,
};
use crate::mutator;
use crate::region::{Allocator, Region};
use crate::resolver::{self, InodeAttr};

/// A directory entry as returned by `readdir`: a live name and the inode it
/// currently resolves to.
#[derive(Debug, Clone)]
pub struct DirEntry {
	pub name: String,
	pub ino: u64,
}

/// Owns one daxfs image: the region, its superblock, its branch table and
/// every branch context currently loaded.
pub struct Filesystem {
	region: Region,
	sb: Mutex<Superblock>,
	base: Option<BaseImage>,
	branches: Mutex<HashMap<u64, Arc<BranchCtx>>>,
	branch_alloc: Allocator,
	branch_log_capacity: u64,
}

impl Filesystem {
	/// Formats a brand-new image in memory: a superblock, an empty branch
	/// table and a single main branch seeded with a root directory. No base
	/// image — a freshly created filesystem has nothing to fall back to.
	pub fn create_empty(region_size: u64, delta_region_size: u64) -> Result<Self> {
		let branch_table_offset = SUPERBLOCK_SIZE as u64;
		let branch_table_size = (MAX_BRANCHES * BRANCH_RECORD_SIZE) as u64;
		let delta_region_offset = branch_table_offset + branch_table_size;
		if delta_region_offset + delta_region_size > region_size {
			return Err(Error::OutOfSpace);
		}
		let branch_log_capacity = delta_region_size / MAX_BRANCHES as u64;

		let region = Region::zeroed(region_size as usize);

		let sb = Superblock {
			flags: 0,
			region_size,
			base_offset: 0,
			base_size: 0,
			branch_table_offset,
			branch_table_active_count: 1,
			next_branch_id: 2,
			next_inode_id: 2,
			delta_region_offset,
			delta_region_size,
			delta_alloc_offset: 0,
		};
		let mut sb_buf = vec![0u8; SUPERBLOCK_SIZE];
		sb.encode(&mut sb_buf);
		region.write_at(0, &sb_buf)?;

		let branch_alloc = Allocator::new(delta_region_offset, delta_region_size, 0);
		let main_offset = branch_alloc.alloc(branch_log_capacity as usize)?;
		let main = Arc::new(BranchCtx::new(1, 0, "main".to_string(), main_offset, branch_log_capacity, 0, 1));

		let root_rec = CreateRecord {
			parent_ino: ROOT_INO,
			new_ino: ROOT_INO,
			mode: 0o40755,
			name_len: 0,
			flags: 0,
		};
		let mut root_payload = vec![0u8; CREATE_RECORD_SIZE];
		root_rec.encode(&mut root_payload);
		main.append(&region, DeltaType::Mkdir, ROOT_INO, &root_payload, 0)?;

		let branch_rec = BranchRecord {
			branch_id: 1,
			parent_id: 0,
			delta_log_offset: main_offset,
			delta_log_size: main.used(),
			delta_log_capacity: branch_log_capacity,
			state: BranchState::Active,
			refcount: 0,
			next_local_ino: 1,
			name: "main".to_string(),
		};
		let mut rec_buf = vec![0u8; BRANCH_RECORD_SIZE];
		branch_rec.encode(&mut rec_buf);
		region.write_at(branch_table_offset, &rec_buf)?;

		let mut branches = HashMap::new();
		branches.insert(1, main);

		info!("created empty image: region {region_size} bytes, delta region {delta_region_size} bytes");

		Ok(Self {
			region,
			sb: Mutex::new(sb),
			base: None,
			branches: Mutex::new(branches),
			branch_alloc,
			branch_log_capacity,
		})
	}

	/// Opens an already-formatted image: parses the superblock, every
	/// non-free branch table slot, and the embedded base image if present,
	/// then replays every branch's log in parent-first order.
	pub fn mount(region: Region) -> Result<Self> {
		let header = region.read_at(0, SUPERBLOCK_SIZE)?;
		let sb = Superblock::decode(&header)?;

		let base = if sb.base_size > 0 {
			Some(BaseImage::open(&region, sb.base_offset)?)
		} else {
			None
		};

		let mut records = Vec::new();
		for i in 0..MAX_BRANCHES {
			let offset = sb.branch_table_offset + (i * BRANCH_RECORD_SIZE) as u64;
			let buf = region.read_at(offset, BRANCH_RECORD_SIZE)?;
			let rec = BranchRecord::decode(&buf)?;
			if rec.state != BranchState::Free {
				records.push(rec);
			}
		}
		records.sort_by_key(|r| r.branch_id);

		let mut branches: HashMap<u64, Arc<BranchCtx>> = HashMap::new();
		for rec in &records {
			let ctx = Arc::new(BranchCtx::new(
				rec.branch_id,
				rec.parent_id,
				rec.name.clone(),
				rec.delta_log_offset,
				rec.delta_log_capacity,
				rec.delta_log_size,
				rec.next_local_ino,
			));
			ctx.build_index(&region)?;
			branches.insert(rec.branch_id, ctx);
		}

		let delta_alloc_used = records
			.iter()
			.map(|r| (r.delta_log_offset + r.delta_log_capacity) - sb.delta_region_offset)
			.max()
			.unwrap_or(0);
		let branch_alloc = Allocator::new(sb.delta_region_offset, sb.delta_region_size, delta_alloc_used);
		let branch_log_capacity = sb.delta_region_size / MAX_BRANCHES as u64;

		debug!("mounted image: {} active branches", branches.len());

		Ok(Self {
			region,
			sb: Mutex::new(sb),
			base,
			branches: Mutex::new(branches),
			branch_alloc,
			branch_log_capacity,
		})
	}

	fn branch(&self, branch_id: u64) -> Result<Arc<BranchCtx>> {
		self.branches
			.lock()
			.unwrap()
			.get(&branch_id)
			.cloned()
			.ok_or(Error::Absent)
	}

	/// Builds the active-first ancestry chain for `branch_id`.
	fn chain(&self, branch_id: u64) -> Result<Vec<Arc<BranchCtx>>> {
		let branches = self.branches.lock().unwrap();
		let mut out = Vec::new();
		let mut cur = branches.get(&branch_id).cloned().ok_or(Error::Absent)?;
		loop {
			let parent_id = cur.parent_id;
			out.push(cur.clone());
			if parent_id == 0 {
				break;
			}
			cur = branches.get(&parent_id).cloned().ok_or(Error::Absent)?;
		}
		Ok(out)
	}

	/// Creates a new branch as a child of `parent_id`, carving a fixed slice
	/// of the delta region for its own log. Returns the new branch id.
	pub fn create_branch(&self, parent_id: u64, name: &str) -> Result<u64> {
		if !self.branches.lock().unwrap().contains_key(&parent_id) {
			return Err(Error::Absent);
		}
		let offset = self.branch_alloc.alloc(self.branch_log_capacity as usize)?;

		let mut sb = self.sb.lock().unwrap();
		let branch_id = sb.next_branch_id;
		sb.next_branch_id += 1;

		let mut branches = self.branches.lock().unwrap();
		let slot = self.find_free_slot(&sb)?;

		let ctx = Arc::new(BranchCtx::new(branch_id, parent_id, name.to_string(), offset, self.branch_log_capacity, 0, 1));
		let rec = BranchRecord {
			branch_id,
			parent_id,
			delta_log_offset: offset,
			delta_log_size: 0,
			delta_log_capacity: self.branch_log_capacity,
			state: BranchState::Active,
			refcount: 0,
			next_local_ino: 1,
			name: name.to_string(),
		};
		let mut rec_buf = vec![0u8; BRANCH_RECORD_SIZE];
		rec.encode(&mut rec_buf);
		let table_offset = sb.branch_table_offset + (slot * BRANCH_RECORD_SIZE) as u64;
		self.region.write_at(table_offset, &rec_buf)?;

		sb.branch_table_active_count += 1;
		let mut sb_buf = vec![0u8; SUPERBLOCK_SIZE];
		sb.encode(&mut sb_buf);
		self.region.write_at(0, &sb_buf)?;

		self.adjust_refcount_locked(&sb, parent_id, 1)?;
		branches.insert(branch_id, ctx);
		info!("created branch '{name}' (id {branch_id}) off parent {parent_id}");
		Ok(branch_id)
	}

	/// Merges `branch_id`'s log into its parent's and marks it committed.
	/// An empty child log is a short-circuit with nothing to copy. Fails
	/// with `OutOfSpace` if the parent's own log has no room left — the
	/// child's log and its state are left untouched in that case, so a
	/// retry after growing the parent (or aborting something else) is safe.
	pub fn commit_branch(&self, branch_id: u64) -> Result<()> {
		let child = self.branch(branch_id)?;
		let parent_id = child.parent_id;
		if parent_id == 0 {
			return Err(Error::Unsupported);
		}
		let parent = self.branch(parent_id)?;
		self.reject_if_has_active_children(branch_id)?;

		let used = child.used();
		if used > 0 {
			let bytes = self.region.read_at(child.delta_log_offset, used as usize)?;
			let write_offset = parent.alloc.alloc(bytes.len())?;
			self.region.write_at(write_offset, &bytes)?;
			parent.build_index(&self.region)?;
		}

		self.set_branch_state(branch_id, BranchState::Committed)?;
		{
			let sb = self.sb.lock().unwrap();
			self.adjust_refcount_locked(&sb, parent_id, -1)?;
		}
		self.branches.lock().unwrap().remove(&branch_id);
		info!("committed branch {branch_id} into parent {parent_id} ({used} bytes)");
		Ok(())
	}

	/// Discards `branch_id` without merging it. Log bytes are never
	/// reclaimed; only the table entry and in-memory context go away.
	pub fn abort_branch(&self, branch_id: u64) -> Result<()> {
		let child = self.branch(branch_id)?;
		let parent_id = child.parent_id;
		self.reject_if_has_active_children(branch_id)?;
		child.destroy();
		self.set_branch_state(branch_id, BranchState::Aborted)?;
		if parent_id != 0 {
			let sb = self.sb.lock().unwrap();
			self.adjust_refcount_locked(&sb, parent_id, -1)?;
		}
		self.branches.lock().unwrap().remove(&branch_id);
		warn!("aborted branch {branch_id}");
		Ok(())
	}

	/// A branch whose own refcount is still positive has active children (or
	/// mounts) depending on it; committing or aborting it would orphan them.
	fn reject_if_has_active_children(&self, branch_id: u64) -> Result<()> {
		let sb = self.sb.lock().unwrap();
		let slot = self.find_slot_locked(&sb, branch_id)?;
		let rec = self.read_record_locked(&sb, slot)?;
		if rec.refcount > 0 {
			return Err(Error::Unsupported);
		}
		Ok(())
	}

	/// Scans the on-storage branch table for the first slot in `Free` state.
	fn find_free_slot(&self, sb: &Superblock) -> Result<usize> {
		for i in 0..MAX_BRANCHES {
			let offset = sb.branch_table_offset + (i * BRANCH_RECORD_SIZE) as u64;
			let buf = self.region.read_at(offset, BRANCH_RECORD_SIZE)?;
			let rec = BranchRecord::decode(&buf)?;
			if rec.state == BranchState::Free {
				return Ok(i);
			}
		}
		Err(Error::OutOfSpace)
	}

	/// Scans the on-storage branch table for `branch_id`'s slot. Takes an
	/// already-locked superblock so callers that need to read-modify-write a
	/// record alongside other superblock-guarded state don't deadlock on
	/// `self.sb`.
	fn find_slot_locked(&self, sb: &Superblock, branch_id: u64) -> Result<usize> {
		for i in 0..MAX_BRANCHES {
			let offset = sb.branch_table_offset + (i * BRANCH_RECORD_SIZE) as u64;
			let buf = self.region.read_at(offset, BRANCH_RECORD_SIZE)?;
			let rec = BranchRecord::decode(&buf)?;
			if rec.branch_id == branch_id && rec.state != BranchState::Free {
				return Ok(i);
			}
		}
		Err(Error::Absent)
	}

	fn read_record_locked(&self, sb: &Superblock, slot: usize) -> Result<BranchRecord> {
		let offset = sb.branch_table_offset + (slot * BRANCH_RECORD_SIZE) as u64;
		let buf = self.region.read_at(offset, BRANCH_RECORD_SIZE)?;
		BranchRecord::decode(&buf)
	}

	fn write_record_locked(&self, sb: &Superblock, slot: usize, rec: &BranchRecord) -> Result<()> {
		let offset = sb.branch_table_offset + (slot * BRANCH_RECORD_SIZE) as u64;
		let mut buf = vec![0u8; BRANCH_RECORD_SIZE];
		rec.encode(&mut buf);
		self.region.write_at(offset, &buf)
	}

	fn set_branch_state(&self, branch_id: u64, state: BranchState) -> Result<()> {
		let sb = self.sb.lock().unwrap();
		let slot = self.find_slot_locked(&sb, branch_id)?;
		let mut rec = self.read_record_locked(&sb, slot)?;
		rec.state = state;
		self.write_record_locked(&sb, slot, &rec)
	}

	/// Adds `delta` to `branch_id`'s on-disk refcount (children + active
	/// mounts of that branch), saturating at zero. Returns the new value.
	fn adjust_refcount_locked(&self, sb: &Superblock, branch_id: u64, delta: i64) -> Result<u32> {
		let slot = self.find_slot_locked(sb, branch_id)?;
		let mut rec = self.read_record_locked(sb, slot)?;
		rec.refcount = (rec.refcount as i64 + delta).max(0) as u32;
		self.write_record_locked(sb, slot, &rec)?;
		Ok(rec.refcount)
	}

	/// Persists `next_local_ino` into `branch_id`'s on-disk table slot, so a
	/// later `mount` resumes branch-local inode allocation past every id this
	/// branch has already issued instead of reusing them.
	fn persist_branch_counter(&self, branch_id: u64, next_local_ino: u64) -> Result<()> {
		let sb = self.sb.lock().unwrap();
		let slot = self.find_slot_locked(&sb, branch_id)?;
		let mut rec = self.read_record_locked(&sb, slot)?;
		rec.next_local_ino = next_local_ino;
		self.write_record_locked(&sb, slot, &rec)
	}

	/// Advances the superblock's global inode-id high-water mark if `ino`
	/// exceeds it. Every CREATE/MKDIR calls this regardless of which branch
	/// issued the id, since ids are globally unique across the whole image.
	fn bump_next_inode_id(&self, ino: u64) -> Result<()> {
		let mut sb = self.sb.lock().unwrap();
		if ino >= sb.next_inode_id {
			sb.next_inode_id = ino + 1;
			let mut buf = vec![0u8; SUPERBLOCK_SIZE];
			sb.encode(&mut buf);
			self.region.write_at(0, &buf)?;
		}
		Ok(())
	}

	pub fn lookup(&self, branch_id: u64, parent_ino: u64, name: &str) -> Result<Option<u64>> {
		let chain = self.chain(branch_id)?;
		let refs: Vec<&BranchCtx> = chain.iter().map(|a| a.as_ref()).collect();
		resolver::name_exists(&refs, self.base.as_ref(), &self.region, parent_ino, name)
	}

	pub fn getattr(&self, branch_id: u64, ino: u64) -> Result<InodeAttr> {
		let chain = self.chain(branch_id)?;
		let refs: Vec<&BranchCtx> = chain.iter().map(|a| a.as_ref()).collect();
		resolver::resolve_inode(&refs, self.base.as_ref(), &self.region, ino)
	}

	pub fn read(&self, branch_id: u64, ino: u64, pos: u64, len: usize) -> Result<Vec<u8>> {
		let chain = self.chain(branch_id)?;
		let refs: Vec<&BranchCtx> = chain.iter().map(|a| a.as_ref()).collect();
		Ok(
			resolver::resolve_file_data(&refs, self.base.as_ref(), &self.region, ino, pos, len)?
				.unwrap_or_default(),
		)
	}

	pub fn create(&self, branch_id: u64, parent_ino: u64, name: &str, mode: u32, timestamp_ns: u64) -> Result<u64> {
		let branch = self.branch(branch_id)?;
		let chain = self.chain(branch_id)?;
		let refs: Vec<&BranchCtx> = chain.iter().map(|a| a.as_ref()).collect();
		let ino = mutator::create(&branch, &refs, self.base.as_ref(), &self.region, parent_ino, name, mode, timestamp_ns)?;
		self.bump_next_inode_id(ino)?;
		self.persist_branch_counter(branch_id, branch.next_local_ino())?;
		Ok(ino)
	}

	pub fn mkdir(&self, branch_id: u64, parent_ino: u64, name: &str, mode: u32, timestamp_ns: u64) -> Result<u64> {
		let branch = self.branch(branch_id)?;
		let chain = self.chain(branch_id)?;
		let refs: Vec<&BranchCtx> = chain.iter().map(|a| a.as_ref()).collect();
		let ino = mutator::mkdir(&branch, &refs, self.base.as_ref(), &self.region, parent_ino, name, mode, timestamp_ns)?;
		self.bump_next_inode_id(ino)?;
		self.persist_branch_counter(branch_id, branch.next_local_ino())?;
		Ok(ino)
	}

	pub fn unlink(&self, branch_id: u64, parent_ino: u64, name: &str, timestamp_ns: u64) -> Result<()> {
		let branch = self.branch(branch_id)?;
		let chain = self.chain(branch_id)?;
		let refs: Vec<&BranchCtx> = chain.iter().map(|a| a.as_ref()).collect();
		mutator::unlink(&branch, &refs, self.base.as_ref(), &self.region, parent_ino, name, timestamp_ns)
	}

	pub fn rmdir(&self, branch_id: u64, parent_ino: u64, name: &str, timestamp_ns: u64) -> Result<()> {
		let branch = self.branch(branch_id)?;
		let chain = self.chain(branch_id)?;
		let refs: Vec<&BranchCtx> = chain.iter().map(|a| a.as_ref()).collect();
		mutator::rmdir(&branch, &refs, self.base.as_ref(), &self.region, parent_ino, name, timestamp_ns)
	}

	pub fn rename(
		&self,
		branch_id: u64,
		old_parent: u64,
		old_name: &str,
		new_parent: u64,
		new_name: &str,
		timestamp_ns: u64,
	) -> Result<()> {
		let branch = self.branch(branch_id)?;
		let chain = self.chain(branch_id)?;
		let refs: Vec<&BranchCtx> = chain.iter().map(|a| a.as_ref()).collect();
		mutator::rename(&branch, &refs, self.base.as_ref(), &self.region, old_parent, old_name, new_parent, new_name, timestamp_ns)
	}

	pub fn write(&self, branch_id: u64, ino: u64, pos: u64, data: &[u8], timestamp_ns: u64) -> Result<()> {
		let branch = self.branch(branch_id)?;
		mutator::write(&branch, &self.region, ino, pos, data, timestamp_ns)
	}

	pub fn truncate(&self, branch_id: u64, ino: u64, new_size: u64, timestamp_ns: u64) -> Result<()> {
		let branch = self.branch(branch_id)?;
		mutator::truncate(&branch, &self.region, ino, new_size, timestamp_ns)
	}

	pub fn setattr(
		&self,
		branch_id: u64,
		ino: u64,
		mode: Option<u32>,
		uid: Option<u32>,
		gid: Option<u32>,
		timestamp_ns: u64,
	) -> Result<()> {
		let branch = self.branch(branch_id)?;
		mutator::setattr(&branch, &self.region, ino, mode, uid, gid, timestamp_ns)
	}

	/// Lists the live children of `dir_ino` as seen from `branch_id`. Walks
	/// the chain active-first, taking each branch's first opinion on every
	/// `(parent, name)` pair it has ever touched (live or tombstoned) before
	/// any ancestor gets a say, then fills in any base-image child whose
	/// name no branch in the chain has an opinion on at all.
	pub fn readdir(&self, branch_id: u64, dir_ino: u64) -> Result<Vec<DirEntry>> {
		let chain = self.chain(branch_id)?;
		let refs: Vec<&BranchCtx> = chain.iter().map(|a| a.as_ref()).collect();
		let parent_ino = if dir_ino == ROOT_INO {
			ROOT_INO
		} else {
			resolver::resolve_parent(&refs, self.base.as_ref(), &self.region, dir_ino)?
		};

		let mut seen: HashMap<String, Option<u64>> = HashMap::new();
		for branch in &chain {
			for entry in branch.dirents_for_parent(dir_ino) {
				seen.entry(entry.name.clone())
					.or_insert(if entry.deleted { None } else { Some(entry.ino) });
			}
		}

		let mut out = vec![
			DirEntry {
				name: ".".to_string(),
				ino: dir_ino,
			},
			DirEntry {
				name: "..".to_string(),
				ino: parent_ino,
			},
		];

		out.extend(
			seen.into_iter()
				.filter_map(|(name, ino)| ino.map(|ino| DirEntry { name, ino })),
		);

		if let Some(base) = &self.base {
			for child in base.children(&self.region, dir_ino)? {
				let name = base.name(&self.region, &child)?;
				if !out.iter().any(|e| e.name == name) {
					out.push(DirEntry {
						name,
						ino: child.ino as u64,
					});
				}
			}
		}

		Ok(out)
	}
}
