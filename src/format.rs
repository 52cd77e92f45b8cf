//! On-storage structures: superblock, branch table, delta-entry records and
//! the embedded base image. Every multi-byte integer is little-endian on
//! storage regardless of host endianness, so each type below carries its own
//! explicit `encode`/`decode` rather than being reinterpreted in place.

use crate::error::{Error, Result};

pub const MAGIC: u32 = 0x6461_7832; // "dax2"
pub const VERSION: u32 = 2;
pub const BLOCK_SIZE: u32 = 4096;
pub const SUPERBLOCK_SIZE: usize = 4096;
pub const BRANCH_RECORD_SIZE: usize = 128;
pub const BRANCH_NAME_MAX: usize = 31;
pub const MAX_BRANCHES: usize = 256;
pub const DELTA_HEADER_SIZE: usize = 24;
pub const ROOT_INO: u64 = 1;

pub const BASE_MAGIC: u32 = 0x6464_6178; // "ddax"
pub const BASE_VERSION: u32 = 1;
pub const BASE_SUPERBLOCK_SIZE: usize = 4096;
pub const BASE_INODE_SIZE: usize = 64;

/// Branch lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
	Free,
	Active,
	Committed,
	Aborted,
}

impl BranchState {
	fn from_u32(v: u32) -> Result<Self> {
		match v {
			0 => Ok(Self::Free),
			1 => Ok(Self::Active),
			2 => Ok(Self::Committed),
			3 => Ok(Self::Aborted),
			_ => Err(Error::InvalidFormat),
		}
	}

	fn as_u32(self) -> u32 {
		match self {
			Self::Free => 0,
			Self::Active => 1,
			Self::Committed => 2,
			Self::Aborted => 3,
		}
	}
}

/// Delta entry type tags, matching the on-storage `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaType {
	Write,
	Create,
	Delete,
	Truncate,
	Mkdir,
	Rename,
	Setattr,
}

impl DeltaType {
	fn from_u32(v: u32) -> Result<Self> {
		match v {
			1 => Ok(Self::Write),
			2 => Ok(Self::Create),
			3 => Ok(Self::Delete),
			4 => Ok(Self::Truncate),
			5 => Ok(Self::Mkdir),
			6 => Ok(Self::Rename),
			7 => Ok(Self::Setattr),
			_ => Err(Error::InvalidFormat),
		}
	}

	fn as_u32(self) -> u32 {
		match self {
			Self::Write => 1,
			Self::Create => 2,
			Self::Delete => 3,
			Self::Truncate => 4,
			Self::Mkdir => 5,
			Self::Rename => 6,
			Self::Setattr => 7,
		}
	}
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
	u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
	buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
	u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
	buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(buf: &[u8], off: usize) -> u16 {
	u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
	buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

/// The filesystem's top-level superblock, at offset 0, padded to
/// [`SUPERBLOCK_SIZE`].
#[derive(Debug, Clone)]
pub struct Superblock {
	pub flags: u32,
	pub region_size: u64,
	pub base_offset: u64,
	pub base_size: u64,
	pub branch_table_offset: u64,
	pub branch_table_active_count: u32,
	pub next_branch_id: u64,
	pub next_inode_id: u64,
	pub delta_region_offset: u64,
	pub delta_region_size: u64,
	pub delta_alloc_offset: u64,
}

impl Superblock {
	pub fn decode(buf: &[u8]) -> Result<Self> {
		if buf.len() < SUPERBLOCK_SIZE {
			return Err(Error::InvalidFormat);
		}
		if get_u32(buf, 0) != MAGIC {
			return Err(Error::InvalidFormat);
		}
		if get_u32(buf, 4) != VERSION {
			return Err(Error::InvalidFormat);
		}
		if get_u32(buf, 12) != BLOCK_SIZE {
			return Err(Error::InvalidFormat);
		}
		Ok(Self {
			flags: get_u32(buf, 8),
			region_size: get_u64(buf, 16),
			base_offset: get_u64(buf, 24),
			base_size: get_u64(buf, 32),
			branch_table_offset: get_u64(buf, 40),
			branch_table_active_count: get_u32(buf, 52),
			next_branch_id: get_u64(buf, 56),
			next_inode_id: get_u64(buf, 64),
			delta_region_offset: get_u64(buf, 72),
			delta_region_size: get_u64(buf, 80),
			delta_alloc_offset: get_u64(buf, 88),
		})
	}

	pub fn encode(&self, buf: &mut [u8]) {
		debug_assert!(buf.len() >= SUPERBLOCK_SIZE);
		buf[..SUPERBLOCK_SIZE].fill(0);
		put_u32(buf, 0, MAGIC);
		put_u32(buf, 4, VERSION);
		put_u32(buf, 8, self.flags);
		put_u32(buf, 12, BLOCK_SIZE);
		put_u64(buf, 16, self.region_size);
		put_u64(buf, 24, self.base_offset);
		put_u64(buf, 32, self.base_size);
		put_u64(buf, 40, self.branch_table_offset);
		put_u32(buf, 48, MAX_BRANCHES as u32);
		put_u32(buf, 52, self.branch_table_active_count);
		put_u64(buf, 56, self.next_branch_id);
		put_u64(buf, 64, self.next_inode_id);
		put_u64(buf, 72, self.delta_region_offset);
		put_u64(buf, 80, self.delta_region_size);
		put_u64(buf, 88, self.delta_alloc_offset);
	}
}

/// A single branch table entry, 128 bytes on storage.
#[derive(Debug, Clone)]
pub struct BranchRecord {
	pub branch_id: u64,
	pub parent_id: u64,
	pub delta_log_offset: u64,
	pub delta_log_size: u64,
	pub delta_log_capacity: u64,
	pub state: BranchState,
	pub refcount: u32,
	pub next_local_ino: u64,
	pub name: String,
}

impl BranchRecord {
	pub fn decode(buf: &[u8]) -> Result<Self> {
		if buf.len() < BRANCH_RECORD_SIZE {
			return Err(Error::InvalidFormat);
		}
		let name_bytes = &buf[48..48 + 32];
		let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(32);
		let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
		Ok(Self {
			branch_id: get_u64(buf, 0),
			parent_id: get_u64(buf, 8),
			delta_log_offset: get_u64(buf, 16),
			delta_log_size: get_u64(buf, 24),
			delta_log_capacity: get_u64(buf, 32),
			state: BranchState::from_u32(get_u32(buf, 40))?,
			refcount: get_u32(buf, 44),
			next_local_ino: get_u64(buf, 48 + 32),
			name,
		})
	}

	pub fn encode(&self, buf: &mut [u8]) {
		debug_assert!(buf.len() >= BRANCH_RECORD_SIZE);
		buf[..BRANCH_RECORD_SIZE].fill(0);
		put_u64(buf, 0, self.branch_id);
		put_u64(buf, 8, self.parent_id);
		put_u64(buf, 16, self.delta_log_offset);
		put_u64(buf, 24, self.delta_log_size);
		put_u64(buf, 32, self.delta_log_capacity);
		put_u32(buf, 40, self.state.as_u32());
		put_u32(buf, 44, self.refcount);
		let name_bytes = self.name.as_bytes();
		let n = name_bytes.len().min(BRANCH_NAME_MAX);
		buf[48..48 + n].copy_from_slice(&name_bytes[..n]);
		put_u64(buf, 48 + 32, self.next_local_ino);
	}
}

/// Fixed 24-byte delta-log entry header.
#[derive(Debug, Clone, Copy)]
pub struct DeltaHeader {
	pub ty: DeltaType,
	pub total_size: u32,
	pub ino: u64,
	pub timestamp_ns: u64,
}

impl DeltaHeader {
	/// Decodes only the header; returns `None` (scan-termination rule) if
	/// `total_size == 0`, which marks the unallocated tail of the log.
	pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
		if buf.len() < DELTA_HEADER_SIZE {
			return Err(Error::InvalidFormat);
		}
		let total_size = get_u32(buf, 4);
		if total_size == 0 {
			return Ok(None);
		}
		let ty = DeltaType::from_u32(get_u32(buf, 0))?;
		Ok(Some(Self {
			ty,
			total_size,
			ino: get_u64(buf, 8),
			timestamp_ns: get_u64(buf, 16),
		}))
	}

	pub fn encode(&self, buf: &mut [u8]) {
		debug_assert!(buf.len() >= DELTA_HEADER_SIZE);
		put_u32(buf, 0, self.ty.as_u32());
		put_u32(buf, 4, self.total_size);
		put_u64(buf, 8, self.ino);
		put_u64(buf, 16, self.timestamp_ns);
	}
}

pub const WRITE_RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct WriteRecord {
	pub offset: u64,
	pub len: u32,
	pub flags: u32,
}

impl WriteRecord {
	pub fn decode(buf: &[u8]) -> Self {
		Self {
			offset: get_u64(buf, 0),
			len: get_u32(buf, 8),
			flags: get_u32(buf, 12),
		}
	}

	pub fn encode(&self, buf: &mut [u8]) {
		put_u64(buf, 0, self.offset);
		put_u32(buf, 8, self.len);
		put_u32(buf, 12, self.flags);
	}
}

pub const CREATE_RECORD_SIZE: usize = 24;

#[derive(Debug, Clone, Copy)]
pub struct CreateRecord {
	pub parent_ino: u64,
	pub new_ino: u64,
	pub mode: u32,
	pub name_len: u16,
	pub flags: u16,
}

impl CreateRecord {
	pub fn decode(buf: &[u8]) -> Self {
		Self {
			parent_ino: get_u64(buf, 0),
			new_ino: get_u64(buf, 8),
			mode: get_u32(buf, 16),
			name_len: get_u16(buf, 20),
			flags: get_u16(buf, 22),
		}
	}

	pub fn encode(&self, buf: &mut [u8]) {
		put_u64(buf, 0, self.parent_ino);
		put_u64(buf, 8, self.new_ino);
		put_u32(buf, 16, self.mode);
		put_u16(buf, 20, self.name_len);
		put_u16(buf, 22, self.flags);
	}
}

pub const DELETE_RECORD_SIZE: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct DeleteRecord {
	pub parent_ino: u64,
	pub name_len: u16,
	pub flags: u16,
}

impl DeleteRecord {
	pub fn decode(buf: &[u8]) -> Self {
		Self {
			parent_ino: get_u64(buf, 0),
			name_len: get_u16(buf, 8),
			flags: get_u16(buf, 10),
		}
	}

	pub fn encode(&self, buf: &mut [u8]) {
		buf[..DELETE_RECORD_SIZE].fill(0);
		put_u64(buf, 0, self.parent_ino);
		put_u16(buf, 8, self.name_len);
		put_u16(buf, 10, self.flags);
	}
}

pub const TRUNCATE_RECORD_SIZE: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct TruncateRecord {
	pub new_size: u64,
}

impl TruncateRecord {
	pub fn decode(buf: &[u8]) -> Self {
		Self {
			new_size: get_u64(buf, 0),
		}
	}

	pub fn encode(&self, buf: &mut [u8]) {
		put_u64(buf, 0, self.new_size);
	}
}

pub const RENAME_RECORD_SIZE: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct RenameRecord {
	pub old_parent_ino: u64,
	pub new_parent_ino: u64,
	pub ino: u64,
	pub old_name_len: u16,
	pub new_name_len: u16,
}

impl RenameRecord {
	pub fn decode(buf: &[u8]) -> Self {
		Self {
			old_parent_ino: get_u64(buf, 0),
			new_parent_ino: get_u64(buf, 8),
			ino: get_u64(buf, 16),
			old_name_len: get_u16(buf, 24),
			new_name_len: get_u16(buf, 26),
		}
	}

	pub fn encode(&self, buf: &mut [u8]) {
		buf[..RENAME_RECORD_SIZE].fill(0);
		put_u64(buf, 0, self.old_parent_ino);
		put_u64(buf, 8, self.new_parent_ino);
		put_u64(buf, 16, self.ino);
		put_u16(buf, 24, self.old_name_len);
		put_u16(buf, 26, self.new_name_len);
	}
}

pub const SETATTR_RECORD_SIZE: usize = 24;

pub const ATTR_MODE: u32 = 1 << 0;
pub const ATTR_UID: u32 = 1 << 1;
pub const ATTR_GID: u32 = 1 << 2;
pub const ATTR_SIZE: u32 = 1 << 3;

#[derive(Debug, Clone, Copy)]
pub struct SetattrRecord {
	pub mode: u32,
	pub uid: u32,
	pub gid: u32,
	pub valid: u32,
	pub size: u64,
}

impl SetattrRecord {
	pub fn decode(buf: &[u8]) -> Self {
		Self {
			mode: get_u32(buf, 0),
			uid: get_u32(buf, 4),
			gid: get_u32(buf, 8),
			valid: get_u32(buf, 12),
			size: get_u64(buf, 16),
		}
	}

	pub fn encode(&self, buf: &mut [u8]) {
		put_u32(buf, 0, self.mode);
		put_u32(buf, 4, self.uid);
		put_u32(buf, 8, self.gid);
		put_u32(buf, 12, self.valid);
		put_u64(buf, 16, self.size);
	}
}

/// The base image's own superblock, `"ddax"` magic.
#[derive(Debug, Clone)]
pub struct BaseSuperblock {
	pub total_size: u64,
	pub inode_offset: u64,
	pub inode_count: u32,
	pub root_inode: u32,
	pub strtab_offset: u64,
	pub strtab_size: u64,
	pub data_offset: u64,
}

impl BaseSuperblock {
	pub fn decode(buf: &[u8]) -> Result<Self> {
		if buf.len() < BASE_SUPERBLOCK_SIZE {
			return Err(Error::InvalidFormat);
		}
		if get_u32(buf, 0) != BASE_MAGIC {
			return Err(Error::InvalidFormat);
		}
		Ok(Self {
			total_size: get_u64(buf, 16),
			inode_offset: get_u64(buf, 24),
			inode_count: get_u32(buf, 32),
			root_inode: get_u32(buf, 36),
			strtab_offset: get_u64(buf, 40),
			strtab_size: get_u64(buf, 48),
			data_offset: get_u64(buf, 56),
		})
	}

	pub fn encode(&self, buf: &mut [u8]) {
		debug_assert!(buf.len() >= BASE_SUPERBLOCK_SIZE);
		buf[..BASE_SUPERBLOCK_SIZE].fill(0);
		put_u32(buf, 0, BASE_MAGIC);
		put_u32(buf, 4, BASE_VERSION);
		put_u32(buf, 12, BLOCK_SIZE);
		put_u64(buf, 16, self.total_size);
		put_u64(buf, 24, self.inode_offset);
		put_u32(buf, 32, self.inode_count);
		put_u32(buf, 36, self.root_inode);
		put_u64(buf, 40, self.strtab_offset);
		put_u64(buf, 48, self.strtab_size);
		put_u64(buf, 56, self.data_offset);
	}
}

/// A fixed-size entry in the base image's inode array.
#[derive(Debug, Clone, Copy)]
pub struct BaseInode {
	pub ino: u32,
	pub mode: u32,
	pub uid: u32,
	pub gid: u32,
	pub size: u64,
	pub data_offset: u64,
	pub name_offset: u32,
	pub name_len: u32,
	pub parent_ino: u32,
	pub nlink: u32,
	pub first_child: u32,
	pub next_sibling: u32,
}

impl BaseInode {
	pub fn decode(buf: &[u8]) -> Self {
		Self {
			ino: get_u32(buf, 0),
			mode: get_u32(buf, 4),
			uid: get_u32(buf, 8),
			gid: get_u32(buf, 12),
			size: get_u64(buf, 16),
			data_offset: get_u64(buf, 24),
			name_offset: get_u32(buf, 32),
			name_len: get_u32(buf, 36),
			parent_ino: get_u32(buf, 40),
			nlink: get_u32(buf, 44),
			first_child: get_u32(buf, 48),
			next_sibling: get_u32(buf, 52),
		}
	}

	pub fn encode(&self, buf: &mut [u8]) {
		debug_assert!(buf.len() >= BASE_INODE_SIZE);
		buf[..BASE_INODE_SIZE].fill(0);
		put_u32(buf, 0, self.ino);
		put_u32(buf, 4, self.mode);
		put_u32(buf, 8, self.uid);
		put_u32(buf, 12, self.gid);
		put_u64(buf, 16, self.size);
		put_u64(buf, 24, self.data_offset);
		put_u32(buf, 32, self.name_offset);
		put_u32(buf, 36, self.name_len);
		put_u32(buf, 40, self.parent_ino);
		put_u32(buf, 44, self.nlink);
		put_u32(buf, 48, self.first_child);
		put_u32(buf, 52, self.next_sibling);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn superblock_round_trips() {
		let sb = Superblock {
			flags: 0,
			region_size: 1 << 20,
			base_offset: 0,
			base_size: 0,
			branch_table_offset: SUPERBLOCK_SIZE as u64,
			branch_table_active_count: 1,
			next_branch_id: 1,
			next_inode_id: 2,
			delta_region_offset: 1 << 16,
			delta_region_size: 1 << 19,
			delta_alloc_offset: 0,
		};
		let mut buf = vec![0u8; SUPERBLOCK_SIZE];
		sb.encode(&mut buf);
		let back = Superblock::decode(&buf).unwrap();
		assert_eq!(back.region_size, sb.region_size);
		assert_eq!(back.next_inode_id, sb.next_inode_id);
		assert_eq!(back.delta_region_size, sb.delta_region_size);
	}

	#[test]
	fn superblock_rejects_bad_magic() {
		let buf = vec![0u8; SUPERBLOCK_SIZE];
		assert_eq!(Superblock::decode(&buf).unwrap_err(), Error::InvalidFormat);
	}

	#[test]
	fn branch_record_round_trips_name() {
		let rec = BranchRecord {
			branch_id: 3,
			parent_id: 0,
			delta_log_offset: 1000,
			delta_log_size: 10,
			delta_log_capacity: 4096,
			state: BranchState::Active,
			refcount: 2,
			next_local_ino: 7,
			name: "work".to_string(),
		};
		let mut buf = vec![0u8; BRANCH_RECORD_SIZE];
		rec.encode(&mut buf);
		let back = BranchRecord::decode(&buf).unwrap();
		assert_eq!(back.name, "work");
		assert_eq!(back.state, BranchState::Active);
		assert_eq!(back.refcount, 2);
	}

	#[test]
	fn delta_header_zero_total_size_terminates_scan() {
		let buf = vec![0u8; DELTA_HEADER_SIZE];
		assert!(DeltaHeader::decode(&buf).unwrap().is_none());
	}

	#[test]
	fn base_inode_round_trips() {
		let inode = BaseInode {
			ino: 5,
			mode: 0o100644,
			uid: 0,
			gid: 0,
			size: 42,
			data_offset: 4096,
			name_offset: 0,
			name_len: 3,
			parent_ino: 1,
			nlink: 1,
			first_child: 0,
			next_sibling: 6,
		};
		let mut buf = vec![0u8; BASE_INODE_SIZE];
		inode.encode(&mut buf);
		let back = BaseInode::decode(&buf);
		assert_eq!(back.ino, 5);
		assert_eq!(back.size, 42);
		assert_eq!(back.next_sibling, 6);
	}
}
