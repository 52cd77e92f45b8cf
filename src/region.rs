//! The flat byte-addressable region a filesystem image lives in, and the
//! bump allocator that carves space out of its delta region.
//!
//! The crate never maps a dma-buf or a physical address range itself (out of
//! scope, per the host VFS boundary); it only ever sees bytes a host already
//! mapped and handed to us as a `Vec<u8>`. Access goes through one coarse
//! mutex rather than raw pointer arithmetic — trading zero-copy DAX access
//! for safe-Rust simplicity (see DESIGN.md).

use std::sync::Mutex;

use crate::error::{Error, Result};

/// A contiguous, caller-owned byte buffer standing in for a DAX or
/// shared-memory region.
pub struct Region {
	bytes: Mutex<Vec<u8>>,
	len: usize,
}

impl Region {
	/// Takes ownership of an already-sized buffer (e.g. a host's DAX mapping
	/// copied into process memory, or a `Vec<u8>` built by `mkfs`-style
	/// initialization).
	pub fn from_bytes(bytes: Vec<u8>) -> Self {
		let len = bytes.len();
		Self {
			bytes: Mutex::new(bytes),
			len,
		}
	}

	pub fn zeroed(size: usize) -> Self {
		Self::from_bytes(vec![0u8; size])
	}

	pub fn len(&self) -> usize {
		self.len
	}

	pub fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Copies out `len` bytes starting at `offset`.
	pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
		let start = usize::try_from(offset).map_err(|_| Error::InvalidFormat)?;
		let end = start.checked_add(len).ok_or(Error::InvalidFormat)?;
		let bytes = self.bytes.lock().unwrap();
		bytes
			.get(start..end)
			.map(|s| s.to_vec())
			.ok_or(Error::InvalidFormat)
	}

	/// Writes `data` starting at `offset`.
	pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
		let start = usize::try_from(offset).map_err(|_| Error::InvalidFormat)?;
		let end = start.checked_add(data.len()).ok_or(Error::InvalidFormat)?;
		let mut bytes = self.bytes.lock().unwrap();
		let dest = bytes.get_mut(start..end).ok_or(Error::InvalidFormat)?;
		dest.copy_from_slice(data);
		Ok(())
	}

	/// Cacheline/store-ordering flush hook. A no-op over an in-process
	/// buffer; a host backed by real persistent memory would override this
	/// boundary to flush before returning from a mutating call.
	pub fn sync(&self, _offset: u64, _len: usize) {}

	/// Snapshot of the whole region, used by tests and by `mount` to locate
	/// the superblock and branch table before any allocator is constructed.
	pub fn snapshot(&self) -> Vec<u8> {
		self.bytes.lock().unwrap().clone()
	}
}

/// A single-cursor bump allocator over one contiguous sub-range of a region
/// (the delta region, or a branch's own slice of it). Carves bytes forward;
/// never reclaims.
pub struct Allocator {
	base: u64,
	capacity: u64,
	cursor: Mutex<u64>,
}

impl Allocator {
	pub fn new(base: u64, capacity: u64, used: u64) -> Self {
		Self {
			base,
			capacity,
			cursor: Mutex::new(used),
		}
	}

	pub fn used(&self) -> u64 {
		*self.cursor.lock().unwrap()
	}

	pub fn capacity(&self) -> u64 {
		self.capacity
	}

	pub fn base(&self) -> u64 {
		self.base
	}

	/// Allocates `len` bytes, returning the absolute region offset assigned.
	/// The allocator's cursor only ever advances (property 6: bump
	/// monotonicity); a failed allocation leaves it untouched.
	pub fn alloc(&self, len: usize) -> Result<u64> {
		let len = len as u64;
		let mut cursor = self.cursor.lock().unwrap();
		let new_cursor = cursor.checked_add(len).ok_or(Error::OutOfSpace)?;
		if new_cursor > self.capacity {
			return Err(Error::OutOfSpace);
		}
		let offset = self.base + *cursor;
		*cursor = new_cursor;
		Ok(offset)
	}

	/// No-op: the delta region never reclaims space (documented non-goal).
	pub fn free(&self, _offset: u64, _len: usize) {}
}
