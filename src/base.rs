//! Read-only access to the embedded base image: the inode-indexed snapshot
//! that provides a branch chain's initial state.

use crate::error::{Error, Result};
use crate::format::{BaseInode, BaseSuperblock, BASE_INODE_SIZE, BASE_SUPERBLOCK_SIZE};
use crate::region::Region;

/// A parsed, read-only view of a base image embedded in a region at a fixed
/// offset. Every query re-reads from the region through `base_offset`.
pub struct BaseImage {
	base_offset: u64,
	sb: BaseSuperblock,
}

impl BaseImage {
	/// Parses the base image's own superblock out of `region` at `offset`.
	pub fn open(region: &Region, offset: u64) -> Result<Self> {
		let header = region.read_at(offset, BASE_SUPERBLOCK_SIZE)?;
		let sb = BaseSuperblock::decode(&header)?;
		Ok(Self {
			base_offset: offset,
			sb,
		})
	}

	pub fn root_inode(&self) -> u64 {
		self.sb.root_inode as u64
	}

	/// O(1): the base inode array is dense and 1-based.
	pub fn inode(&self, region: &Region, ino: u64) -> Result<BaseInode> {
		if ino == 0 || ino > self.sb.inode_count as u64 {
			return Err(Error::Absent);
		}
		let idx = (ino - 1) as usize;
		let offset = self.base_offset + self.sb.inode_offset + (idx * BASE_INODE_SIZE) as u64;
		let buf = region.read_at(offset, BASE_INODE_SIZE)?;
		Ok(BaseInode::decode(&buf))
	}

	pub fn name(&self, region: &Region, inode: &BaseInode) -> Result<String> {
		let offset = self.base_offset + self.sb.strtab_offset + inode.name_offset as u64;
		let buf = region.read_at(offset, inode.name_len as usize)?;
		String::from_utf8(buf).map_err(|_| Error::InvalidFormat)
	}

	/// Iterates a directory's children in `first_child`/`next_sibling` order.
	/// O(number of children).
	pub fn children(&self, region: &Region, dir_ino: u64) -> Result<Vec<BaseInode>> {
		let dir = self.inode(region, dir_ino)?;
		let mut out = Vec::new();
		let mut cur = dir.first_child;
		while cur != 0 {
			let child = self.inode(region, cur as u64)?;
			out.push(child);
			cur = child.next_sibling;
		}
		Ok(out)
	}

	/// Looks up a single named child of `dir_ino`, if any.
	pub fn lookup_child(&self, region: &Region, dir_ino: u64, name: &str) -> Result<Option<BaseInode>> {
		for child in self.children(region, dir_ino)? {
			if self.name(region, &child)? == name {
				return Ok(Some(child));
			}
		}
		Ok(None)
	}

	/// Returns a contiguous slice of file data for `ino` starting at `pos`,
	/// truncated to what is actually present; `None` if `pos` is at or past
	/// EOF.
	pub fn data_range(&self, region: &Region, ino: u64, pos: u64, len: usize) -> Result<Option<Vec<u8>>> {
		let inode = self.inode(region, ino)?;
		if pos >= inode.size {
			return Ok(None);
		}
		let avail = (inode.size - pos) as usize;
		let take = avail.min(len);
		let offset = self.base_offset + inode.data_offset + pos;
		Ok(Some(region.read_at(offset, take)?))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::format::BASE_MAGIC;

	fn build_image() -> Region {
		// superblock | 2 inodes | strtab ("dir\0a\0") | data ("hi")
		let inode_offset = BASE_SUPERBLOCK_SIZE as u64;
		let inode_count = 2u32;
		let strtab_offset = inode_offset + inode_count as u64 * BASE_INODE_SIZE as u64;
		let strtab = b"dir\0a\0";
		let data_offset = strtab_offset + strtab.len() as u64;
		let total_size = data_offset + 2;

		let mut buf = vec![0u8; total_size as usize];
		let sb = BaseSuperblock {
			total_size,
			inode_offset,
			inode_count,
			root_inode: 1,
			strtab_offset,
			strtab_size: strtab.len() as u64,
			data_offset,
		};
		sb.encode(&mut buf[..BASE_SUPERBLOCK_SIZE]);
		assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), BASE_MAGIC);

		let root = BaseInode {
			ino: 1,
			mode: 0o40755,
			uid: 0,
			gid: 0,
			size: 0,
			data_offset: 0,
			name_offset: 0,
			name_len: 3,
			parent_ino: 1,
			nlink: 2,
			first_child: 2,
			next_sibling: 0,
		};
		let file = BaseInode {
			ino: 2,
			mode: 0o100644,
			uid: 0,
			gid: 0,
			size: 2,
			data_offset,
			name_offset: 4,
			name_len: 1,
			parent_ino: 1,
			nlink: 1,
			first_child: 0,
			next_sibling: 0,
		};
		root.encode(&mut buf[inode_offset as usize..inode_offset as usize + BASE_INODE_SIZE]);
		file.encode(
			&mut buf[inode_offset as usize + BASE_INODE_SIZE
				..inode_offset as usize + 2 * BASE_INODE_SIZE],
		);
		buf[strtab_offset as usize..strtab_offset as usize + strtab.len()].copy_from_slice(strtab);
		buf[data_offset as usize..data_offset as usize + 2].copy_from_slice(b"hi");
		Region::from_bytes(buf)
	}

	#[test]
	fn reads_children_and_data() {
		let region = build_image();
		let base = BaseImage::open(&region, 0).unwrap();
		assert_eq!(base.root_inode(), 1);
		let children = base.children(&region, 1).unwrap();
		assert_eq!(children.len(), 1);
		assert_eq!(base.name(&region, &children[0]).unwrap(), "a");
		let data = base.data_range(&region, 2, 0, 10).unwrap().unwrap();
		assert_eq!(data, b"hi");
	}

	#[test]
	fn lookup_child_by_name() {
		let region = build_image();
		let base = BaseImage::open(&region, 0).unwrap();
		assert!(base.lookup_child(&region, 1, "a").unwrap().is_some());
		assert!(base.lookup_child(&region, 1, "missing").unwrap().is_none());
	}
}
