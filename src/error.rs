//! Error kinds returned by every fallible operation in this crate.
//!
//! The set is fixed and enumerable by design: a host binds each variant to
//! whatever error convention it uses (errno, `io::Error`, ...) rather than
//! matching on a string or an opaque boxed error.

use thiserror::Error;

/// The crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;

/// An error raised by the filesystem core.
///
/// Each variant documents the errno a VFS-style host would surface it as;
/// this crate never depends on `errno` itself since it has no syscall
/// boundary of its own.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum Error {
	/// Magic or version mismatch while mounting a region or base image.
	///
	/// Surfaced by a host as `EINVAL`.
	#[error("invalid on-storage format")]
	InvalidFormat,

	/// The allocator or a branch's configured capacity was exceeded.
	///
	/// Surfaced by a host as `ENOSPC`.
	#[error("out of space")]
	OutOfSpace,

	/// Index-node allocation failed.
	///
	/// Surfaced by a host as `ENOMEM`.
	#[error("out of memory")]
	OutOfMemory,

	/// CREATE/MKDIR targeted a name that already resolves to a live inode.
	///
	/// Surfaced by a host as `EEXIST`.
	#[error("name already exists")]
	Exists,

	/// The resolver found no live entry for the requested inode or name.
	///
	/// Surfaced by a host as `ENOENT`.
	#[error("no such inode or entry")]
	Absent,

	/// A WRITE payload copy did not complete.
	///
	/// This core never produces this error itself (see `write`'s contract);
	/// the variant exists for a host that wraps us and performs its own
	/// copy-in from user memory.
	#[error("payload copy did not complete")]
	CopyFault,

	/// An operation outside the supported subset was requested: rename with
	/// overwrite, rmdir semantics beyond plain unlink, or unknown flags.
	///
	/// Surfaced by a host as `EINVAL` or `ENOTEMPTY` depending on call site.
	#[error("operation not supported")]
	Unsupported,
}
