//! Error taxonomy shared by every gateway component.

use std::io;
use thiserror::Error;

/// Result type used throughout the gateway core.
pub type Result<T> = std::result::Result<T, Error>;

/// Every fallible core operation resolves to one of these.
///
/// `NoData` is transient and retryable (no free driver worker, no reachable
/// peer); `Io` is not (truncated read, bad signature, crashed child).
#[derive(Debug, Clone, Error)]
pub enum Error {
	/// The entry does not exist.
	#[error("not found")]
	NotFound,
	/// The entry already exists and may not be overwritten.
	#[error("already exists")]
	AlreadyExists,
	/// The caller is not allowed to perform this operation.
	#[error("permission denied")]
	PermissionDenied,
	/// This gateway is not the coordinator for the file.
	#[error("not the coordinator")]
	NotCoordinator,
	/// The caller's view of the file is out of date and must be refreshed.
	#[error("stale")]
	Stale,
	/// A conflicting operation is in flight on the same path.
	#[error("busy")]
	Busy,
	/// The request is malformed.
	#[error("invalid argument: {0}")]
	InvalidArgument(String),
	/// A storage driver reported a data-dependent failure.
	#[error("driver error: worker {pid} role {role} rc = {status}")]
	Driver {
		/// Pid of the child process that failed.
		pid: u32,
		/// Role the child was serving.
		role: &'static str,
		/// Status the child returned, or the local errno if it died.
		status: i64,
	},
	/// No worker or peer was available; try again later.
	#[error("no data available")]
	NoData,
	/// Non-transient I/O failure.
	#[error("I/O error: {0}")]
	Io(String),
	/// The current operation could not allocate memory.
	#[error("out of memory")]
	OutOfMemory,
	/// A peer spoke a message this gateway cannot understand.
	#[error("protocol mismatch: {0}")]
	ProtocolMismatch(String),
}

impl Error {
	/// POSIX errno for this error, as surfaced to the FUSE layer and to
	/// wire replies (negated there).
	pub fn errno(&self) -> i32 {
		match self {
			Error::NotFound => libc::ENOENT,
			Error::AlreadyExists => libc::EEXIST,
			Error::PermissionDenied => libc::EACCES,
			Error::NotCoordinator | Error::Stale => libc::EREMOTE,
			Error::Busy => libc::EBUSY,
			Error::InvalidArgument(_) => libc::EINVAL,
			Error::Driver { .. } | Error::Io(_) => libc::EIO,
			Error::NoData => libc::EAGAIN,
			Error::OutOfMemory => libc::ENOMEM,
			Error::ProtocolMismatch(_) => libc::EPROTO,
		}
	}

	/// Reconstructs an error from a wire reply's negated errno.
	pub fn from_errno(errno: i32) -> Error {
		match errno {
			libc::ENOENT => Error::NotFound,
			libc::EEXIST => Error::AlreadyExists,
			libc::EACCES => Error::PermissionDenied,
			libc::EREMOTE => Error::Stale,
			libc::EBUSY => Error::Busy,
			libc::EINVAL => Error::InvalidArgument("remote".to_owned()),
			libc::EAGAIN => Error::NoData,
			libc::ENOMEM => Error::OutOfMemory,
			libc::EPROTO => Error::ProtocolMismatch("remote".to_owned()),
			_ => Error::Io(format!("remote errno {}", errno)),
		}
	}

	/// Tells whether the caller may retry the operation without a state
	/// change on either side.
	pub fn is_transient(&self) -> bool {
		matches!(self, Error::NoData | Error::Busy)
	}
}

impl From<io::Error> for Error {
	fn from(err: io::Error) -> Error {
		match err.kind() {
			io::ErrorKind::NotFound => Error::NotFound,
			io::ErrorKind::AlreadyExists => Error::AlreadyExists,
			io::ErrorKind::PermissionDenied => Error::PermissionDenied,
			io::ErrorKind::OutOfMemory => Error::OutOfMemory,
			_ => Error::Io(err.to_string()),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn errno_round_trip() {
		let errs = [
			Error::NotFound,
			Error::AlreadyExists,
			Error::PermissionDenied,
			Error::Busy,
			Error::NoData,
			Error::OutOfMemory,
		];
		for e in errs {
			let back = Error::from_errno(e.errno());
			assert_eq!(back.errno(), e.errno());
		}
	}

	#[test]
	fn remote_errors_map_to_eremote() {
		assert_eq!(Error::NotCoordinator.errno(), libc::EREMOTE);
		assert_eq!(Error::Stale.errno(), libc::EREMOTE);
	}
}
