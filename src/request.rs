//! The request descriptor dispatched to drivers and authorized at servers.

use crate::error::Error;
use crate::error::Result;
use crate::util::TimeSpec;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// What a request addresses: one block, or one manifest snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestTarget {
	/// A single block, by id and version.
	Block {
		/// Zero-based block index.
		block_id: u64,
		/// Version of that block.
		block_version: i64,
	},
	/// A manifest snapshot, by modification timestamp.
	Manifest {
		/// Modtime identifying the snapshot.
		timestamp: TimeSpec,
	},
}

/// Describes one core operation end-to-end.
///
/// This is the unit of dispatch into the driver worker pool and the unit
/// of authorization at the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestData {
	/// Path of the file within the volume.
	pub fs_path: String,
	/// File identifier.
	pub file_id: u64,
	/// File version the request addresses.
	pub file_version: i64,
	/// Gateway currently authoritative for the file.
	pub coordinator_id: u64,
	/// Volume the file belongs to.
	pub volume_id: u64,
	/// Gateway that originated the request.
	pub src_gateway_id: u64,
	/// User on whose behalf the request runs.
	pub user_id: u64,
	/// Block or manifest coordinates.
	pub target: RequestTarget,
}

impl RequestData {
	/// Builds a block request.
	#[allow(clippy::too_many_arguments)]
	pub fn block(
		fs_path: &str,
		file_id: u64,
		file_version: i64,
		coordinator_id: u64,
		volume_id: u64,
		src_gateway_id: u64,
		user_id: u64,
		block_id: u64,
		block_version: i64,
	) -> Self {
		Self {
			fs_path: fs_path.to_owned(),
			file_id,
			file_version,
			coordinator_id,
			volume_id,
			src_gateway_id,
			user_id,
			target: RequestTarget::Block {
				block_id,
				block_version,
			},
		}
	}

	/// Builds a manifest request.
	#[allow(clippy::too_many_arguments)]
	pub fn manifest(
		fs_path: &str,
		file_id: u64,
		file_version: i64,
		coordinator_id: u64,
		volume_id: u64,
		src_gateway_id: u64,
		user_id: u64,
		timestamp: TimeSpec,
	) -> Self {
		Self {
			fs_path: fs_path.to_owned(),
			file_id,
			file_version,
			coordinator_id,
			volume_id,
			src_gateway_id,
			user_id,
			target: RequestTarget::Manifest { timestamp },
		}
	}

	/// Tells whether this request addresses a manifest.
	pub fn is_manifest(&self) -> bool {
		matches!(self.target, RequestTarget::Manifest { .. })
	}

	/// Tells whether this request addresses a block.
	pub fn is_block(&self) -> bool {
		matches!(self.target, RequestTarget::Block { .. })
	}

	/// Block coordinates, or `InvalidArgument` if this is a manifest request.
	pub fn block_coords(&self) -> Result<(u64, i64)> {
		match self.target {
			RequestTarget::Block {
				block_id,
				block_version,
			} => Ok((block_id, block_version)),
			_ => Err(Error::InvalidArgument("expected a block request".to_owned())),
		}
	}

	/// Manifest timestamp, or `InvalidArgument` if this is a block request.
	pub fn manifest_timestamp(&self) -> Result<TimeSpec> {
		match self.target {
			RequestTarget::Manifest { timestamp } => Ok(timestamp),
			_ => Err(Error::InvalidArgument(
				"expected a manifest request".to_owned(),
			)),
		}
	}
}

impl fmt::Display for RequestData {
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.target {
			RequestTarget::Block {
				block_id,
				block_version,
			} => write!(
				fmt,
				"{:X}.{}[{}.{}]",
				self.file_id, self.file_version, block_id, block_version
			),
			RequestTarget::Manifest { timestamp } => write!(
				fmt,
				"{:X}.{}/manifest.{}",
				self.file_id, self.file_version, timestamp
			),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn target_accessors() {
		let b = RequestData::block("/f", 1, 2, 3, 4, 5, 6, 7, 8);
		assert!(b.is_block());
		assert_eq!(b.block_coords().unwrap(), (7, 8));
		assert!(b.manifest_timestamp().is_err());

		let m = RequestData::manifest("/f", 1, 2, 3, 4, 5, 6, TimeSpec::new(9, 10));
		assert!(m.is_manifest());
		assert_eq!(m.manifest_timestamp().unwrap(), TimeSpec::new(9, 10));
		assert!(m.block_coords().is_err());
	}
}
