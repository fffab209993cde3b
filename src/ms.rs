//! Contract of the metadata service, as consumed by the gateway core.
//!
//! The MS itself and its transport live outside this crate; the core only
//! depends on this trait. `connect` is the seam a transport links into.

use crate::error::Error;
use crate::error::Result;
use crate::gateway::GatewayCert;
use crate::util::TimeSpec;
use serde::Deserialize;
use serde::Serialize;

/// Whether an exported inode is a file or a directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
	/// Regular file.
	File,
	/// Directory.
	Dir,
}

/// An inode as exported by the metadata service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MdEntry {
	/// File or directory.
	pub entry_type: EntryType,
	/// Name within the parent directory.
	pub name: String,
	/// File identifier.
	pub file_id: u64,
	/// File version; advances on every reversion event.
	pub version: i64,
	/// Owning user.
	pub owner: u64,
	/// Coordinator gateway.
	pub coordinator: u64,
	/// Volume the entry belongs to.
	pub volume: u64,
	/// POSIX permission bits.
	pub mode: u32,
	/// Size in bytes.
	pub size: u64,
	/// Creation time.
	pub ctime: TimeSpec,
	/// Modification time.
	pub mtime: TimeSpec,
	/// Manifest modification time; advances on every write that
	/// replaces blocks.
	pub manifest_mtime: TimeSpec,
	/// Advances on any data or metadata mutation.
	pub write_nonce: i64,
	/// Advances on any xattr mutation.
	pub xattr_nonce: i64,
	/// Sequence number among the parent's children.
	pub generation: i64,
	/// Number of children (directories).
	pub num_children: u64,
	/// Parent file id.
	pub parent_id: u64,
	/// Read-freshness TTL hint, in milliseconds.
	pub max_read_freshness: i64,
	/// Write-freshness TTL hint, in milliseconds.
	pub max_write_freshness: i64,
}

/// The MS's answer for one queried path.
#[derive(Clone, Debug)]
pub enum MsListing {
	/// The entry exists; current metadata attached.
	Entry(MdEntry),
	/// The entry does not exist anymore.
	None,
	/// The entry has not changed since the caller's write nonce.
	NotChanged,
}

/// One head entry of the MS vacuum log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VacuumLogEntry {
	/// Volume of the written file.
	pub volume_id: u64,
	/// Gateway that performed the write.
	pub writer_id: u64,
	/// File identifier.
	pub file_id: u64,
	/// File version the write belonged to.
	pub file_version: i64,
	/// Manifest modtime the write superseded.
	pub manifest_mtime: TimeSpec,
	/// Blocks replaced by the write.
	pub affected_blocks: Vec<u64>,
}

/// Operations the gateway core requires of the metadata service.
///
/// The MS client holds its own internal lock; calls may block on the
/// network and must be safe to issue from any thread.
pub trait MsClient: Send + Sync {
	/// Fetches current metadata for several cached paths at once.
	fn getattr_multi(&self, volume_id: u64, paths: &[String]) -> Result<Vec<MsListing>>;

	/// Fetches the chain of entries along `fs_path`, parent first.
	fn path_download(&self, volume_id: u64, fs_path: &str) -> Result<Vec<MdEntry>>;

	/// Full listing of a directory's children.
	fn listdir(&self, volume_id: u64, file_id: u64) -> Result<Vec<MdEntry>>;

	/// Children whose generation is at least `least_generation`.
	fn diffdir(&self, volume_id: u64, file_id: u64, least_generation: i64) -> Result<Vec<MdEntry>>;

	/// Publishes a new entry; returns it with MS-assigned fields filled.
	fn create(&self, entry: &MdEntry) -> Result<MdEntry>;

	/// Writes back changed metadata for an existing entry.
	fn update(&self, entry: &MdEntry) -> Result<()>;

	/// Removes an entry.
	fn delete(&self, entry: &MdEntry) -> Result<()>;

	/// Peeks the head of the vacuum log for a file.
	fn peek_vacuum_log(&self, volume_id: u64, file_id: u64) -> Result<Option<VacuumLogEntry>>;

	/// Pops the vacuum-log head the caller just peeked.
	///
	/// Popping an already-removed head succeeds (the pop is idempotent).
	fn remove_vacuum_log_entry(
		&self,
		writer_id: u64,
		file_id: u64,
		file_version: i64,
		manifest_mtime: TimeSpec,
	) -> Result<()>;

	/// Appends a vacuum-log entry for a completed write.
	fn append_vacuum_log(&self, entry: &VacuumLogEntry) -> Result<()>;

	/// Downloads the volume's gateway certs.
	fn cert_bundle(&self, volume_id: u64) -> Result<Vec<GatewayCert>>;
}

/// An MS client for anonymous, disconnected operation.
///
/// Serves an empty volume view and refuses mutations; lets a replica or
/// acquisition gateway come up without credentials.
pub struct NullMsClient;

impl MsClient for NullMsClient {
	fn getattr_multi(&self, _volume_id: u64, paths: &[String]) -> Result<Vec<MsListing>> {
		Ok(paths.iter().map(|_| MsListing::None).collect())
	}

	fn path_download(&self, _volume_id: u64, _fs_path: &str) -> Result<Vec<MdEntry>> {
		Err(Error::NotFound)
	}

	fn listdir(&self, _volume_id: u64, _file_id: u64) -> Result<Vec<MdEntry>> {
		Ok(Vec::new())
	}

	fn diffdir(&self, _volume_id: u64, _file_id: u64, _least_generation: i64) -> Result<Vec<MdEntry>> {
		Ok(Vec::new())
	}

	fn create(&self, _entry: &MdEntry) -> Result<MdEntry> {
		Err(Error::PermissionDenied)
	}

	fn update(&self, _entry: &MdEntry) -> Result<()> {
		Err(Error::PermissionDenied)
	}

	fn delete(&self, _entry: &MdEntry) -> Result<()> {
		Err(Error::PermissionDenied)
	}

	fn peek_vacuum_log(&self, _volume_id: u64, _file_id: u64) -> Result<Option<VacuumLogEntry>> {
		Ok(None)
	}

	fn remove_vacuum_log_entry(
		&self,
		_writer_id: u64,
		_file_id: u64,
		_file_version: i64,
		_manifest_mtime: TimeSpec,
	) -> Result<()> {
		Ok(())
	}

	fn append_vacuum_log(&self, _entry: &VacuumLogEntry) -> Result<()> {
		Err(Error::PermissionDenied)
	}

	fn cert_bundle(&self, _volume_id: u64) -> Result<Vec<GatewayCert>> {
		Ok(Vec::new())
	}
}

/// Opens an MS session for `url`.
///
/// The concrete network transport is linked in from outside the core;
/// this build knows the `null:` scheme used for anonymous operation.
pub fn connect(url: &str) -> Result<Box<dyn MsClient>> {
	match url.split(':').next() {
		Some("null") => Ok(Box::new(NullMsClient)),
		_ => Err(Error::InvalidArgument(format!(
			"no metadata-service transport for {}",
			url
		))),
	}
}
