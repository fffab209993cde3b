//! On-disk chunk store and persisted upload metadata.
//!
//! Chunks live at `<root>/<fs_path>.<file_version>/<block_id>.<block_version>`
//! (manifests under `manifest.<sec>.<nsec>` in the same directory). The
//! tree is content-versioned and may be blown away at any time. Beside it,
//! an upload-metadata tree records the progress of in-flight writes; any
//! record that is not `Committed` and carries a session id other than the
//! current process's is a leftover of a crashed run and is reaped on
//! startup.

use crate::error::Error;
use crate::error::Result;
use crate::request::RequestData;
use crate::request::RequestTarget;
use crate::util::TimeSpec;
use crate::wire;
use log::debug;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use std::fs;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

/// Progress of one in-flight upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadProgress {
	/// The write began but has not been acknowledged durable.
	Started,
	/// The write is durable.
	Committed,
}

/// Persisted record of one chunk upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadMetadata {
	/// Path of the file within the volume.
	pub fs_path: String,
	/// File version written.
	pub file_version: i64,
	/// Block coordinates written.
	pub block_id: u64,
	/// Version of the block written.
	pub block_version: i64,
	/// How far the upload got.
	pub progress: UploadProgress,
	/// Session id of the writing process.
	pub session_id: i64,
	/// Seconds since the epoch at write time.
	pub write_time: i64,
}

/// Relative location of one chunk under a store root.
fn chunk_rel_path(fs_path: &str, file_version: i64, target: &RequestTarget) -> PathBuf {
	let dir = format!("{}.{}", fs_path.trim_start_matches('/'), file_version);
	let name = match target {
		RequestTarget::Block {
			block_id,
			block_version,
		} => format!("{}.{}", block_id, block_version),
		RequestTarget::Manifest { timestamp } => {
			format!("manifest.{}.{}", timestamp.sec, timestamp.nsec)
		}
	};
	PathBuf::from(dir).join(name)
}

/// A content-versioned chunk tree rooted at one directory.
pub struct ChunkStore {
	root: PathBuf,
}

impl ChunkStore {
	/// Opens (and creates) a store under `root`.
	pub fn open(root: &Path) -> Result<Self> {
		fs::create_dir_all(root)?;
		Ok(Self {
			root: root.to_owned(),
		})
	}

	fn path_for(&self, req: &RequestData) -> PathBuf {
		self.root
			.join(chunk_rel_path(&req.fs_path, req.file_version, &req.target))
	}

	/// Stores a chunk at its versioned path.
	pub fn put(&self, req: &RequestData, data: &[u8]) -> Result<()> {
		let path = self.path_for(req);
		if let Some(dir) = path.parent() {
			fs::create_dir_all(dir)?;
		}
		let mut file = OpenOptions::new()
			.write(true)
			.create(true)
			.truncate(true)
			.open(&path)?;
		file.write_all(data)?;
		file.sync_data()?;
		Ok(())
	}

	/// Loads a chunk.
	pub fn get(&self, req: &RequestData) -> Result<Vec<u8>> {
		let mut buf = Vec::new();
		fs::File::open(self.path_for(req))?.read_to_end(&mut buf)?;
		Ok(buf)
	}

	/// Deletes a chunk; deleting an absent chunk succeeds, so repeated
	/// vacuum passes are no-ops.
	pub fn delete(&self, req: &RequestData) -> Result<()> {
		match fs::remove_file(self.path_for(req)) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Tells whether a chunk is present.
	pub fn contains(&self, req: &RequestData) -> bool {
		self.path_for(req).exists()
	}

	/// Removes every chunk of one `(fs_path, file_version)` namespace.
	pub fn delete_file_version(&self, fs_path: &str, file_version: i64) -> Result<()> {
		let dir = self
			.root
			.join(format!("{}.{}", fs_path.trim_start_matches('/'), file_version));
		match fs::remove_dir_all(&dir) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Evicts cached blocks of one file version whose id exceeds
	/// `max_id` (every block when `None`); manifests stay.
	pub fn evict_blocks_beyond(
		&self,
		fs_path: &str,
		file_version: i64,
		max_id: Option<u64>,
	) -> Result<()> {
		let dir = self
			.root
			.join(format!("{}.{}", fs_path.trim_start_matches('/'), file_version));
		let Ok(entries) = fs::read_dir(&dir) else {
			return Ok(());
		};
		for e in entries.flatten() {
			let name = e.file_name();
			let Some(name) = name.to_str() else {
				continue;
			};
			let Some((block_id, _)) = name.split_once('.') else {
				continue;
			};
			let Ok(block_id) = block_id.parse::<u64>() else {
				continue;
			};
			if max_id.map(|max| block_id > max).unwrap_or(true) {
				let _ = fs::remove_file(e.path());
			}
		}
		Ok(())
	}

	/// Renames a `(fs_path, file_version)` namespace to a new version;
	/// cache reversioning on an MS-driven version bump.
	pub fn reversion(&self, fs_path: &str, old_version: i64, new_version: i64) -> Result<()> {
		let trimmed = fs_path.trim_start_matches('/');
		let old_dir = self.root.join(format!("{}.{}", trimmed, old_version));
		let new_dir = self.root.join(format!("{}.{}", trimmed, new_version));
		match fs::rename(&old_dir, &new_dir) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Moves a version namespace to a new path; local side of a rename.
	pub fn rename_path(&self, old_fs_path: &str, new_fs_path: &str, file_version: i64) -> Result<()> {
		let old_dir = self.root.join(format!(
			"{}.{}",
			old_fs_path.trim_start_matches('/'),
			file_version
		));
		let new_dir = self.root.join(format!(
			"{}.{}",
			new_fs_path.trim_start_matches('/'),
			file_version
		));
		if let Some(parent) = new_dir.parent() {
			fs::create_dir_all(parent)?;
		}
		match fs::rename(&old_dir, &new_dir) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Total bytes stored.
	pub fn usage(&self) -> u64 {
		fn dir_size(dir: &Path) -> u64 {
			let Ok(entries) = fs::read_dir(dir) else {
				return 0;
			};
			entries
				.flatten()
				.map(|e| {
					let path = e.path();
					if path.is_dir() {
						dir_size(&path)
					} else {
						e.metadata().map(|m| m.len()).unwrap_or(0)
					}
				})
				.sum()
		}
		dir_size(&self.root)
	}

	/// Evicts oldest chunks until usage drops under `soft_limit`, once
	/// usage crosses `hard_limit`.
	pub fn enforce_limits(&self, soft_limit: u64, hard_limit: u64) -> Result<()> {
		if self.usage() <= hard_limit {
			return Ok(());
		}
		let mut files: Vec<(std::time::SystemTime, PathBuf, u64)> = Vec::new();
		fn collect(dir: &Path, out: &mut Vec<(std::time::SystemTime, PathBuf, u64)>) {
			let Ok(entries) = fs::read_dir(dir) else {
				return;
			};
			for e in entries.flatten() {
				let path = e.path();
				if path.is_dir() {
					collect(&path, out);
				} else if let Ok(meta) = e.metadata() {
					let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
					out.push((mtime, path, meta.len()));
				}
			}
		}
		collect(&self.root, &mut files);
		files.sort();

		let mut usage: u64 = files.iter().map(|(_, _, len)| len).sum();
		for (_, path, len) in files {
			if usage <= soft_limit {
				break;
			}
			if fs::remove_file(&path).is_ok() {
				usage = usage.saturating_sub(len);
				debug!("evicted cached chunk {}", path.display());
			}
		}
		Ok(())
	}
}

/// The persisted upload-metadata tree.
pub struct MetadataStore {
	root: PathBuf,
	session_id: i64,
}

impl MetadataStore {
	/// Opens the tree and reaps leftovers of crashed sessions.
	pub fn open(root: &Path, session_id: i64) -> Result<Self> {
		fs::create_dir_all(root)?;
		let store = Self {
			root: root.to_owned(),
			session_id,
		};
		let reaped = store.reap_stale()?;
		if reaped > 0 {
			warn!("reaped {} uncommitted upload records", reaped);
		}
		Ok(store)
	}

	fn path_for(&self, info: &UploadMetadata) -> PathBuf {
		self.root.join(chunk_rel_path(
			&info.fs_path,
			info.file_version,
			&RequestTarget::Block {
				block_id: info.block_id,
				block_version: info.block_version,
			},
		))
	}

	/// Persists an upload record, stamping the current session and
	/// write time.
	///
	/// Overwrite is disallowed unless the caller explicitly requests a
	/// replace; fails with `AlreadyExists` otherwise.
	pub fn store(&self, info: &UploadMetadata, replace: bool) -> Result<()> {
		let mut info = info.clone();
		info.session_id = self.session_id;
		info.write_time = TimeSpec::now().sec;

		let path = self.path_for(&info);
		if let Some(dir) = path.parent() {
			fs::create_dir_all(dir)?;
		}
		let bytes = wire::encode(&info)?;
		let mut open = OpenOptions::new();
		open.write(true).truncate(true);
		if replace {
			open.create(true);
		} else {
			open.create_new(true);
		}
		let mut file = open.open(&path)?;
		file.write_all(&bytes)?;
		file.sync_data()?;
		Ok(())
	}

	/// Loads an upload record.
	///
	/// A record that is not committed and belongs to another session is
	/// a crashed upload; returns `Stale`.
	pub fn get(
		&self,
		fs_path: &str,
		file_version: i64,
		block_id: u64,
		block_version: i64,
	) -> Result<UploadMetadata> {
		let probe = UploadMetadata {
			fs_path: fs_path.to_owned(),
			file_version,
			block_id,
			block_version,
			progress: UploadProgress::Started,
			session_id: 0,
			write_time: 0,
		};
		let mut buf = Vec::new();
		fs::File::open(self.path_for(&probe))?.read_to_end(&mut buf)?;
		let info: UploadMetadata = wire::decode(&buf).map_err(|_| Error::NoData)?;
		if info.progress != UploadProgress::Committed && info.session_id != self.session_id {
			return Err(Error::Stale);
		}
		Ok(info)
	}

	/// Removes an upload record.
	pub fn delete(
		&self,
		fs_path: &str,
		file_version: i64,
		block_id: u64,
		block_version: i64,
	) -> Result<()> {
		let probe = UploadMetadata {
			fs_path: fs_path.to_owned(),
			file_version,
			block_id,
			block_version,
			progress: UploadProgress::Started,
			session_id: 0,
			write_time: 0,
		};
		match fs::remove_file(self.path_for(&probe)) {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}

	/// Removes every record left uncommitted by another session.
	pub fn reap_stale(&self) -> Result<usize> {
		let mut reaped = 0;
		let mut stack = vec![self.root.clone()];
		while let Some(dir) = stack.pop() {
			let Ok(entries) = fs::read_dir(&dir) else {
				continue;
			};
			for e in entries.flatten() {
				let path = e.path();
				if path.is_dir() {
					stack.push(path);
					continue;
				}
				let mut buf = Vec::new();
				let Ok(mut file) = fs::File::open(&path) else {
					continue;
				};
				if file.read_to_end(&mut buf).is_err() {
					continue;
				}
				let parse: Result<UploadMetadata> = wire::decode(&buf);
				let stale = match parse {
					Ok(info) => {
						info.progress != UploadProgress::Committed
							&& info.session_id != self.session_id
					}
					// unparsable records are leftovers too
					Err(_) => true,
				};
				if stale && fs::remove_file(&path).is_ok() {
					reaped += 1;
				}
			}
		}
		Ok(reaped)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use tempfile::tempdir;

	fn block_req(fs_path: &str, file_version: i64, block_id: u64, block_version: i64) -> RequestData {
		RequestData::block(fs_path, 0x100, file_version, 10, 1, 10, 1, block_id, block_version)
	}

	#[test]
	fn chunk_round_trip_and_delete() {
		let dir = tempdir().unwrap();
		let store = ChunkStore::open(dir.path()).unwrap();
		let req = block_req("/a/b.txt", 2, 0, 3);
		store.put(&req, b"chunk bytes").unwrap();
		assert!(store.contains(&req));
		assert_eq!(store.get(&req).unwrap(), b"chunk bytes");
		store.delete(&req).unwrap();
		assert!(!store.contains(&req));
		// repeated delete is a no-op
		store.delete(&req).unwrap();
		assert!(matches!(store.get(&req), Err(Error::NotFound)));
	}

	#[test]
	fn chunk_paths_are_version_namespaced() {
		let dir = tempdir().unwrap();
		let store = ChunkStore::open(dir.path()).unwrap();
		store.put(&block_req("/f", 1, 0, 1), b"v1").unwrap();
		store.put(&block_req("/f", 2, 0, 1), b"v2").unwrap();
		assert!(dir.path().join("f.1/0.1").exists());
		assert!(dir.path().join("f.2/0.1").exists());

		store.reversion("/f", 2, 3).unwrap();
		assert!(!dir.path().join("f.2/0.1").exists());
		assert!(dir.path().join("f.3/0.1").exists());

		store.delete_file_version("/f", 1).unwrap();
		assert!(!dir.path().join("f.1").exists());
	}

	#[test]
	fn eviction_respects_limits() {
		let dir = tempdir().unwrap();
		let store = ChunkStore::open(dir.path()).unwrap();
		for i in 0..8 {
			store.put(&block_req("/f", 1, i, 1), &[0u8; 1024]).unwrap();
		}
		assert_eq!(store.usage(), 8 * 1024);
		// under the hard limit: nothing happens
		store.enforce_limits(2 * 1024, 16 * 1024).unwrap();
		assert_eq!(store.usage(), 8 * 1024);
		// over it: evict down to the soft limit
		store.enforce_limits(2 * 1024, 4 * 1024).unwrap();
		assert!(store.usage() <= 2 * 1024);
	}

	#[test]
	fn metadata_overwrite_rules() {
		let dir = tempdir().unwrap();
		let store = MetadataStore::open(dir.path(), 42).unwrap();
		let info = UploadMetadata {
			fs_path: "/f".to_owned(),
			file_version: 1,
			block_id: 0,
			block_version: 1,
			progress: UploadProgress::Started,
			session_id: 0,
			write_time: 0,
		};
		store.store(&info, false).unwrap();
		assert!(matches!(store.store(&info, false), Err(Error::AlreadyExists)));
		store.store(&info, true).unwrap();
		assert_eq!(store.get("/f", 1, 0, 1).unwrap().session_id, 42);
	}

	#[test]
	fn uncommitted_records_of_other_sessions_are_stale_and_reaped() {
		let dir = tempdir().unwrap();
		let store = MetadataStore::open(dir.path(), 1).unwrap();
		let mut info = UploadMetadata {
			fs_path: "/f".to_owned(),
			file_version: 1,
			block_id: 0,
			block_version: 1,
			progress: UploadProgress::Started,
			session_id: 0,
			write_time: 0,
		};
		store.store(&info, false).unwrap();
		info.block_id = 1;
		info.progress = UploadProgress::Committed;
		store.store(&info, false).unwrap();

		// a new session sees the started record as stale
		let next = MetadataStore {
			root: dir.path().to_owned(),
			session_id: 2,
		};
		assert!(matches!(next.get("/f", 1, 0, 1), Err(Error::Stale)));
		// committed records survive
		assert!(next.get("/f", 1, 1, 1).is_ok());

		// reopening reaps the crashed upload
		let reopened = MetadataStore::open(dir.path(), 2).unwrap();
		assert!(matches!(reopened.get("/f", 1, 0, 1), Err(Error::NotFound)));
		assert!(reopened.get("/f", 1, 1, 1).is_ok());
	}
}
