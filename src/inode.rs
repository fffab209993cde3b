//! The cached inode: metadata, manifest, dirty blocks and xattrs.

use crate::manifest::BlockInfo;
use crate::manifest::ChunkRole;
use crate::manifest::Manifest;
use crate::ms::EntryType;
use crate::ms::MdEntry;
use crate::util::TimeSpec;
use std::collections::BTreeMap;
use std::collections::HashMap;

/// One not-yet-flushed block buffer.
#[derive(Clone, Debug)]
pub struct DirtyBlock {
	/// Block contents; always `block_size` bytes long.
	pub buf: Vec<u8>,
	/// First valid byte within the buffer.
	pub partial_start: u64,
	/// One past the last valid byte within the buffer.
	pub partial_end: u64,
	/// Version the block had before this write, for vacuuming.
	pub prior_version: i64,
}

impl DirtyBlock {
	/// Tells whether the buffer covers the whole block.
	///
	/// Unaligned dirty blocks must be filled from the pre-image before
	/// they can be flushed.
	pub fn is_aligned(&self, block_size: u64) -> bool {
		self.partial_start == 0 && self.partial_end == block_size
	}
}

/// A cached inode; either a directory or a regular file.
#[derive(Clone, Debug)]
pub struct Inode {
	/// Name within the parent directory.
	pub name: String,
	/// File or directory.
	pub entry_type: EntryType,
	/// File identifier.
	pub file_id: u64,
	/// File version.
	pub version: i64,
	/// Owning user.
	pub owner: u64,
	/// Coordinator gateway.
	pub coordinator: u64,
	/// Volume id.
	pub volume: u64,
	/// POSIX permission bits.
	pub mode: u32,
	/// Size in bytes.
	pub size: u64,
	/// Creation time.
	pub ctime: TimeSpec,
	/// Modification time.
	pub mtime: TimeSpec,
	/// Manifest modification time.
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
	/// Read-freshness TTL, milliseconds.
	pub max_read_freshness: i64,
	/// Write-freshness TTL, milliseconds.
	pub max_write_freshness: i64,
	/// Smallest child generation not yet fetched from the MS.
	pub least_unknown_generation: i64,
	/// When the metadata was last reconciled against the MS.
	pub refresh_time: TimeSpec,
	/// When the manifest was last refreshed.
	pub manifest_refresh_time: TimeSpec,
	/// External marker forcing the next read to revalidate.
	pub read_stale: bool,
	/// Children by name (directories); values are cache node ids.
	pub children: BTreeMap<String, u64>,
	/// Block map (regular files).
	pub manifest: Option<Manifest>,
	/// Dirty block buffers awaiting flush.
	pub dirty: BTreeMap<u64, DirtyBlock>,
	/// Block versions a successful flush replaced, awaiting vacuum.
	pub replaced: Manifest,
	/// Cached extended attributes.
	pub xattrs: HashMap<String, Vec<u8>>,
	/// Live open handles.
	pub open_count: u32,
	/// Set by detach; reaped once `open_count` reaches zero.
	pub deleted: bool,
}

impl Inode {
	/// Builds a cached inode from an MS export.
	pub fn from_md_entry(ent: &MdEntry) -> Self {
		let manifest = match ent.entry_type {
			EntryType::File => {
				let mut m = Manifest::new(ent.volume, ent.coordinator, ent.file_id, ent.version);
				m.size = ent.size;
				m.modtime = ent.manifest_mtime;
				Some(m)
			}
			EntryType::Dir => None,
		};
		Self {
			name: ent.name.clone(),
			entry_type: ent.entry_type,
			file_id: ent.file_id,
			version: ent.version,
			owner: ent.owner,
			coordinator: ent.coordinator,
			volume: ent.volume,
			mode: ent.mode,
			size: ent.size,
			ctime: ent.ctime,
			mtime: ent.mtime,
			manifest_mtime: ent.manifest_mtime,
			write_nonce: ent.write_nonce,
			xattr_nonce: ent.xattr_nonce,
			generation: ent.generation,
			num_children: ent.num_children,
			parent_id: ent.parent_id,
			max_read_freshness: ent.max_read_freshness,
			max_write_freshness: ent.max_write_freshness,
			least_unknown_generation: 0,
			refresh_time: TimeSpec::default(),
			manifest_refresh_time: TimeSpec::default(),
			read_stale: false,
			children: BTreeMap::new(),
			manifest,
			dirty: BTreeMap::new(),
			replaced: Manifest::new(ent.volume, ent.coordinator, ent.file_id, ent.version),
			xattrs: HashMap::new(),
			open_count: 0,
			deleted: false,
		}
	}

	/// Exports the inode back into MS form.
	pub fn to_md_entry(&self) -> MdEntry {
		MdEntry {
			entry_type: self.entry_type,
			name: self.name.clone(),
			file_id: self.file_id,
			version: self.version,
			owner: self.owner,
			coordinator: self.coordinator,
			volume: self.volume,
			mode: self.mode,
			size: self.size,
			ctime: self.ctime,
			mtime: self.mtime,
			manifest_mtime: self.manifest_mtime,
			write_nonce: self.write_nonce,
			xattr_nonce: self.xattr_nonce,
			generation: self.generation,
			num_children: self.num_children,
			parent_id: self.parent_id,
			max_read_freshness: self.max_read_freshness,
			max_write_freshness: self.max_write_freshness,
		}
	}

	/// Tells whether the inode is a directory.
	pub fn is_dir(&self) -> bool {
		self.entry_type == EntryType::Dir
	}

	/// Tells whether the inode is a regular file.
	pub fn is_file(&self) -> bool {
		self.entry_type == EntryType::File
	}

	/// Tells whether cached metadata is stale for reads at `now`.
	pub fn is_read_stale(&self, now: &TimeSpec) -> bool {
		if self.read_stale {
			return true;
		}
		now.diff_ms(&self.refresh_time) > self.max_read_freshness
	}

	/// Records a dirty write of `block_id`, advancing the block version
	/// and marking the manifest entry ephemeral until flush.
	pub fn stage_dirty_block(&mut self, block_id: u64, dirty: DirtyBlock) {
		if let Some(manifest) = self.manifest.as_mut() {
			let next_version = manifest
				.get_block(block_id)
				.map(|info| info.version + 1)
				.unwrap_or(1);
			let info = BlockInfo {
				version: next_version,
				hash: None,
				kind: crate::manifest::ChunkKind::Block,
				role: ChunkRole::Ephemeral,
			};
			// staged entries always make strict progress
			manifest
				.put_block(block_id, info, true)
				.expect("overwrite never fails");
		}
		self.dirty.insert(block_id, dirty);
	}

	/// Drops every cached xattr; used when the MS `xattr_nonce` moves.
	pub fn purge_xattrs(&mut self) {
		self.xattrs.clear();
	}
}
