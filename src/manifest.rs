//! In-memory model of a file's block map.
//!
//! A manifest maps dense block ids to per-block version and digest records,
//! stamped with the file's coordinator and modtime. Two wire layouts exist:
//! the per-block form written by user gateways, and the URL-set form written
//! by acquisition gateways for bulk coverage of static files. Both are
//! accepted on decode.

use crate::error::Error;
use crate::error::Result;
use crate::util::TimeSpec;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// Whether a manifest entry describes a data block or a manifest chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkKind {
	/// A block of file content.
	#[default]
	Block,
	/// A serialized manifest.
	Manifest,
}

/// Whether an entry is durable data or a not-yet-flushed local write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkRole {
	/// Replicated, durable data.
	#[default]
	Data,
	/// Dirty local data that has not been flushed yet.
	Ephemeral,
}

/// Per-block record within a manifest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
	/// Version of the block; non-decreasing at a single coordinator.
	pub version: i64,
	/// Digest of the block's post-serialization bytes, if known.
	pub hash: Option<[u8; 32]>,
	/// Block or manifest chunk.
	pub kind: ChunkKind,
	/// Durable or ephemeral.
	pub role: ChunkRole,
}

impl BlockInfo {
	/// A durable data-block record.
	pub fn new(version: i64, hash: Option<[u8; 32]>) -> Self {
		Self {
			version,
			hash,
			kind: ChunkKind::Block,
			role: ChunkRole::Data,
		}
	}
}

/// A file's block map plus its coordinator stamp and modtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
	/// Volume the file belongs to.
	pub volume_id: u64,
	/// Gateway authoritative for writes to the file.
	pub coordinator_id: u64,
	/// File identifier.
	pub file_id: u64,
	/// File version this manifest describes.
	pub file_version: i64,
	/// Size of the file in bytes.
	pub size: u64,
	/// Modtime; equals the inode's `manifest_mtime` when signed.
	pub modtime: TimeSpec,
	/// Source URL for acquisition-gateway datasets.
	pub file_url: Option<String>,
	/// When set, the next read must refetch the manifest.
	stale: bool,
	blocks: BTreeMap<u64, BlockInfo>,
}

impl Manifest {
	/// Creates an empty manifest for a file.
	pub fn new(volume_id: u64, coordinator_id: u64, file_id: u64, file_version: i64) -> Self {
		Self {
			volume_id,
			coordinator_id,
			file_id,
			file_version,
			..Default::default()
		}
	}

	/// Returns the record for block `id`, if present.
	pub fn get_block(&self, id: u64) -> Option<&BlockInfo> {
		self.blocks.get(&id)
	}

	/// Inserts a record for block `id`.
	///
	/// Fails with `AlreadyExists` if an entry is present and `overwrite`
	/// is false.
	pub fn put_block(&mut self, id: u64, info: BlockInfo, overwrite: bool) -> Result<()> {
		if !overwrite && self.blocks.contains_key(&id) {
			return Err(Error::AlreadyExists);
		}
		self.blocks.insert(id, info);
		Ok(())
	}

	/// Removes the record for block `id`, returning it.
	pub fn remove_block(&mut self, id: u64) -> Option<BlockInfo> {
		self.blocks.remove(&id)
	}

	/// Drops every entry with `block_id > max_id`.
	pub fn truncate(&mut self, max_id: u64) {
		self.blocks.retain(|id, _| *id <= max_id);
	}

	/// Merges `delta` into `self`.
	///
	/// An entry of `delta` replaces the local entry iff its version is
	/// strictly newer, so in-flight local writes are never clobbered by a
	/// refresh. The merge is commutative and associative over
	/// strict-progress deltas, so concurrent merges converge regardless
	/// of order.
	pub fn patch(&mut self, delta: &Manifest) {
		for (id, info) in delta.iter() {
			match self.blocks.get(id) {
				Some(cur) if cur.version >= info.version => {}
				_ => {
					self.blocks.insert(*id, *info);
				}
			}
		}
	}

	/// Iterates entries in ascending block-id order.
	pub fn iter(&self) -> impl Iterator<Item = (&u64, &BlockInfo)> {
		self.blocks.iter()
	}

	/// Number of entries.
	pub fn len(&self) -> usize {
		self.blocks.len()
	}

	/// Tells whether the manifest has no entries.
	pub fn is_empty(&self) -> bool {
		self.blocks.is_empty()
	}

	/// Tells whether the next read must refetch the manifest.
	pub fn is_stale(&self) -> bool {
		self.stale
	}

	/// Marks the manifest stale.
	pub fn set_stale(&mut self, stale: bool) {
		self.stale = stale;
	}

	/// Id of the last block a file of `size` bytes may carry, given the
	/// volume block size. `None` for an empty file.
	pub fn max_block_id(size: u64, block_size: u64) -> Option<u64> {
		if size == 0 {
			return None;
		}
		Some((size + block_size - 1) / block_size - 1)
	}

	/// Shrinks the manifest to cover `new_size` bytes.
	pub fn truncate_to_size(&mut self, new_size: u64, block_size: u64) {
		match Self::max_block_id(new_size, block_size) {
			Some(max_id) => self.truncate(max_id),
			None => self.blocks.clear(),
		}
		self.size = new_size;
	}

	/// Serializes to the per-block wire layout (user gateways).
	pub fn to_wire_blocks(&self) -> ManifestMsg {
		let blocks = self
			.blocks
			.iter()
			.map(|(id, info)| BlockEntry {
				block_id: *id,
				block_version: info.version,
				hash: info.hash,
				kind: info.kind,
			})
			.collect();
		ManifestMsg {
			volume_id: self.volume_id,
			coordinator_id: self.coordinator_id,
			file_id: self.file_id,
			file_version: self.file_version,
			size: self.size,
			modtime: self.modtime,
			layout: ManifestLayout::Blocks(blocks),
		}
	}

	/// Serializes to the URL-set wire layout (acquisition gateways).
	///
	/// Consecutive block ids collapse into one range per run.
	pub fn to_wire_url_sets(&self) -> ManifestMsg {
		let url = self.file_url.clone().unwrap_or_default();
		let mut sets: Vec<BlockUrlSet> = Vec::new();
		for (id, info) in self.blocks.iter() {
			match sets.last_mut() {
				Some(set) if set.end_id == *id => {
					set.end_id += 1;
					set.block_versions.push(info.version);
				}
				_ => sets.push(BlockUrlSet {
					start_id: *id,
					end_id: *id + 1,
					file_url: url.clone(),
					block_versions: vec![info.version],
				}),
			}
		}
		ManifestMsg {
			volume_id: self.volume_id,
			coordinator_id: self.coordinator_id,
			file_id: self.file_id,
			file_version: self.file_version,
			size: self.size,
			modtime: self.modtime,
			layout: ManifestLayout::UrlSets(sets),
		}
	}

	/// Rebuilds a manifest from either wire layout.
	pub fn from_wire(msg: ManifestMsg) -> Result<Self> {
		let mut manifest = Manifest::new(msg.volume_id, msg.coordinator_id, msg.file_id, msg.file_version);
		manifest.size = msg.size;
		manifest.modtime = msg.modtime;
		match msg.layout {
			ManifestLayout::Blocks(entries) => {
				for e in entries {
					let info = BlockInfo {
						version: e.block_version,
						hash: e.hash,
						kind: e.kind,
						role: ChunkRole::Data,
					};
					manifest.put_block(e.block_id, info, true)?;
				}
			}
			ManifestLayout::UrlSets(sets) => {
				for set in &sets {
					if set.end_id < set.start_id
						|| set.block_versions.len() != (set.end_id - set.start_id) as usize
					{
						return Err(Error::ProtocolMismatch(
							"block URL set range disagrees with its version list".to_owned(),
						));
					}
					for (i, id) in (set.start_id..set.end_id).enumerate() {
						let info = BlockInfo::new(set.block_versions[i], None);
						manifest.put_block(id, info, true)?;
					}
				}
				if let Some(set) = sets.first() {
					if !set.file_url.is_empty() {
						manifest.file_url = Some(set.file_url.clone());
					}
				}
			}
		}
		Ok(manifest)
	}
}

/// One per-block entry on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
	/// Zero-based block index.
	pub block_id: u64,
	/// Version of that block.
	pub block_version: i64,
	/// Digest of the block's serialized bytes, if known.
	pub hash: Option<[u8; 32]>,
	/// Block or manifest chunk.
	pub kind: ChunkKind,
}

/// A run of blocks served from one source URL.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUrlSet {
	/// First block id of the run.
	pub start_id: u64,
	/// One past the last block id of the run.
	pub end_id: u64,
	/// Source URL covering the run.
	pub file_url: String,
	/// Version of each block in the run, in order.
	pub block_versions: Vec<i64>,
}

/// The two accepted block layouts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestLayout {
	/// Per-block entries (user gateways).
	Blocks(Vec<BlockEntry>),
	/// URL-set ranges (acquisition gateways).
	UrlSets(Vec<BlockUrlSet>),
}

/// A manifest as it appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestMsg {
	/// Volume the file belongs to.
	pub volume_id: u64,
	/// Gateway authoritative for the file.
	pub coordinator_id: u64,
	/// File identifier.
	pub file_id: u64,
	/// File version described.
	pub file_version: i64,
	/// File size in bytes.
	pub size: u64,
	/// Manifest modtime.
	pub modtime: TimeSpec,
	/// Block layout, in either accepted shape.
	pub layout: ManifestLayout,
}
