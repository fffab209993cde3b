//! User-gateway core: the read/write data path and metadata operations.
//!
//! Reads consult dirty buffers, then the local block cache, then the
//! remote gateways in coordinator-first order. Writes accumulate dirty
//! block buffers on the inode; flush serializes, signs and replicates
//! them, tells the MS about the new manifest, and queues the superseded
//! versions for vacuuming.

pub mod server;
pub mod vacuum;

use crate::cache::FsCache;
use crate::cache::Node;
use crate::chunk;
use crate::consistency::SyncContext;
use crate::driver::Driver;
use crate::error::Error;
use crate::error::Result;
use crate::gateway::GatewayContext;
use crate::inode::DirtyBlock;
use crate::inode::Inode;
use crate::manifest::BlockInfo;
use crate::manifest::ChunkRole;
use crate::manifest::Manifest;
use crate::ms::EntryType;
use crate::ms::MdEntry;
use crate::ms::MsClient;
use crate::ms::VacuumLogEntry;
use crate::replication;
use crate::replication::RgContext;
use crate::request::RequestData;
use crate::rpc;
use crate::rpc::Transport;
use crate::storage::ChunkStore;
use crate::storage::MetadataStore;
use crate::storage::UploadMetadata;
use crate::storage::UploadProgress;
use crate::util::path_basename;
use crate::util::path_dirname;
use crate::util::TimeSpec;
use crate::wire::RequestMsg;
use crate::wire::Verb;
use log::debug;
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use vacuum::VacuumContext;
use vacuum::Vacuumer;

/// File id the volume root is published under.
pub const ROOT_FILE_ID: u64 = 0;

/// Shared state of one user gateway.
pub struct UgState {
	/// Gateway identity and volume view.
	pub ctx: Arc<GatewayContext>,
	/// Metadata-service client.
	pub ms: Arc<dyn MsClient>,
	/// Gateway-to-gateway transport.
	pub transport: Arc<dyn Transport>,
	/// The inode cache.
	pub cache: Arc<FsCache>,
	/// Local block cache (plain, post-deserialization bytes).
	pub store: Arc<ChunkStore>,
	/// Persisted upload-progress records.
	pub meta: Arc<MetadataStore>,
	/// Storage-driver pools.
	pub driver: Arc<Driver>,
	/// The vacuum worker.
	pub vacuumer: Vacuumer,
	renames: Mutex<HashSet<String>>,
}

/// The volume root as first cached, before any MS contact.
fn root_inode(ctx: &GatewayContext) -> Inode {
	Inode::from_md_entry(&MdEntry {
		entry_type: EntryType::Dir,
		name: "/".to_owned(),
		file_id: ROOT_FILE_ID,
		version: 1,
		owner: ctx.volume.owner_id,
		coordinator: 0,
		volume: ctx.volume.id,
		mode: 0o755,
		size: 0,
		ctime: TimeSpec::default(),
		mtime: TimeSpec::default(),
		manifest_mtime: TimeSpec::default(),
		write_nonce: 0,
		xattr_nonce: 0,
		generation: 0,
		num_children: 0,
		parent_id: ROOT_FILE_ID,
		max_read_freshness: 5000,
		max_write_freshness: 0,
	})
}

impl UgState {
	/// Brings a user gateway up.
	pub fn new(
		ctx: Arc<GatewayContext>,
		ms: Arc<dyn MsClient>,
		transport: Arc<dyn Transport>,
		driver: Arc<Driver>,
	) -> Result<Arc<Self>> {
		let store = Arc::new(ChunkStore::open(&ctx.config.storage_root)?);
		let meta = Arc::new(MetadataStore::open(
			&ctx.config.metadata_root,
			ctx.session_id,
		)?);
		let cache = FsCache::new(root_inode(&ctx));
		let vacuumer = Vacuumer::start(
			Arc::clone(&ctx),
			Arc::clone(&ms),
			Arc::clone(&transport),
			Arc::clone(&cache),
		);
		Ok(Arc::new(Self {
			ctx,
			ms,
			transport,
			cache,
			store,
			meta,
			driver,
			vacuumer,
			renames: Mutex::new(HashSet::new()),
		}))
	}

	/// Stops background workers.
	pub fn shutdown(&self) {
		self.vacuumer.stop();
		self.cache.drain_removals();
	}

	fn sync(&self) -> SyncContext<'_> {
		SyncContext {
			ctx: &self.ctx,
			ms: self.ms.as_ref(),
			transport: self.transport.as_ref(),
			cache: &self.cache,
			store: &self.store,
		}
	}

	/// Opens `path`, refreshing it, and takes a handle.
	pub fn open(&self, path: &str) -> Result<Arc<Node>> {
		let node = self.sync().ensure_fresh(path)?;
		self.cache.open(&node);
		Ok(node)
	}

	/// Releases a handle taken by `open`.
	pub fn close(&self, node: &Arc<Node>) {
		self.cache.close(node);
	}

	/// Fresh metadata for `path`.
	pub fn stat(&self, path: &str) -> Result<MdEntry> {
		self.sync().ensure_path_fresh(path)?;
		let node = self.cache.resolve(path)?;
		let state = node.state.read();
		Ok(state.to_md_entry())
	}

	/// Creates a regular file.
	pub fn create(&self, path: &str, mode: u32) -> Result<Arc<Node>> {
		self.publish(path, mode, EntryType::File)
	}

	/// Creates a directory.
	pub fn mkdir(&self, path: &str, mode: u32) -> Result<Arc<Node>> {
		self.publish(path, mode, EntryType::Dir)
	}

	fn publish(&self, path: &str, mode: u32, entry_type: EntryType) -> Result<Arc<Node>> {
		let dirname = path_dirname(path);
		self.sync().ensure_path_fresh(&dirname)?;
		let parent = self.cache.resolve(&dirname)?;
		let parent_file_id = parent.state.read().file_id;
		let name = path_basename(path).to_owned();
		if parent.state.read().children.contains_key(&name) {
			return Err(Error::AlreadyExists);
		}

		let now = TimeSpec::now();
		let ent = MdEntry {
			entry_type,
			name,
			file_id: 0,
			version: 1,
			owner: self.ctx.user_id,
			coordinator: self.ctx.id,
			volume: self.ctx.volume.id,
			mode,
			size: 0,
			ctime: now,
			mtime: now,
			manifest_mtime: now,
			write_nonce: 1,
			xattr_nonce: 1,
			generation: 0,
			num_children: 0,
			parent_id: parent_file_id,
			max_read_freshness: 5000,
			max_write_freshness: 0,
		};
		let published = self.ms.create(&ent)?;
		let mut inode = Inode::from_md_entry(&published);
		inode.refresh_time = now;
		self.cache.attach(&parent, inode)
	}

	/// Fresh listing of a directory's children.
	pub fn readdir(&self, path: &str) -> Result<Vec<MdEntry>> {
		self.sync().ensure_path_fresh(path)?;
		self.sync().ensure_dir_fresh(path)?;
		let node = self.cache.resolve(path)?;
		let child_ids: Vec<u64> = node.state.read().children.values().copied().collect();
		let mut out = Vec::with_capacity(child_ids.len());
		for id in child_ids {
			if let Some(child) = self.cache.node(id) {
				out.push(child.state.read().to_md_entry());
			}
		}
		Ok(out)
	}

	/// Reads up to `len` bytes at `offset`.
	pub fn read(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
		let node = self.sync().ensure_fresh(path)?;
		let block_size = self.ctx.block_size();

		// snapshot the coordinates and the dirty buffers
		let (file_id, version, coordinator, size, entries, dirty): (
			u64,
			i64,
			u64,
			u64,
			HashMap<u64, BlockInfo>,
			HashMap<u64, Vec<u8>>,
		) = {
			let state = node.state.read();
			if !state.is_file() {
				return Err(Error::InvalidArgument("not a regular file".to_owned()));
			}
			let manifest = state
				.manifest
				.as_ref()
				.ok_or_else(|| Error::Io("file without a manifest".to_owned()))?;
			let entries = manifest.iter().map(|(id, info)| (*id, *info)).collect();
			let dirty = state
				.dirty
				.iter()
				.map(|(id, d)| (*id, d.buf.clone()))
				.collect();
			(
				state.file_id,
				state.version,
				state.coordinator,
				state.size,
				entries,
				dirty,
			)
		};

		if offset >= size || len == 0 {
			return Ok(Vec::new());
		}
		let end = size.min(offset + len as u64);
		let first = offset / block_size;
		let last = (end - 1) / block_size;

		let mut out = Vec::with_capacity((end - offset) as usize);
		for block_id in first..=last {
			let base = block_id * block_size;
			let want_from = offset.max(base) - base;
			let want_to = end.min(base + block_size) - base;

			let block = if let Some(buf) = dirty.get(&block_id) {
				buf.clone()
			} else {
				let info = entries.get(&block_id).copied().ok_or(Error::NotFound)?;
				self.fetch_block_plain(path, file_id, version, coordinator, block_id, &info)?
			};

			// the tail block may be short; missing bytes read as zero
			let mut block = block;
			if (block.len() as u64) < want_to {
				block.resize(want_to as usize, 0);
			}
			out.extend_from_slice(&block[want_from as usize..want_to as usize]);
		}
		Ok(out)
	}

	/// Fetches one plain block: local cache first, then the coordinator,
	/// then each replica.
	fn fetch_block_plain(
		&self,
		path: &str,
		file_id: u64,
		version: i64,
		coordinator: u64,
		block_id: u64,
		info: &BlockInfo,
	) -> Result<Vec<u8>> {
		let req = RequestData::block(
			path,
			file_id,
			version,
			coordinator,
			self.ctx.volume.id,
			self.ctx.id,
			self.ctx.user_id,
			block_id,
			info.version,
		);
		if let Ok(cached) = self.store.get(&req) {
			return Ok(cached);
		}

		let candidates = if coordinator == self.ctx.id {
			self.ctx.rg_ids()
		} else {
			self.ctx.download_gateway_list(coordinator)
		};
		for dest in candidates {
			let signed = match rpc::get_block(&self.ctx, self.transport.as_ref(), dest, &req) {
				Ok(data) => data,
				Err(e) => {
					warn!("block {} from gateway {}: {}", req, dest, e);
					continue;
				}
			};
			let wire_bytes = match chunk::verify(&self.ctx, &signed, coordinator) {
				Ok(data) => data,
				Err(e) => {
					warn!("block {} from gateway {}: {}", req, dest, e);
					continue;
				}
			};
			if let Some(expect) = info.hash {
				if chunk::hash(&wire_bytes) != expect {
					warn!("block {} from gateway {}: digest mismatch", req, dest);
					continue;
				}
			}
			let plain = chunk::deserialize(&self.driver, &req, &wire_bytes)?;
			// best-effort cache fill
			if let Err(e) = self.store.put(&req, &plain) {
				debug!("cache fill for {}: {}", req, e);
			}
			let _ = self.store.enforce_limits(
				self.ctx.config.cache_soft_limit,
				self.ctx.config.cache_hard_limit,
			);
			return Ok(plain);
		}
		Err(Error::NoData)
	}

	/// Buffers a write at `offset`.
	pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<()> {
		if data.is_empty() {
			return Ok(());
		}
		let node = self.sync().ensure_fresh(path)?;
		let block_size = self.ctx.block_size();

		let (file_id, version, coordinator) = {
			let state = node.state.read();
			if !state.is_file() {
				return Err(Error::InvalidArgument("not a regular file".to_owned()));
			}
			(state.file_id, state.version, state.coordinator)
		};

		let end = offset + data.len() as u64;
		let first = offset / block_size;
		let last = (end - 1) / block_size;
		for block_id in first..=last {
			let base = block_id * block_size;
			let from = offset.max(base);
			let to = end.min(base + block_size);
			let aligned = from == base && to == base + block_size;

			// an unaligned write is filled from the pre-image first
			let mut buf = if aligned {
				vec![0u8; block_size as usize]
			} else {
				let (dirty_base, info) = {
					let state = node.state.read();
					let dirty_base = state.dirty.get(&block_id).map(|d| d.buf.clone());
					let info = state
						.manifest
						.as_ref()
						.and_then(|m| m.get_block(block_id))
						.copied();
					(dirty_base, info)
				};
				match (dirty_base, info) {
					(Some(buf), _) => buf,
					(None, Some(info)) if info.role == ChunkRole::Data => {
						let mut buf = self.fetch_block_plain(
							path, file_id, version, coordinator, block_id, &info,
						)?;
						buf.resize(block_size as usize, 0);
						buf
					}
					_ => vec![0u8; block_size as usize],
				}
			};
			buf[(from - base) as usize..(to - base) as usize]
				.copy_from_slice(&data[(from - offset) as usize..(to - offset) as usize]);

			let mut state = node.state.write();
			let prior_version = state
				.dirty
				.get(&block_id)
				.map(|d| d.prior_version)
				.or_else(|| {
					state
						.manifest
						.as_ref()
						.and_then(|m| m.get_block(block_id))
						.filter(|i| i.role == ChunkRole::Data)
						.map(|i| i.version)
				})
				.unwrap_or(0);
			state.stage_dirty_block(
				block_id,
				DirtyBlock {
					buf,
					partial_start: from - base,
					partial_end: to - base,
					prior_version,
				},
			);
			if end > state.size {
				state.size = end;
				if let Some(m) = state.manifest.as_mut() {
					m.size = end;
				}
			}
			state.mtime = TimeSpec::now();
		}
		Ok(())
	}

	/// Flushes dirty blocks: serialize, sign, replicate, publish the new
	/// manifest, and queue the replaced versions for vacuuming.
	pub fn flush(&self, path: &str) -> Result<()> {
		let node = self.cache.resolve(path)?;

		// take the dirty set; it is restored if the flush fails
		let (dirty, file_id, version, coordinator, old_mtime, size) = {
			let mut state = node.state.write();
			if state.dirty.is_empty() {
				return Ok(());
			}
			let staged: Vec<(u64, DirtyBlock, i64)> = {
				let manifest = state
					.manifest
					.as_ref()
					.ok_or_else(|| Error::Io("file without a manifest".to_owned()))?;
				state
					.dirty
					.iter()
					.map(|(id, d)| {
						let v = manifest.get_block(*id).map(|i| i.version).unwrap_or(1);
						(*id, d.clone(), v)
					})
					.collect()
			};
			state.dirty.clear();
			(
				staged,
				state.file_id,
				state.version,
				state.coordinator,
				state.manifest_mtime,
				state.size,
			)
		};

		let result = self.flush_blocks(path, &dirty, file_id, version, coordinator, size);
		let flushed = match result {
			Ok(flushed) => flushed,
			Err(e) => {
				// the write-back failed; the data stays dirty
				let mut state = node.state.write();
				for (id, d, _) in dirty {
					state.dirty.entry(id).or_insert(d);
				}
				return Err(e);
			}
		};

		// fold the results into the manifest and collect the garbage
		let (manifest_snapshot, new_mtime, size, entry) = {
			let mut state = node.state.write();
			for (id, _, staged_version, hash, prior_version) in &flushed {
				if let Some(m) = state.manifest.as_mut() {
					let info = BlockInfo::new(*staged_version, Some(*hash));
					m.put_block(*id, info, true)?;
				}
				if *prior_version > 0 {
					state
						.replaced
						.put_block(*id, BlockInfo::new(*prior_version, None), true)?;
				}
			}
			let new_mtime = TimeSpec::now();
			state.manifest_mtime = new_mtime;
			state.mtime = new_mtime;
			state.write_nonce += 1;
			let size = state.size;
			if let Some(m) = state.manifest.as_mut() {
				m.modtime = new_mtime;
				m.size = size;
			}
			let snapshot = state
				.manifest
				.clone()
				.ok_or_else(|| Error::Io("file without a manifest".to_owned()))?;
			(snapshot, new_mtime, size, state.to_md_entry())
		};

		if coordinator == self.ctx.id {
			self.publish_manifest(path, &manifest_snapshot, new_mtime, &entry)?;
			self.queue_vacuum(&node, path, file_id, version, old_mtime, size)?;
		} else {
			// not the coordinator: push the delta for it to merge
			self.push_patch(path, &node, &flushed, file_id, version, coordinator, new_mtime)?;
		}
		Ok(())
	}

	/// Serializes, signs and replicates each dirty block. Returns
	/// `(block_id, plain, staged_version, wire_hash, prior_version)`.
	#[allow(clippy::type_complexity)]
	fn flush_blocks(
		&self,
		path: &str,
		dirty: &[(u64, DirtyBlock, i64)],
		file_id: u64,
		version: i64,
		coordinator: u64,
		size: u64,
	) -> Result<Vec<(u64, Vec<u8>, i64, [u8; 32], i64)>> {
		let block_size = self.ctx.block_size();
		let mut flushed = Vec::with_capacity(dirty.len());
		for (block_id, d, staged_version) in dirty {
			let req = RequestData::block(
				path,
				file_id,
				version,
				coordinator,
				self.ctx.volume.id,
				self.ctx.id,
				self.ctx.user_id,
				*block_id,
				*staged_version,
			);

			// the tail block carries only the bytes the file covers
			let span = size.saturating_sub(*block_id * block_size).min(block_size) as usize;
			let plain = &d.buf[..span.min(d.buf.len())];
			let wire_bytes = chunk::serialize(&self.driver, &req, plain)?;
			let digest = chunk::hash(&wire_bytes);
			let signed = chunk::sign(&self.ctx, &req, &wire_bytes)?;

			let record = UploadMetadata {
				fs_path: path.to_owned(),
				file_version: version,
				block_id: *block_id,
				block_version: *staged_version,
				progress: UploadProgress::Started,
				session_id: 0,
				write_time: 0,
			};
			self.meta.store(&record, true)?;

			let msg = RequestMsg::new(Verb::PutBlock, req.clone());
			let rg_ctx = RgContext::for_volume(&self.ctx);
			replication::replicate_all(
				&self.ctx,
				self.transport.as_ref(),
				&msg,
				Some(signed.as_slice()),
				&rg_ctx,
			)?;

			let committed = UploadMetadata {
				progress: UploadProgress::Committed,
				..record
			};
			self.meta.store(&committed, true)?;

			// local reads now hit the cache
			self.store.put(&req, plain)?;
			flushed.push((*block_id, plain.to_vec(), *staged_version, digest, d.prior_version));
		}
		Ok(flushed)
	}

	/// Signs the manifest and replicates it, then tells the MS.
	fn publish_manifest(
		&self,
		path: &str,
		manifest: &Manifest,
		mtime: TimeSpec,
		entry: &MdEntry,
	) -> Result<()> {
		let req = RequestData::manifest(
			path,
			manifest.file_id,
			manifest.file_version,
			self.ctx.id,
			self.ctx.volume.id,
			self.ctx.id,
			self.ctx.user_id,
			mtime,
		);
		let encoded = chunk::manifest_encode(&self.ctx, manifest)?;
		let signed = chunk::sign(&self.ctx, &req, &encoded)?;

		let msg = RequestMsg::new(Verb::PutManifest, req);
		let rg_ctx = RgContext::for_volume(&self.ctx);
		replication::replicate_all(
			&self.ctx,
			self.transport.as_ref(),
			&msg,
			Some(signed.as_slice()),
			&rg_ctx,
		)?;

		self.ms.update(entry)?;
		Ok(())
	}

	/// Appends the vacuum-log entry for the superseded manifest and
	/// hands the replaced blocks to the vacuumer.
	fn queue_vacuum(
		&self,
		node: &Arc<Node>,
		path: &str,
		file_id: u64,
		version: i64,
		old_mtime: TimeSpec,
		_size: u64,
	) -> Result<()> {
		let replaced = {
			let mut state = node.state.write();
			let empty = Manifest::new(self.ctx.volume.id, self.ctx.id, file_id, version);
			std::mem::replace(&mut state.replaced, empty)
		};
		let affected: Vec<u64> = replaced.iter().map(|(id, _)| *id).collect();
		self.ms.append_vacuum_log(&VacuumLogEntry {
			volume_id: self.ctx.volume.id,
			writer_id: self.ctx.id,
			file_id,
			file_version: version,
			manifest_mtime: old_mtime,
			affected_blocks: affected,
		})?;
		self.vacuumer.enqueue(VacuumContext::new(
			path,
			file_id,
			version,
			old_mtime,
			Some(replaced),
		));
		Ok(())
	}

	/// Pushes the flushed entries to the coordinator as a manifest
	/// patch; one MS refresh and retry on `Stale`.
	fn push_patch(
		&self,
		path: &str,
		node: &Arc<Node>,
		flushed: &[(u64, Vec<u8>, i64, [u8; 32], i64)],
		file_id: u64,
		version: i64,
		coordinator: u64,
		mtime: TimeSpec,
	) -> Result<()> {
		let mut delta = Manifest::new(self.ctx.volume.id, coordinator, file_id, version);
		delta.modtime = mtime;
		for (id, _, staged_version, hash, _) in flushed {
			delta.put_block(*id, BlockInfo::new(*staged_version, Some(*hash)), true)?;
		}
		let req = RequestData::manifest(
			path,
			file_id,
			version,
			coordinator,
			self.ctx.volume.id,
			self.ctx.id,
			self.ctx.user_id,
			mtime,
		);
		match rpc::patch_manifest(&self.ctx, self.transport.as_ref(), coordinator, &req, &delta) {
			Ok(()) => Ok(()),
			Err(Error::Stale) => {
				// our coordinator view is outdated; refresh once and retry
				self.sync().ensure_path_fresh(path)?;
				let coordinator = node.state.read().coordinator;
				let rc = rpc::patch_manifest(
					&self.ctx,
					self.transport.as_ref(),
					coordinator,
					&req,
					&delta,
				);
				match rc {
					Err(Error::Stale) => Err(Error::NotCoordinator),
					other => other,
				}
			}
			Err(e) => Err(e),
		}
	}

	/// Truncates a file to `new_size`.
	pub fn truncate(&self, path: &str, new_size: u64) -> Result<()> {
		let node = self.sync().ensure_fresh(path)?;
		let (file_id, version, coordinator, size, old_mtime) = {
			let state = node.state.read();
			(
				state.file_id,
				state.version,
				state.coordinator,
				state.size,
				state.manifest_mtime,
			)
		};

		if coordinator != self.ctx.id {
			let req = RequestData::manifest(
				path,
				file_id,
				version,
				coordinator,
				self.ctx.volume.id,
				self.ctx.id,
				self.ctx.user_id,
				old_mtime,
			);
			rpc::truncate(&self.ctx, self.transport.as_ref(), coordinator, &req, new_size)?;
			node.state.write().read_stale = true;
			return Ok(());
		}

		let block_size = self.ctx.block_size();
		let (manifest_snapshot, new_mtime, entry, removed) = {
			let mut state = node.state.write();
			let max_id = Manifest::max_block_id(new_size, block_size);
			let mut removed = Manifest::new(self.ctx.volume.id, self.ctx.id, file_id, version);
			if new_size < size {
				if let Some(m) = state.manifest.as_mut() {
					for (id, info) in m.iter() {
						if max_id.map(|max| *id > max).unwrap_or(true) {
							removed.put_block(*id, *info, true)?;
						}
					}
					m.truncate_to_size(new_size, block_size);
				}
				let doomed: Vec<u64> = state
					.dirty
					.keys()
					.copied()
					.filter(|id| max_id.map(|max| *id > max).unwrap_or(true))
					.collect();
				for id in doomed {
					state.dirty.remove(&id);
				}
			}
			state.size = new_size;
			let new_mtime = TimeSpec::now();
			state.manifest_mtime = new_mtime;
			state.mtime = new_mtime;
			state.write_nonce += 1;
			if let Some(m) = state.manifest.as_mut() {
				m.modtime = new_mtime;
				m.size = new_size;
			}
			let snapshot = state
				.manifest
				.clone()
				.ok_or_else(|| Error::InvalidArgument("not a regular file".to_owned()))?;
			(snapshot, new_mtime, state.to_md_entry(), removed)
		};
		self.store
			.evict_blocks_beyond(path, version, Manifest::max_block_id(new_size, block_size))?;

		self.publish_manifest(path, &manifest_snapshot, new_mtime, &entry)?;

		if !removed.is_empty() {
			let affected: Vec<u64> = removed.iter().map(|(id, _)| *id).collect();
			self.ms.append_vacuum_log(&VacuumLogEntry {
				volume_id: self.ctx.volume.id,
				writer_id: self.ctx.id,
				file_id,
				file_version: version,
				manifest_mtime: old_mtime,
				affected_blocks: affected,
			})?;
			self.vacuumer.enqueue(VacuumContext::new(
				path,
				file_id,
				version,
				old_mtime,
				Some(removed),
			));
		}
		Ok(())
	}

	/// Renames a file or directory.
	pub fn rename(&self, path: &str, new_path: &str) -> Result<()> {
		{
			let mut renames = self.renames.lock();
			if !renames.insert(path.to_owned()) {
				return Err(Error::Busy);
			}
		}
		let rc = self.rename_inner(path, new_path);
		self.renames.lock().remove(path);
		rc
	}

	fn rename_inner(&self, path: &str, new_path: &str) -> Result<()> {
		let node = self.sync().ensure_fresh(path)?;
		let (file_id, version, coordinator, mtime) = {
			let state = node.state.read();
			(
				state.file_id,
				state.version,
				state.coordinator,
				state.manifest_mtime,
			)
		};

		if coordinator != self.ctx.id && node.state.read().is_file() {
			let req = RequestData::manifest(
				path,
				file_id,
				version,
				coordinator,
				self.ctx.volume.id,
				self.ctx.id,
				self.ctx.user_id,
				mtime,
			);
			rpc::rename(&self.ctx, self.transport.as_ref(), coordinator, &req, new_path)?;
			node.state.write().read_stale = true;
			return Ok(());
		}

		let old_parent = self.cache.resolve(&path_dirname(path))?;
		self.sync().ensure_path_fresh(&path_dirname(new_path))?;
		let new_parent = self.cache.resolve(&path_dirname(new_path))?;
		if !new_parent.state.read().is_dir() {
			return Err(Error::NotFound);
		}
		let new_parent_file_id = new_parent.state.read().file_id;
		let new_name = path_basename(new_path).to_owned();

		let entry = {
			let mut state = node.state.write();
			state.write_nonce += 1;
			let mut ent = state.to_md_entry();
			ent.name = new_name.clone();
			ent.parent_id = new_parent_file_id;
			ent
		};
		self.ms.update(&entry)?;
		self.cache
			.move_child(&old_parent, path_basename(path), &new_parent, &new_name)?;
		self.store.rename_path(path, new_path, version)?;
		Ok(())
	}

	/// Unlinks a file, queueing all of its chunks for reclamation.
	pub fn unlink(&self, path: &str) -> Result<()> {
		let node = self.sync().ensure_fresh(path)?;
		let (file_id, version, coordinator, mtime, manifest, entry) = {
			let state = node.state.read();
			(
				state.file_id,
				state.version,
				state.coordinator,
				state.manifest_mtime,
				state.manifest.clone(),
				state.to_md_entry(),
			)
		};

		if coordinator != self.ctx.id {
			let req = RequestData::manifest(
				path,
				file_id,
				version,
				coordinator,
				self.ctx.volume.id,
				self.ctx.id,
				self.ctx.user_id,
				mtime,
			);
			rpc::detach(&self.ctx, self.transport.as_ref(), coordinator, &req)?;
		} else {
			self.ms.delete(&entry)?;
			if let Some(manifest) = manifest {
				let affected: Vec<u64> = manifest.iter().map(|(id, _)| *id).collect();
				self.ms.append_vacuum_log(&VacuumLogEntry {
					volume_id: self.ctx.volume.id,
					writer_id: self.ctx.id,
					file_id,
					file_version: version,
					manifest_mtime: mtime,
					affected_blocks: affected,
				})?;
				self.vacuumer.enqueue(
					VacuumContext::new(path, file_id, version, mtime, Some(manifest)).unlinking(),
				);
			}
		}

		let parent = self.cache.resolve(&path_dirname(path))?;
		self.cache.deferred_remove(&parent, path_basename(path))?;
		self.store.delete_file_version(path, version)?;
		Ok(())
	}

	/// Reads one extended attribute.
	pub fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>> {
		self.sync().ensure_path_fresh(path)?;
		let node = self.cache.resolve(path)?;
		let state = node.state.read();
		state.xattrs.get(name).cloned().ok_or(Error::NotFound)
	}

	/// Writes one extended attribute and bumps the xattr nonce.
	pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> Result<()> {
		self.sync().ensure_path_fresh(path)?;
		let node = self.cache.resolve(path)?;
		let entry = {
			let mut state = node.state.write();
			state.xattrs.insert(name.to_owned(), value.to_vec());
			state.xattr_nonce += 1;
			state.write_nonce += 1;
			state.to_md_entry()
		};
		self.ms.update(&entry)
	}

	/// Lists extended attribute names.
	pub fn listxattr(&self, path: &str) -> Result<Vec<String>> {
		self.sync().ensure_path_fresh(path)?;
		let node = self.cache.resolve(path)?;
		let state = node.state.read();
		let mut names: Vec<String> = state.xattrs.keys().cloned().collect();
		names.sort();
		Ok(names)
	}

	/// Removes one extended attribute.
	pub fn removexattr(&self, path: &str, name: &str) -> Result<()> {
		self.sync().ensure_path_fresh(path)?;
		let node = self.cache.resolve(path)?;
		let entry = {
			let mut state = node.state.write();
			state.xattrs.remove(name).ok_or(Error::NotFound)?;
			state.xattr_nonce += 1;
			state.write_nonce += 1;
			state.to_md_entry()
		};
		self.ms.update(&entry)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::testutil;
	use crate::testutil::BLOCK_SIZE;

	fn pattern(len: usize, seed: u8) -> Vec<u8> {
		(0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
	}

	#[test]
	fn cold_read_of_a_remote_file() {
		// UG-A writes a 3-block file; a fresh UG-B opens and reads it
		let net = testutil::Network::new();
		let ug_a = net.add_ug(10);
		let ug_b = net.add_ug(11);

		let data = pattern(3 * BLOCK_SIZE as usize, 1);
		ug_a.create("/foo", 0o644).unwrap();
		ug_a.write("/foo", 0, &data).unwrap();
		ug_a.flush("/foo").unwrap();

		let node = ug_b.open("/foo").unwrap();
		let got = ug_b.read("/foo", 0, data.len()).unwrap();
		assert_eq!(got.len(), 3 * BLOCK_SIZE as usize);
		assert_eq!(got, data);

		// one path download grafted the inode
		assert_eq!(
			net.ms.path_downloads.load(std::sync::atomic::Ordering::SeqCst),
			1
		);
		// the fetched manifest matches the MS record
		let ms_entry = net.ms.entry("/foo").unwrap();
		{
			let state = node.state.read();
			let manifest = state.manifest.as_ref().unwrap();
			assert_eq!(manifest.len(), 3);
			assert_eq!(manifest.modtime, ms_entry.manifest_mtime);
			for (_, info) in manifest.iter() {
				assert_eq!(info.version, 1);
			}
		}
		ug_b.close(&node);
	}

	#[test]
	fn partial_reads_and_offsets() {
		let net = testutil::Network::new();
		let ug_a = net.add_ug(10);
		let ug_b = net.add_ug(11);

		// a short tail block
		let data = pattern(BLOCK_SIZE as usize + 1000, 3);
		ug_a.create("/tail", 0o644).unwrap();
		ug_a.write("/tail", 0, &data).unwrap();
		ug_a.flush("/tail").unwrap();

		// cross-block read at an unaligned offset
		let got = ug_b.read("/tail", BLOCK_SIZE - 100, 200).unwrap();
		assert_eq!(got, data[(BLOCK_SIZE - 100) as usize..(BLOCK_SIZE + 100) as usize]);

		// reads past the end are clipped
		let got = ug_b.read("/tail", 0, data.len() + 5000).unwrap();
		assert_eq!(got, data);
		assert!(ug_b.read("/tail", data.len() as u64 + 10, 10).unwrap().is_empty());
	}

	#[test]
	fn write_back_replicates_to_every_rg() {
		// S2: one dirty block, flushed through to the replica
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		let rg = net.add_rg(20);

		let data = pattern(BLOCK_SIZE as usize, 7);
		ug.create("/bar", 0o644).unwrap();
		ug.write("/bar", 0, &data).unwrap();
		ug.flush("/bar").unwrap();

		let node = ug.cache.resolve("/bar").unwrap();
		let (file_id, manifest) = {
			let state = node.state.read();
			(state.file_id, state.manifest.clone().unwrap())
		};
		let info = *manifest.get_block(0).unwrap();
		assert_eq!(info.version, 1);
		// identity serialize driver: the digest covers the plain bytes
		assert_eq!(info.hash, Some(chunk::hash(&data)));

		// the replica holds the signed block and the signed manifest
		let block_req = RequestData::block(
			"/bar",
			file_id,
			1,
			10,
			testutil::VOLUME_ID,
			10,
			testutil::USER_ID,
			0,
			1,
		);
		let stored = rg.store.get(&block_req).unwrap();
		let payload = chunk::verify(&ug.ctx, &stored, 10).unwrap();
		assert_eq!(payload, data);

		let ms_entry = net.ms.entry("/bar").unwrap();
		assert_eq!(ms_entry.manifest_mtime, manifest.modtime);
		let manifest_req = RequestData::manifest(
			"/bar",
			file_id,
			1,
			10,
			testutil::VOLUME_ID,
			10,
			testutil::USER_ID,
			ms_entry.manifest_mtime,
		);
		let stored = rg.store.get(&manifest_req).unwrap();
		let payload = chunk::verify(&ug.ctx, &stored, 10).unwrap();
		assert_eq!(chunk::manifest_decode(&payload).unwrap(), manifest);
	}

	#[test]
	fn unaligned_write_fills_from_preimage() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		let _rg = net.add_rg(20);

		let data = pattern(BLOCK_SIZE as usize, 11);
		ug.create("/part", 0o644).unwrap();
		ug.write("/part", 0, &data).unwrap();
		ug.flush("/part").unwrap();

		// overwrite 100 bytes in the middle
		ug.write("/part", 1000, &[0xAA; 100]).unwrap();
		let mut expect = data.clone();
		expect[1000..1100].copy_from_slice(&[0xAA; 100]);

		// dirty buffer serves reads before the flush
		assert_eq!(ug.read("/part", 0, expect.len()).unwrap(), expect);

		ug.flush("/part").unwrap();
		assert_eq!(ug.read("/part", 0, expect.len()).unwrap(), expect);

		let node = ug.cache.resolve("/part").unwrap();
		let state = node.state.read();
		let info = state.manifest.as_ref().unwrap().get_block(0).unwrap();
		assert_eq!(info.version, 2);
	}

	#[test]
	fn stale_manifest_merge_preserves_dirty_writes() {
		// S4: a refresh must not clobber a newer staged entry
		let net = testutil::Network::new();
		let ug_a = net.add_ug(10);
		let ug_b = net.add_ug(11);

		let data = pattern(BLOCK_SIZE as usize, 13);
		ug_a.create("/qux", 0o644).unwrap();
		ug_a.write("/qux", 0, &data).unwrap();
		ug_a.flush("/qux").unwrap();

		// B caches the file, then stages two local writes (version 3)
		let local = pattern(BLOCK_SIZE as usize, 14);
		ug_b.read("/qux", 0, data.len()).unwrap();
		ug_b.write("/qux", 0, &local).unwrap();
		ug_b.write("/qux", 0, &local).unwrap();

		// meanwhile A publishes version 2
		ug_a.write("/qux", 0, &pattern(BLOCK_SIZE as usize, 15)).unwrap();
		ug_a.flush("/qux").unwrap();

		let node = ug_b.cache.resolve("/qux").unwrap();
		node.state
			.write()
			.manifest
			.as_mut()
			.unwrap()
			.set_stale(true);

		let sync = crate::consistency::SyncContext {
			ctx: &ug_b.ctx,
			ms: ug_b.ms.as_ref(),
			transport: ug_b.transport.as_ref(),
			cache: &ug_b.cache,
			store: &ug_b.store,
		};
		sync.ensure_manifest_fresh("/qux").unwrap();

		{
			let state = node.state.read();
			// the strictly newer staged entry survives the merge
			assert_eq!(state.manifest.as_ref().unwrap().get_block(0).unwrap().version, 3);
			assert!(state.dirty.contains_key(&0));
		}

		// the merge is re-runnable without change
		node.state
			.write()
			.manifest
			.as_mut()
			.unwrap()
			.set_stale(true);
		sync.ensure_manifest_fresh("/qux").unwrap();
		let state = node.state.read();
		assert_eq!(state.manifest.as_ref().unwrap().get_block(0).unwrap().version, 3);
		assert!(state.dirty.contains_key(&0));
	}

	#[test]
	fn ms_shrink_truncates_manifest_and_evicts_blocks() {
		// S5: the MS reports a smaller size on refresh
		let net = testutil::Network::new();
		let ug_a = net.add_ug(10);
		let ug_b = net.add_ug(11);

		let data = pattern(5 * BLOCK_SIZE as usize, 17);
		ug_a.create("/baz", 0o644).unwrap();
		ug_a.write("/baz", 0, &data).unwrap();
		ug_a.flush("/baz").unwrap();

		// B reads everything, caching all five blocks locally
		assert_eq!(ug_b.read("/baz", 0, data.len()).unwrap(), data);
		let node = ug_b.cache.resolve("/baz").unwrap();
		let file_id = node.state.read().file_id;
		let block_req = |id: u64| {
			RequestData::block(
				"/baz",
				file_id,
				1,
				10,
				testutil::VOLUME_ID,
				11,
				testutil::USER_ID,
				id,
				1,
			)
		};
		for id in 0..5 {
			assert!(ug_b.store.contains(&block_req(id)));
		}

		// the MS now says the file is two blocks long
		let mut shrunk = net.ms.entry("/baz").unwrap();
		shrunk.size = 2 * BLOCK_SIZE;
		shrunk.write_nonce += 1;
		net.ms.seed("/baz", shrunk);

		node.state.write().read_stale = true;
		let sync = crate::consistency::SyncContext {
			ctx: &ug_b.ctx,
			ms: ug_b.ms.as_ref(),
			transport: ug_b.transport.as_ref(),
			cache: &ug_b.cache,
			store: &ug_b.store,
		};
		sync.ensure_path_fresh("/baz").unwrap();

		{
			let state = node.state.read();
			assert_eq!(state.size, 2 * BLOCK_SIZE);
			let manifest = state.manifest.as_ref().unwrap();
			assert_eq!(manifest.len(), 2);
			assert!(manifest.get_block(0).is_some());
			assert!(manifest.get_block(1).is_some());
			assert!(manifest.get_block(2).is_none());
		}
		for id in 0..2 {
			assert!(ug_b.store.contains(&block_req(id)));
		}
		for id in 2..5 {
			assert!(!ug_b.store.contains(&block_req(id)));
		}
	}

	#[test]
	fn truncate_at_the_coordinator() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		let _rg = net.add_rg(20);

		let data = pattern(3 * BLOCK_SIZE as usize, 19);
		ug.create("/cut", 0o644).unwrap();
		ug.write("/cut", 0, &data).unwrap();
		ug.flush("/cut").unwrap();

		ug.truncate("/cut", BLOCK_SIZE).unwrap();
		let node = ug.cache.resolve("/cut").unwrap();
		{
			let state = node.state.read();
			assert_eq!(state.size, BLOCK_SIZE);
			assert_eq!(state.manifest.as_ref().unwrap().len(), 1);
		}
		assert_eq!(net.ms.entry("/cut").unwrap().size, BLOCK_SIZE);
		assert_eq!(
			ug.read("/cut", 0, data.len()).unwrap(),
			data[..BLOCK_SIZE as usize]
		);
	}

	#[test]
	fn rename_updates_ms_and_cache() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);

		ug.create("/old.txt", 0o644).unwrap();
		ug.rename("/old.txt", "/new.txt").unwrap();

		assert!(net.ms.entry("/old.txt").is_none());
		assert!(net.ms.entry("/new.txt").is_some());
		assert!(ug.cache.resolve("/old.txt").is_err());
		assert_eq!(
			ug.cache.resolve("/new.txt").unwrap().state.read().name,
			"new.txt"
		);
	}

	#[test]
	fn rename_across_directories() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);

		ug.mkdir("/sub", 0o755).unwrap();
		ug.create("/sub/peer.txt", 0o644).unwrap();
		ug.create("/a.txt", 0o644).unwrap();
		let sub_file_id = net.ms.entry("/sub").unwrap().file_id;

		ug.rename("/a.txt", "/sub/a2.txt").unwrap();

		// the MS re-keyed the entry under its new parent
		assert!(net.ms.entry("/a.txt").is_none());
		let moved = net.ms.entry("/sub/a2.txt").unwrap();
		assert_eq!(moved.name, "a2.txt");
		assert_eq!(moved.parent_id, sub_file_id);
		// the new parent handed out a fresh generation
		let peer = net.ms.entry("/sub/peer.txt").unwrap();
		assert!(moved.generation > peer.generation);

		// and so did the cache
		assert!(ug.cache.resolve("/a.txt").is_err());
		let node = ug.cache.resolve("/sub/a2.txt").unwrap();
		{
			let state = node.state.read();
			assert_eq!(state.name, "a2.txt");
			assert_eq!(state.parent_id, sub_file_id);
		}

		// a collision under the destination refuses the move
		ug.create("/b.txt", 0o644).unwrap();
		assert!(matches!(
			ug.rename("/b.txt", "/sub/a2.txt"),
			Err(Error::AlreadyExists)
		));
		assert!(net.ms.entry("/b.txt").is_some());
	}

	#[test]
	fn unlink_removes_entry_and_queues_vacuum() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		let _rg = net.add_rg(20);
		ug.vacuumer.stop();

		let data = pattern(BLOCK_SIZE as usize, 23);
		ug.create("/gone", 0o644).unwrap();
		ug.write("/gone", 0, &data).unwrap();
		ug.flush("/gone").unwrap();
		let file_id = net.ms.entry("/gone").unwrap().file_id;

		ug.unlink("/gone").unwrap();
		assert!(net.ms.entry("/gone").is_none());
		assert!(ug.cache.resolve("/gone").is_err());
		// the flush entry plus the unlink entry await the vacuumer
		assert_eq!(net.ms.vacuum_backlog(file_id), 2);
	}

	#[test]
	fn readdir_lists_fresh_children() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);

		ug.create("/a.txt", 0o644).unwrap();
		ug.create("/b.txt", 0o644).unwrap();
		ug.mkdir("/sub", 0o755).unwrap();

		let mut names: Vec<String> = ug
			.readdir("/")
			.unwrap()
			.into_iter()
			.map(|ent| ent.name)
			.collect();
		names.sort();
		assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);

		// every fetched generation is below the next-unknown mark
		let root = ug.cache.root();
		let state = root.state.read();
		let lug = state.least_unknown_generation;
		for id in state.children.values() {
			let child = ug.cache.node(*id).unwrap();
			assert!(child.state.read().generation <= lug);
		}
	}

	#[test]
	fn xattrs_round_trip_and_bump_the_nonce() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);

		ug.create("/x", 0o644).unwrap();
		let nonce0 = net.ms.entry("/x").unwrap().xattr_nonce;

		ug.setxattr("/x", "user.color", b"teal").unwrap();
		assert_eq!(ug.getxattr("/x", "user.color").unwrap(), b"teal");
		assert_eq!(ug.listxattr("/x").unwrap(), vec!["user.color"]);
		assert!(net.ms.entry("/x").unwrap().xattr_nonce > nonce0);

		ug.removexattr("/x", "user.color").unwrap();
		assert!(matches!(
			ug.getxattr("/x", "user.color"),
			Err(Error::NotFound)
		));
	}

	#[test]
	fn create_collision_is_rejected() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		ug.create("/dup", 0o644).unwrap();
		assert!(matches!(
			ug.create("/dup", 0o644),
			Err(Error::AlreadyExists)
		));
	}
}
