//! Revalidation of cached metadata and manifests.
//!
//! Three refresh primitives implement open/stat/read consistency: manifest
//! freshness (download and merge from the coordinator, then the replicas),
//! path freshness (reconcile the cached prefix against the MS and graft
//! the unresolved tail), and directory freshness (full or incremental
//! child listings). The reconciliation rule applied to one cached inode
//! and one fresh MS entry is deterministic.

use crate::cache::FsCache;
use crate::cache::Node;
use crate::error::Error;
use crate::error::Result;
use crate::gateway::GatewayContext;
use crate::inode::Inode;
use crate::manifest::Manifest;
use crate::ms::MdEntry;
use crate::ms::MsClient;
use crate::ms::MsListing;
use crate::request::RequestData;
use crate::rpc;
use crate::rpc::Transport;
use crate::storage::ChunkStore;
use crate::util::TimeSpec;
use log::debug;
use log::warn;
use std::sync::Arc;

/// Everything a refresh needs, borrowed from the owning gateway.
pub struct SyncContext<'a> {
	/// Gateway identity and volume view.
	pub ctx: &'a GatewayContext,
	/// Metadata-service client.
	pub ms: &'a dyn MsClient,
	/// Gateway-to-gateway transport.
	pub transport: &'a dyn Transport,
	/// The inode cache.
	pub cache: &'a Arc<FsCache>,
	/// The local chunk store, for cache eviction on truncate and
	/// reversioning.
	pub store: &'a ChunkStore,
}

impl<'a> SyncContext<'a> {
	/// Makes `path` fully fresh: metadata, graft, and (for files) the
	/// manifest. Returns the resolved node.
	pub fn ensure_fresh(&self, path: &str) -> Result<Arc<Node>> {
		self.ensure_path_fresh(path)?;
		let node = self.cache.resolve(path)?;
		let is_file = node.state.read().is_file();
		if is_file {
			self.ensure_manifest_fresh(path)?;
		}
		Ok(node)
	}

	/// Revalidates every cached inode along `path` and grafts the
	/// unresolved tail from the MS.
	pub fn ensure_path_fresh(&self, path: &str) -> Result<()> {
		let now = TimeSpec::now();
		let (chain, _) = self.cache.resolve_prefix(path);

		// reconcile the stale part of the cached prefix
		let mut stale: Vec<(Option<Arc<Node>>, Arc<Node>, String)> = Vec::new();
		let mut walked = String::new();
		for (i, node) in chain.iter().enumerate() {
			let state = node.state.read();
			if i > 0 {
				walked.push('/');
				walked.push_str(&state.name);
			}
			let fs_path = if i == 0 { "/".to_owned() } else { walked.clone() };
			if state.is_read_stale(&now) {
				let parent = if i == 0 {
					None
				} else {
					Some(Arc::clone(&chain[i - 1]))
				};
				stale.push((parent, Arc::clone(node), fs_path));
			}
		}

		if !stale.is_empty() {
			let paths: Vec<String> = stale.iter().map(|(_, _, p)| p.clone()).collect();
			let listings = self.ms.getattr_multi(self.ctx.volume.id, &paths)?;
			for ((parent, node, fs_path), listing) in stale.into_iter().zip(listings) {
				match listing {
					MsListing::Entry(ent) => {
						self.reconcile(parent.as_ref(), &node, &fs_path, &ent)?;
					}
					MsListing::NotChanged => {
						node.state.write().refresh_time = now;
					}
					MsListing::None => {
						// the subtree is gone upstream
						if let Some(parent) = parent {
							let name = node.state.read().name.clone();
							self.cache.deferred_remove(&parent, &name)?;
						}
					}
				}
			}
		}

		// graft the unresolved tail
		let (chain, remaining) = self.cache.resolve_prefix(path);
		if remaining.is_empty() {
			return Ok(());
		}
		let entries = self.ms.path_download(self.ctx.volume.id, path)?;
		let resolved = chain.len() - 1;
		if entries.len() < resolved + remaining.len() {
			return Err(Error::ProtocolMismatch(
				"path download returned a short entry chain".to_owned(),
			));
		}
		let graft: Vec<Inode> = entries[resolved..]
			.iter()
			.map(|ent| {
				let mut inode = Inode::from_md_entry(ent);
				inode.refresh_time = now;
				inode
			})
			.collect();
		let attach_under = chain.last().expect("chain holds the root");
		self.cache.attach_graft(attach_under, graft)?;
		debug!("grafted {} entries under {}", remaining.len(), path);
		Ok(())
	}

	/// Verifies that the manifest of the file at `path` is fresh,
	/// downloading and merging the latest one if not.
	pub fn ensure_manifest_fresh(&self, path: &str) -> Result<()> {
		let node = self.cache.resolve(path)?;
		let now = TimeSpec::now();

		// decide under the read lock
		let (file_id, file_version, coordinator, mtime, local_coordinator) = {
			let state = node.state.read();
			let manifest = state
				.manifest
				.as_ref()
				.ok_or_else(|| Error::InvalidArgument("not a regular file".to_owned()))?;
			let local_coordinator = state.coordinator == self.ctx.id;
			if local_coordinator && !manifest.is_stale() {
				// the coordinator holds the freshest version by definition
				return Ok(());
			}
			if !manifest.is_stale()
				&& now.diff_ms(&state.manifest_refresh_time) <= state.max_read_freshness
			{
				return Ok(());
			}
			(
				state.file_id,
				state.version,
				state.coordinator,
				state.manifest_mtime,
				local_coordinator,
			)
		};

		let req = RequestData::manifest(
			path,
			file_id,
			file_version,
			coordinator,
			self.ctx.volume.id,
			self.ctx.id,
			self.ctx.user_id,
			mtime,
		);
		let mut candidates = self.ctx.download_gateway_list(coordinator);
		if local_coordinator {
			candidates.retain(|id| *id != self.ctx.id);
		}
		let fresh = manifest_download(self.ctx, self.transport, &req, &candidates)?;

		let mut evict: Option<Option<u64>> = None;
		{
			let mut state = node.state.write();
			if state.manifest.is_none() {
				return Err(Error::InvalidArgument("not a regular file".to_owned()));
			}

			// versions staged by unflushed local writes, before the merge
			let staged: Vec<(u64, i64)> = {
				let manifest = state.manifest.as_ref().expect("checked above");
				state
					.dirty
					.keys()
					.map(|id| {
						let v = manifest.get_block(*id).map(|i| i.version).unwrap_or(0);
						(*id, v)
					})
					.collect()
			};

			let old_modtime = state.manifest.as_ref().expect("checked above").modtime;
			state.manifest.as_mut().expect("checked above").patch(&fresh);

			if local_coordinator {
				// enforce the authoritative size and keep our own modtime
				if fresh.size < state.size {
					let block_size = self.ctx.block_size();
					state
						.manifest
						.as_mut()
						.expect("checked above")
						.truncate_to_size(fresh.size, block_size);
					state.size = fresh.size;
					evict = Some(Manifest::max_block_id(fresh.size, block_size));
				}
				state.manifest.as_mut().expect("checked above").modtime = old_modtime;
			} else {
				state.manifest.as_mut().expect("checked above").modtime = fresh.modtime;
			}

			// dirty blocks a remote write overtook are dropped
			for (id, staged_version) in staged {
				let overtaken = fresh
					.get_block(id)
					.map(|r| r.version > staged_version)
					.unwrap_or(false);
				if overtaken {
					state.dirty.remove(&id);
				}
			}

			state.manifest.as_mut().expect("checked above").set_stale(false);
			state.manifest_refresh_time = TimeSpec::now();
		}
		if let Some(max_id) = evict {
			self.store.evict_blocks_beyond(path, file_version, max_id)?;
		}
		Ok(())
	}

	/// Revalidates a directory's child listing.
	pub fn ensure_dir_fresh(&self, path: &str) -> Result<()> {
		let node = self.cache.resolve(path)?;
		let refresh_start = TimeSpec::now();

		let (file_id, lug, first_fetch, stale) = {
			let state = node.state.read();
			if !state.is_dir() {
				return Err(Error::InvalidArgument("not a directory".to_owned()));
			}
			(
				state.file_id,
				state.least_unknown_generation,
				state.least_unknown_generation == 0,
				state.is_read_stale(&refresh_start),
			)
		};
		if !stale && !first_fetch {
			return Ok(());
		}

		let entries = if first_fetch {
			self.ms.listdir(self.ctx.volume.id, file_id)?
		} else {
			self.ms.diffdir(self.ctx.volume.id, file_id, lug)?
		};

		let mut max_generation = lug.saturating_sub(1);
		let mut incoming_names = Vec::with_capacity(entries.len());
		for ent in &entries {
			max_generation = max_generation.max(ent.generation);
			incoming_names.push(ent.name.clone());
			let child_path = if path == "/" {
				format!("/{}", ent.name)
			} else {
				format!("{}/{}", path, ent.name)
			};
			let cached = node.state.read().children.get(&ent.name).copied();
			match cached.and_then(|id| self.cache.node(id)) {
				Some(child) => {
					let ctime = child.state.read().ctime;
					if ctime < refresh_start {
						self.reconcile(Some(&node), &child, &child_path, ent)?;
					}
					// a child created after the refresh began is preserved
				}
				None => {
					let mut inode = Inode::from_md_entry(ent);
					inode.refresh_time = refresh_start;
					self.cache.attach(&node, inode)?;
				}
			}
		}

		// a full listing is authoritative: drop children it omits
		if first_fetch {
			let gone: Vec<String> = {
				let state = node.state.read();
				state
					.children
					.keys()
					.filter(|name| !incoming_names.contains(*name))
					.cloned()
					.collect()
			};
			for name in gone {
				let child = node.state.read().children.get(&name).copied();
				if let Some(child) = child.and_then(|id| self.cache.node(id)) {
					// preserve locally-created children the MS has not
					// seen yet
					if child.state.read().ctime >= refresh_start {
						continue;
					}
				}
				self.cache.deferred_remove(&node, &name)?;
			}
		}

		let mut state = node.state.write();
		state.least_unknown_generation = max_generation + 1;
		state.num_children = state.children.len() as u64;
		state.refresh_time = TimeSpec::now();
		Ok(())
	}

	/// Reconciles one cached inode against a fresh MS entry.
	///
	/// Runs the fixed rule sequence: type change, reversion, shrink,
	/// rename, manifest staleness, xattr purge, scalar copy. Returns the
	/// node holding the entry afterwards (a new one on type change).
	pub fn reconcile(
		&self,
		parent: Option<&Arc<Node>>,
		node: &Arc<Node>,
		fs_path: &str,
		ent: &MdEntry,
	) -> Result<Arc<Node>> {
		let now = TimeSpec::now();

		// 1. type change: detach and replace
		let cached_type = node.state.read().entry_type;
		if cached_type != ent.entry_type {
			let parent = parent.ok_or_else(|| {
				Error::InvalidArgument("the volume root cannot change type".to_owned())
			})?;
			let name = node.state.read().name.clone();
			self.cache.deferred_remove(parent, &name)?;
			let mut inode = Inode::from_md_entry(ent);
			inode.refresh_time = now;
			if let Some(manifest) = inode.manifest.as_mut() {
				// the replacement's data is unknown; force a refetch
				manifest.set_stale(true);
			}
			return self.cache.attach(parent, inode);
		}

		// 4. rename happens first so later steps see the final name
		let cached_name = node.state.read().name.clone();
		if cached_name != ent.name {
			if let Some(parent) = parent {
				self.cache.rename_child(parent, &cached_name, &ent.name)?;
			}
		}

		let mut state = node.state.write();

		// 2. reversion: move the cached version namespace forward
		if state.version != ent.version {
			self.store.reversion(fs_path, state.version, ent.version)?;
			if let Some(manifest) = state.manifest.as_mut() {
				manifest.file_version = ent.version;
			}
			state.replaced.file_version = ent.version;
			state.version = ent.version;
		}

		// 3. shrink: evict blocks past the new end of file
		if state.is_file() && ent.size < state.size {
			let block_size = self.ctx.block_size();
			let max_id = Manifest::max_block_id(ent.size, block_size);
			if let Some(manifest) = state.manifest.as_mut() {
				manifest.truncate_to_size(ent.size, block_size);
			}
			self.store.evict_blocks_beyond(fs_path, ent.version, max_id)?;
		}

		// 5. a foreign write moved the manifest: mark it stale
		if state.coordinator != self.ctx.id && state.manifest_mtime != ent.manifest_mtime {
			if let Some(manifest) = state.manifest.as_mut() {
				manifest.set_stale(true);
			}
		}

		// 6. xattr churn invalidates the cached set
		if state.xattr_nonce != ent.xattr_nonce {
			state.purge_xattrs();
		}

		// 7. scalar copy-forward
		state.owner = ent.owner;
		state.coordinator = ent.coordinator;
		state.mode = ent.mode;
		state.size = ent.size;
		state.ctime = ent.ctime;
		state.mtime = ent.mtime;
		state.manifest_mtime = ent.manifest_mtime;
		state.write_nonce = ent.write_nonce;
		state.xattr_nonce = ent.xattr_nonce;
		state.generation = ent.generation;
		state.parent_id = ent.parent_id;
		state.max_read_freshness = ent.max_read_freshness;
		state.max_write_freshness = ent.max_write_freshness;
		if state.is_dir() {
			state.num_children = state.num_children.max(ent.num_children);
		}
		if let Some(manifest) = state.manifest.as_mut() {
			manifest.coordinator_id = ent.coordinator;
		}
		state.read_stale = false;
		state.refresh_time = now;
		Ok(Arc::clone(node))
	}
}

/// Downloads a manifest, trying each gateway in order.
///
/// Returns the first manifest that arrives and verifies; `NoData` when
/// every candidate fails.
pub fn manifest_download(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	req: &RequestData,
	gateway_ids: &[u64],
) -> Result<Manifest> {
	if !req.is_manifest() {
		return Err(Error::InvalidArgument(
			"manifest download needs a manifest request".to_owned(),
		));
	}
	for dest in gateway_ids {
		match rpc::get_manifest(ctx, transport, *dest, req) {
			Ok(manifest) => return Ok(manifest),
			Err(e) => {
				warn!("manifest {} from gateway {}: {}", req, dest, e);
			}
		}
	}
	Err(Error::NoData)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::ms::EntryType;
	use crate::testutil;
	use crate::ug::UgState;
	use std::sync::Arc as StdArc;

	fn sync_of(ug: &StdArc<UgState>) -> SyncContext<'_> {
		SyncContext {
			ctx: &ug.ctx,
			ms: ug.ms.as_ref(),
			transport: ug.transport.as_ref(),
			cache: &ug.cache,
			store: &ug.store,
		}
	}

	#[test]
	fn unresolved_tail_is_grafted_from_the_ms() {
		let net = testutil::Network::new();
		let ug_a = net.add_ug(10);
		let ug_b = net.add_ug(11);

		ug_a.mkdir("/a", 0o755).unwrap();
		ug_a.mkdir("/a/b", 0o755).unwrap();
		ug_a.create("/a/b/c.txt", 0o644).unwrap();

		sync_of(&ug_b).ensure_path_fresh("/a/b/c.txt").unwrap();
		let node = ug_b.cache.resolve("/a/b/c.txt").unwrap();
		assert!(node.state.read().is_file());
		assert!(ug_b.cache.resolve("/a/b").unwrap().state.read().is_dir());
	}

	#[test]
	fn gone_entries_are_deferred_removed() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);

		ug.mkdir("/d", 0o755).unwrap();
		let ent = net.ms.entry("/d").unwrap();
		net.ms.delete(&ent).unwrap();

		let node = ug.cache.resolve("/d").unwrap();
		node.state.write().read_stale = true;
		// the refresh drops the subtree, then fails to re-download it
		assert!(matches!(
			sync_of(&ug).ensure_path_fresh("/d"),
			Err(Error::NotFound)
		));
		ug.cache.drain_removals();
		assert!(ug.cache.resolve("/d").is_err());
	}

	#[test]
	fn reconcile_replaces_on_type_change() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);

		ug.create("/t", 0o644).unwrap();
		let mut ent = net.ms.entry("/t").unwrap();
		ent.entry_type = EntryType::Dir;
		ent.size = 0;
		net.ms.seed("/t", ent);

		let node = ug.cache.resolve("/t").unwrap();
		node.state.write().read_stale = true;
		sync_of(&ug).ensure_path_fresh("/t").unwrap();

		let fresh = ug.cache.resolve("/t").unwrap();
		assert!(fresh.state.read().is_dir());
		assert_ne!(fresh.id, node.id);
	}

	#[test]
	fn reconcile_reversion_moves_the_version_namespace() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		ug.create("/rev", 0o644).unwrap();
		ug.write("/rev", 0, &[1u8; 100]).unwrap();
		ug.flush("/rev").unwrap();

		let mut ent = net.ms.entry("/rev").unwrap();
		ent.version = 2;
		ent.write_nonce += 1;
		net.ms.seed("/rev", ent);

		let node = ug.cache.resolve("/rev").unwrap();
		node.state.write().read_stale = true;
		sync_of(&ug).ensure_path_fresh("/rev").unwrap();

		let state = node.state.read();
		assert_eq!(state.version, 2);
		assert_eq!(state.manifest.as_ref().unwrap().file_version, 2);
	}

	#[test]
	fn reconcile_purges_xattrs_on_nonce_change() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		ug.create("/x", 0o644).unwrap();
		ug.setxattr("/x", "user.a", b"1").unwrap();

		let mut ent = net.ms.entry("/x").unwrap();
		ent.xattr_nonce += 10;
		net.ms.seed("/x", ent);

		let node = ug.cache.resolve("/x").unwrap();
		node.state.write().read_stale = true;
		sync_of(&ug).ensure_path_fresh("/x").unwrap();
		assert!(node.state.read().xattrs.is_empty());
	}

	#[test]
	fn reconcile_is_a_fixed_point() {
		// applying the same MS entry twice must land on the same state
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		ug.create("/fp", 0o644).unwrap();

		let mut ent = net.ms.entry("/fp").unwrap();
		ent.size = 12345;
		ent.mode = 0o600;
		ent.write_nonce += 1;

		let parent = ug.cache.root();
		let node = ug.cache.resolve("/fp").unwrap();
		let sync = sync_of(&ug);
		sync.reconcile(Some(&parent), &node, "/fp", &ent).unwrap();
		let first = node.state.read().to_md_entry();
		sync.reconcile(Some(&parent), &node, "/fp", &ent).unwrap();
		let second = node.state.read().to_md_entry();
		assert_eq!(
			(first.size, first.mode, first.version, first.write_nonce),
			(second.size, second.mode, second.version, second.write_nonce)
		);
	}

	#[test]
	fn full_listing_drops_vanished_children() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);

		ug.mkdir("/dir", 0o755).unwrap();
		ug.create("/dir/a", 0o644).unwrap();
		ug.create("/dir/b", 0o644).unwrap();
		ug.readdir("/dir").unwrap();

		let ent = net.ms.entry("/dir/b").unwrap();
		net.ms.delete(&ent).unwrap();

		// force another unbounded listing
		let node = ug.cache.resolve("/dir").unwrap();
		{
			let mut state = node.state.write();
			state.least_unknown_generation = 0;
			state.read_stale = true;
		}
		sync_of(&ug).ensure_dir_fresh("/dir").unwrap();
		ug.cache.drain_removals();

		assert!(ug.cache.resolve("/dir/a").is_ok());
		assert!(ug.cache.resolve("/dir/b").is_err());
		assert_eq!(node.state.read().num_children, 1);
	}

	#[test]
	fn incremental_listing_picks_up_new_children() {
		let net = testutil::Network::new();
		let ug_a = net.add_ug(10);
		let ug_b = net.add_ug(11);

		ug_a.mkdir("/inc", 0o755).unwrap();
		ug_a.create("/inc/a", 0o644).unwrap();
		ug_b.readdir("/inc").unwrap();
		let lug = {
			let node = ug_b.cache.resolve("/inc").unwrap();
			let lug = node.state.read().least_unknown_generation;
			assert!(lug > 0);
			lug
		};

		// a second child appears upstream
		ug_a.create("/inc/late", 0o644).unwrap();
		let node = ug_b.cache.resolve("/inc").unwrap();
		node.state.write().read_stale = true;
		sync_of(&ug_b).ensure_dir_fresh("/inc").unwrap();

		assert!(ug_b.cache.resolve("/inc/late").is_ok());
		let state = node.state.read();
		assert_eq!(state.num_children, 2);
		assert!(state.least_unknown_generation > lug);
	}
}
