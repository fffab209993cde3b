//! Verb handlers a user gateway serves to its peers.

use super::UgState;
use crate::chunk;
use crate::error::Error;
use crate::error::Result;
use crate::manifest::Manifest;
use crate::ms::VacuumLogEntry;
use crate::request::RequestData;
use crate::rpc::GatewayServer;
use crate::ug::vacuum::VacuumContext;
use crate::util::TimeSpec;
use crate::wire::ChunkDescriptor;
use log::debug;
use std::sync::Arc;

/// The user-gateway server: every verb, plus the local-read fast path.
pub struct UgServer {
	state: Arc<UgState>,
}

impl UgServer {
	/// Wraps a UG state for serving.
	pub fn new(state: Arc<UgState>) -> Self {
		Self { state }
	}

	fn require_coordinator(&self, req: &RequestData) -> Result<()> {
		let node = self.state.cache.resolve(&req.fs_path)?;
		let coordinator = node.state.read().coordinator;
		if coordinator != self.state.ctx.id {
			return Err(Error::NotCoordinator);
		}
		Ok(())
	}
}

impl GatewayServer for UgServer {
	fn get_block(&self, req: &RequestData) -> Result<Vec<u8>> {
		let (block_id, block_version) = req.block_coords()?;
		let node = self.state.cache.resolve(&req.fs_path)?;

		// dirty buffers and the local cache come first
		let plain = {
			let state = node.state.read();
			if let Some(dirty) = state.dirty.get(&block_id) {
				let staged = state
					.manifest
					.as_ref()
					.and_then(|m| m.get_block(block_id))
					.map(|i| i.version)
					.unwrap_or(0);
				if staged == block_version {
					Some(dirty.buf.clone())
				} else {
					None
				}
			} else {
				None
			}
		};
		let plain = match plain {
			Some(plain) => plain,
			None => {
				let held = node
					.state
					.read()
					.manifest
					.as_ref()
					.and_then(|m| m.get_block(block_id))
					.map(|i| i.version);
				if held != Some(block_version) {
					return Err(Error::NotFound);
				}
				self.state.store.get(req)?
			}
		};

		let wire_bytes = chunk::serialize(&self.state.driver, req, &plain)?;
		chunk::sign(&self.state.ctx, req, &wire_bytes)
	}

	fn get_manifest(&self, req: &RequestData) -> Result<Vec<u8>> {
		let node = self.state.cache.resolve(&req.fs_path)?;
		let (manifest, coordinator) = {
			let state = node.state.read();
			(state.manifest.clone(), state.coordinator)
		};
		// only the coordinator's manifest is authoritative
		if coordinator != self.state.ctx.id {
			return Err(Error::Stale);
		}
		let manifest = manifest.ok_or(Error::NotFound)?;

		let sign_req = RequestData::manifest(
			&req.fs_path,
			manifest.file_id,
			manifest.file_version,
			self.state.ctx.id,
			self.state.ctx.volume.id,
			self.state.ctx.id,
			req.user_id,
			manifest.modtime,
		);
		let encoded = chunk::manifest_encode(&self.state.ctx, &manifest)?;
		chunk::sign(&self.state.ctx, &sign_req, &encoded)
	}

	fn put_block(&self, req: &RequestData, data: Vec<u8>) -> Result<()> {
		if req.coordinator_id != self.state.ctx.id {
			return Err(Error::NotCoordinator);
		}
		// verify against the writer, then cache the plain bytes
		let wire_bytes = chunk::verify(&self.state.ctx, &data, req.src_gateway_id)?;
		let plain = chunk::deserialize(&self.state.driver, req, &wire_bytes)?;
		self.state.store.put(req, &plain)
	}

	fn put_manifest(&self, req: &RequestData, data: Vec<u8>) -> Result<()> {
		let payload = chunk::verify(&self.state.ctx, &data, req.src_gateway_id)?;
		let manifest = chunk::manifest_decode(&payload)?;
		if manifest.coordinator_id != req.src_gateway_id {
			// the sender's volume view is behind; tell it to refresh
			return Err(Error::Stale);
		}
		self.patch_manifest(req, manifest)
	}

	fn delete_chunks(&self, req: &RequestData, chunks: &[ChunkDescriptor]) -> Result<()> {
		for desc in chunks {
			let target = match desc {
				ChunkDescriptor::Manifest { mtime } => crate::request::RequestTarget::Manifest {
					timestamp: *mtime,
				},
				ChunkDescriptor::Block {
					block_id,
					block_version,
				} => crate::request::RequestTarget::Block {
					block_id: *block_id,
					block_version: *block_version,
				},
			};
			let mut one = req.clone();
			one.target = target;
			self.state.store.delete(&one)?;
		}
		Ok(())
	}

	fn rename(&self, req: &RequestData, new_fs_path: &str) -> Result<()> {
		self.require_coordinator(req)?;
		self.state.rename(&req.fs_path, new_fs_path)
	}

	fn truncate(&self, req: &RequestData, new_size: u64) -> Result<()> {
		self.require_coordinator(req)?;
		self.state.truncate(&req.fs_path, new_size)
	}

	fn detach(&self, req: &RequestData) -> Result<()> {
		self.require_coordinator(req)?;
		self.state.unlink(&req.fs_path)
	}

	fn patch_manifest(&self, req: &RequestData, delta: Manifest) -> Result<()> {
		let node = self.state.cache.resolve(&req.fs_path)?;
		let ug = &self.state;

		let (entry, replaced, old_mtime, file_id, version) = {
			let mut state = node.state.write();
			if state.coordinator != ug.ctx.id {
				// a patch reaching a non-coordinator is a staleness
				// signal for both sides
				if let Some(m) = state.manifest.as_mut() {
					m.set_stale(true);
				}
				return Err(Error::NotCoordinator);
			}
			let old_mtime = state.manifest_mtime;
			let file_id = state.file_id;
			let version = state.version;

			let manifest = state.manifest.as_mut().ok_or(Error::NotFound)?;
			let mut replaced = Manifest::new(ug.ctx.volume.id, ug.ctx.id, file_id, version);
			for (id, info) in delta.iter() {
				if let Some(cur) = manifest.get_block(*id) {
					if cur.version < info.version {
						replaced.put_block(*id, *cur, true)?;
					}
				}
			}
			manifest.patch(&delta);

			let new_mtime = TimeSpec::now();
			manifest.modtime = new_mtime;
			state.manifest_mtime = new_mtime;
			state.mtime = new_mtime;
			state.write_nonce += 1;
			(state.to_md_entry(), replaced, old_mtime, file_id, version)
		};

		debug!(
			"patched manifest of {:X}.{} with {} entries from gateway {}",
			file_id,
			version,
			delta.len(),
			req.src_gateway_id
		);
		ug.ms.update(&entry)?;

		if !replaced.is_empty() {
			let affected: Vec<u64> = replaced.iter().map(|(id, _)| *id).collect();
			ug.ms.append_vacuum_log(&VacuumLogEntry {
				volume_id: ug.ctx.volume.id,
				writer_id: ug.ctx.id,
				file_id,
				file_version: version,
				manifest_mtime: old_mtime,
				affected_blocks: affected,
			})?;
			ug.vacuumer.enqueue(VacuumContext::new(
				&req.fs_path,
				file_id,
				version,
				old_mtime,
				Some(replaced),
			));
		}
		Ok(())
	}
}
