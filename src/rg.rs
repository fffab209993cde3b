//! Replica-gateway server: stage and serve durable chunk copies.
//!
//! Every request translates into a driver "read"/"write"/"delete"
//! invocation when a storage driver is installed; without one, chunks go
//! to the built-in disk backend. The UG-specific verbs (rename, truncate,
//! detach, patch-manifest) are not served here. A replica stores the
//! already-serialized signed bytes verbatim and never sees plaintext.

use crate::chunk;
use crate::driver::Driver;
use crate::driver::DriverRole;
use crate::error::Error;
use crate::error::Result;
use crate::gateway::GatewayContext;
use crate::request::RequestData;
use crate::request::RequestTarget;
use crate::rpc::GatewayServer;
use crate::storage::ChunkStore;
use crate::storage::MetadataStore;
use crate::storage::UploadMetadata;
use crate::storage::UploadProgress;
use crate::wire::ChunkDescriptor;
use log::debug;
use std::sync::Arc;

/// Shared state of one replica gateway.
pub struct RgState {
	/// Gateway identity and volume view.
	pub ctx: Arc<GatewayContext>,
	/// Built-in disk backend.
	pub store: Arc<ChunkStore>,
	/// Persisted upload-progress records.
	pub meta: Arc<MetadataStore>,
	/// Storage-driver pools.
	pub driver: Arc<Driver>,
}

impl RgState {
	/// Brings a replica gateway up.
	pub fn new(ctx: Arc<GatewayContext>, driver: Arc<Driver>) -> Result<Arc<Self>> {
		let store = Arc::new(ChunkStore::open(&ctx.config.storage_root)?);
		let meta = Arc::new(MetadataStore::open(
			&ctx.config.metadata_root,
			ctx.session_id,
		)?);
		Ok(Arc::new(Self {
			ctx,
			store,
			meta,
			driver,
		}))
	}
}

/// The replica-gateway server.
pub struct RgServer {
	state: Arc<RgState>,
}

impl RgServer {
	/// Wraps an RG state for serving.
	pub fn new(state: Arc<RgState>) -> Self {
		Self { state }
	}

	fn fetch(&self, req: &RequestData) -> Result<Vec<u8>> {
		if self.state.driver.has_role(DriverRole::Read) {
			let data = self.state.driver.dispatch(DriverRole::Read, req, None, false)?;
			return data.ok_or_else(|| Error::Io("read driver returned no chunk".to_owned()));
		}
		self.state.store.get(req)
	}

	fn stage(&self, req: &RequestData, data: &[u8]) -> Result<()> {
		let (block_id, block_version) = match req.target {
			RequestTarget::Block {
				block_id,
				block_version,
			} => (block_id, block_version),
			// manifests share the metadata namespace under their own ids
			RequestTarget::Manifest { timestamp } => (u64::MAX, timestamp.sec),
		};
		let record = UploadMetadata {
			fs_path: req.fs_path.clone(),
			file_version: req.file_version,
			block_id,
			block_version,
			progress: UploadProgress::Started,
			session_id: 0,
			write_time: 0,
		};
		self.state.meta.store(&record, true)?;

		if self.state.driver.has_role(DriverRole::Write) {
			self.state
				.driver
				.dispatch(DriverRole::Write, req, Some(data), true)?;
		} else {
			self.state.store.put(req, data)?;
		}

		let committed = UploadMetadata {
			progress: UploadProgress::Committed,
			..record
		};
		self.state.meta.store(&committed, true)?;
		Ok(())
	}

	fn discard(&self, req: &RequestData) -> Result<()> {
		if self.state.driver.has_role(DriverRole::Delete) {
			self.state
				.driver
				.dispatch(DriverRole::Delete, req, None, true)?;
			return Ok(());
		}
		self.state.store.delete(req)
	}
}

impl GatewayServer for RgServer {
	fn get_block(&self, req: &RequestData) -> Result<Vec<u8>> {
		req.block_coords()?;
		self.fetch(req)
	}

	fn get_manifest(&self, req: &RequestData) -> Result<Vec<u8>> {
		req.manifest_timestamp()?;
		self.fetch(req)
	}

	fn put_block(&self, req: &RequestData, data: Vec<u8>) -> Result<()> {
		// the writer's signature must check out before anything lands
		chunk::verify(&self.state.ctx, &data, req.src_gateway_id)?;
		self.stage(req, &data)
	}

	fn put_manifest(&self, req: &RequestData, data: Vec<u8>) -> Result<()> {
		let payload = chunk::verify(&self.state.ctx, &data, req.src_gateway_id)?;
		let manifest = chunk::manifest_decode(&payload)
			.map_err(|_| Error::InvalidArgument("PUT_MANIFEST payload is not a manifest".to_owned()))?;
		// a manifest may only be replicated by its own coordinator
		if manifest.coordinator_id != req.src_gateway_id {
			debug!(
				"manifest for {:X} declares coordinator {}, sender is {}",
				req.file_id, manifest.coordinator_id, req.src_gateway_id
			);
			return Err(Error::Stale);
		}
		self.stage(req, &data)
	}

	fn delete_chunks(&self, req: &RequestData, chunks: &[ChunkDescriptor]) -> Result<()> {
		for desc in chunks {
			let target = match desc {
				ChunkDescriptor::Manifest { mtime } => RequestTarget::Manifest { timestamp: *mtime },
				ChunkDescriptor::Block {
					block_id,
					block_version,
				} => RequestTarget::Block {
					block_id: *block_id,
					block_version: *block_version,
				},
			};
			let mut one = req.clone();
			one.target = target;
			self.discard(&one)?;
		}
		Ok(())
	}
}
