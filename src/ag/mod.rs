//! Acquisition-gateway core: expose an existing dataset read-only.
//!
//! A crawler loop polls the "crawl" driver role for dataset stanzas and
//! publishes them to the MS, synthesizing block-info entries for regular
//! files sized by the driver. The server side answers GETs only.

pub mod crawl;

use crate::chunk;
use crate::driver::Driver;
use crate::driver::DriverRole;
use crate::error::Error;
use crate::error::Result;
use crate::gateway::GatewayContext;
use crate::manifest::BlockInfo;
use crate::manifest::Manifest;
use crate::ms::MdEntry;
use crate::ms::MsClient;
use crate::request::RequestData;
use crate::rpc::GatewayServer;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared state of one acquisition gateway.
pub struct AgState {
	/// Gateway identity and volume view.
	pub ctx: Arc<GatewayContext>,
	/// Metadata-service client.
	pub ms: Arc<dyn MsClient>,
	/// Storage-driver pools; "crawl" feeds the publisher, "read" serves
	/// block data.
	pub driver: Arc<Driver>,
	/// Everything the crawler has published, by path.
	published: RwLock<HashMap<String, (MdEntry, Option<Manifest>)>>,
}

impl AgState {
	/// Brings an acquisition gateway up.
	pub fn new(ctx: Arc<GatewayContext>, ms: Arc<dyn MsClient>, driver: Arc<Driver>) -> Arc<Self> {
		Arc::new(Self {
			ctx,
			ms,
			driver,
			published: RwLock::new(HashMap::new()),
		})
	}

	/// Records a published entry and its synthetic manifest.
	pub fn insert_published(&self, path: &str, entry: MdEntry, manifest: Option<Manifest>) {
		self.published
			.write()
			.insert(path.to_owned(), (entry, manifest));
	}

	/// Forgets a published entry.
	pub fn remove_published(&self, path: &str) {
		self.published.write().remove(path);
	}

	/// Looks up a published entry.
	pub fn published(&self, path: &str) -> Option<(MdEntry, Option<Manifest>)> {
		self.published.read().get(path).cloned()
	}

	/// Number of published entries.
	pub fn published_count(&self) -> usize {
		self.published.read().len()
	}

	/// Builds the synthetic manifest for a crawled regular file: one
	/// versioned entry per block the file may cover, digests unknown
	/// until the data is actually served.
	pub fn synthesize_manifest(&self, entry: &MdEntry, file_url: Option<&str>) -> Manifest {
		let mut manifest = Manifest::new(
			self.ctx.volume.id,
			self.ctx.id,
			entry.file_id,
			entry.version,
		);
		manifest.size = entry.size;
		manifest.modtime = entry.manifest_mtime;
		manifest.file_url = file_url.map(str::to_owned);
		let block_size = self.ctx.block_size();
		let count = entry.size.div_ceil(block_size) + 1;
		for block_id in 0..count {
			manifest
				.put_block(block_id, BlockInfo::new(1, None), false)
				.expect("fresh manifest has no collisions");
		}
		manifest
	}
}

/// The acquisition-gateway server: GET handlers only.
pub struct AgServer {
	state: Arc<AgState>,
}

impl AgServer {
	/// Wraps an AG state for serving.
	pub fn new(state: Arc<AgState>) -> Self {
		Self { state }
	}
}

impl GatewayServer for AgServer {
	fn get_block(&self, req: &RequestData) -> Result<Vec<u8>> {
		req.block_coords()?;
		let data = self
			.state
			.driver
			.dispatch(DriverRole::Read, req, None, false)?
			.ok_or_else(|| Error::Io("read driver returned no chunk".to_owned()))?;
		let wire_bytes = chunk::serialize(&self.state.driver, req, &data)?;
		chunk::sign(&self.state.ctx, req, &wire_bytes)
	}

	fn get_manifest(&self, req: &RequestData) -> Result<Vec<u8>> {
		let (_, manifest) = self
			.state
			.published(&req.fs_path)
			.ok_or(Error::NotFound)?;
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
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::ag::crawl;
	use crate::ag::crawl::CrawlCommand;
	use crate::ms::EntryType;
	use crate::testutil;
	use std::io::Cursor;

	#[test]
	fn crawl_create_publishes_a_file() {
		// S6: one Create stanza becomes an MS entry plus a synthetic
		// manifest
		let net = testutil::Network::new();
		let ag = net.add_ag(30);

		let mut input = Cursor::new(b"C\nF 0644 1000\n/a.txt\n\0\n".to_vec());
		let stanza = crawl::read_stanza(&mut input).unwrap().unwrap();
		assert_eq!(stanza.cmd, CrawlCommand::Create);
		crawl::apply_stanza(&ag, &stanza).unwrap();

		let ent = net.ms.entry("/a.txt").unwrap();
		assert_eq!(ent.entry_type, EntryType::File);
		assert_eq!(ent.name, "a.txt");
		assert_eq!(ent.mode, 0o644);
		assert_eq!(ent.size, 1000);
		assert_eq!(ent.coordinator, 30);

		let (_, manifest) = ag.published("/a.txt").unwrap();
		let manifest = manifest.unwrap();
		// ceil(1000 / 65536) + 1 entries, version 1, no digests yet
		assert_eq!(manifest.len(), 2);
		for (_, info) in manifest.iter() {
			assert_eq!(info.version, 1);
			assert!(info.hash.is_none());
		}
	}

	#[test]
	fn crawl_directory_then_nested_file() {
		let net = testutil::Network::new();
		let ag = net.add_ag(30);

		let bytes = b"C\nD 0755 0\n/data\n\0\nC\nF 0600 100\n/data/a.txt\n\0\n".to_vec();
		let mut input = Cursor::new(bytes);
		while let Some(stanza) = crawl::read_stanza(&mut input).unwrap() {
			crawl::apply_stanza(&ag, &stanza).unwrap();
		}

		assert!(net.ms.entry("/data").is_some());
		let ent = net.ms.entry("/data/a.txt").unwrap();
		assert_eq!(ent.mode, 0o600);
		assert_eq!(ag.published_count(), 2);
	}

	#[test]
	fn crawl_update_and_delete() {
		let net = testutil::Network::new();
		let ag = net.add_ag(30);

		let mut input = Cursor::new(b"C\nF 0644 100\n/u.txt\n\0\n".to_vec());
		let stanza = crawl::read_stanza(&mut input).unwrap().unwrap();
		crawl::apply_stanza(&ag, &stanza).unwrap();

		let mut input = Cursor::new(b"U\nF 0644 500\n/u.txt\n\0\n".to_vec());
		let stanza = crawl::read_stanza(&mut input).unwrap().unwrap();
		crawl::apply_stanza(&ag, &stanza).unwrap();
		assert_eq!(net.ms.entry("/u.txt").unwrap().size, 500);

		let mut input = Cursor::new(b"D\nF 0644 500\n/u.txt\n\0\n".to_vec());
		let stanza = crawl::read_stanza(&mut input).unwrap().unwrap();
		crawl::apply_stanza(&ag, &stanza).unwrap();
		assert!(net.ms.entry("/u.txt").is_none());
		assert_eq!(ag.published_count(), 0);
	}

	#[test]
	fn ag_serves_its_published_manifest() {
		let net = testutil::Network::new();
		let ag = net.add_ag(30);
		let ug = net.add_ug(10);

		let mut input = Cursor::new(b"C\nF 0644 70000\n/served.txt\n\0\n".to_vec());
		let stanza = crawl::read_stanza(&mut input).unwrap().unwrap();
		crawl::apply_stanza(&ag, &stanza).unwrap();
		let ent = net.ms.entry("/served.txt").unwrap();

		// a UG fetches the manifest over the wire; it arrives in the
		// URL-set layout and verifies against the AG
		let req = crate::request::RequestData::manifest(
			"/served.txt",
			ent.file_id,
			1,
			30,
			testutil::VOLUME_ID,
			10,
			testutil::USER_ID,
			ent.manifest_mtime,
		);
		let manifest = crate::rpc::get_manifest(&ug.ctx, &*net, 30, &req).unwrap();
		assert_eq!(manifest.len(), 3);
		assert_eq!(manifest.coordinator_id, 30);
	}
}
