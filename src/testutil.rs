//! Test fixtures: a mock metadata service and an in-memory gateway
//! network wired over the loopback transport.

use crate::chunk;
use crate::driver::Driver;
use crate::error::Error;
use crate::error::Result;
use crate::gateway::GatewayCert;
use crate::gateway::GatewayConfig;
use crate::gateway::GatewayContext;
use crate::gateway::GatewayKind;
use crate::gateway::Volume;
use crate::ms::EntryType;
use crate::ms::MdEntry;
use crate::ms::MsClient;
use crate::ms::MsListing;
use crate::ms::VacuumLogEntry;
use crate::request::RequestData;
use crate::rg::RgServer;
use crate::rg::RgState;
use crate::rpc;
use crate::rpc::GatewayServer;
use crate::rpc::Transport;
use crate::ug::server::UgServer;
use crate::ug::UgState;
use crate::util::path_components;
use crate::util::TimeSpec;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use parking_lot::RwLock;
use rand_core::OsRng;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::TempDir;

/// Volume id every fixture gateway joins.
pub const VOLUME_ID: u64 = 1;
/// Block size of the fixture volume.
pub const BLOCK_SIZE: u64 = 65536;
/// User id the fixtures run as.
pub const USER_ID: u64 = 7;

/// An in-memory metadata service.
pub struct MockMs {
	entries: Mutex<HashMap<String, MdEntry>>,
	paths_by_id: Mutex<HashMap<u64, String>>,
	next_file_id: AtomicU64,
	generations: Mutex<HashMap<u64, i64>>,
	vacuum_log: Mutex<HashMap<u64, VecDeque<VacuumLogEntry>>>,
	/// `path_download` call counter, for consistency tests.
	pub path_downloads: AtomicUsize,
}

impl MockMs {
	/// An MS holding only the volume root.
	pub fn new() -> Arc<Self> {
		let root = MdEntry {
			entry_type: EntryType::Dir,
			name: "/".to_owned(),
			file_id: 0,
			version: 1,
			owner: USER_ID,
			coordinator: 0,
			volume: VOLUME_ID,
			mode: 0o755,
			size: 0,
			ctime: TimeSpec::new(1, 0),
			mtime: TimeSpec::new(1, 0),
			manifest_mtime: TimeSpec::new(1, 0),
			write_nonce: 1,
			xattr_nonce: 1,
			generation: 0,
			num_children: 0,
			parent_id: 0,
			max_read_freshness: 5000,
			max_write_freshness: 0,
		};
		let mut entries = HashMap::new();
		entries.insert("/".to_owned(), root);
		let mut paths = HashMap::new();
		paths.insert(0, "/".to_owned());
		Arc::new(Self {
			entries: Mutex::new(entries),
			paths_by_id: Mutex::new(paths),
			next_file_id: AtomicU64::new(0x100),
			generations: Mutex::new(HashMap::new()),
			vacuum_log: Mutex::new(HashMap::new()),
			path_downloads: AtomicUsize::new(0),
		})
	}

	/// Looks an entry up by path.
	pub fn entry(&self, path: &str) -> Option<MdEntry> {
		self.entries.lock().get(path).cloned()
	}

	/// Installs an entry directly, bypassing `create`.
	pub fn seed(&self, path: &str, entry: MdEntry) {
		self.paths_by_id
			.lock()
			.insert(entry.file_id, path.to_owned());
		self.entries.lock().insert(path.to_owned(), entry);
	}

	/// Pending vacuum-log entries for one file.
	pub fn vacuum_backlog(&self, file_id: u64) -> usize {
		self.vacuum_log
			.lock()
			.get(&file_id)
			.map(|q| q.len())
			.unwrap_or(0)
	}
}

impl MsClient for MockMs {
	fn getattr_multi(&self, _volume_id: u64, paths: &[String]) -> Result<Vec<MsListing>> {
		let entries = self.entries.lock();
		Ok(paths
			.iter()
			.map(|p| match entries.get(p) {
				Some(ent) => MsListing::Entry(ent.clone()),
				None => MsListing::None,
			})
			.collect())
	}

	fn path_download(&self, _volume_id: u64, fs_path: &str) -> Result<Vec<MdEntry>> {
		self.path_downloads.fetch_add(1, Ordering::SeqCst);
		let entries = self.entries.lock();
		let mut out = Vec::new();
		let mut walked = String::new();
		for comp in path_components(fs_path) {
			walked.push('/');
			walked.push_str(comp);
			let ent = entries.get(&walked).ok_or(Error::NotFound)?;
			out.push(ent.clone());
		}
		Ok(out)
	}

	fn listdir(&self, _volume_id: u64, file_id: u64) -> Result<Vec<MdEntry>> {
		let dir_path = self
			.paths_by_id
			.lock()
			.get(&file_id)
			.cloned()
			.ok_or(Error::NotFound)?;
		let entries = self.entries.lock();
		Ok(entries
			.iter()
			.filter(|(path, ent)| {
				ent.file_id != file_id && crate::util::path_dirname(path) == dir_path
			})
			.map(|(_, ent)| ent.clone())
			.collect())
	}

	fn diffdir(&self, volume_id: u64, file_id: u64, least_generation: i64) -> Result<Vec<MdEntry>> {
		Ok(self
			.listdir(volume_id, file_id)?
			.into_iter()
			.filter(|ent| ent.generation >= least_generation)
			.collect())
	}

	fn create(&self, entry: &MdEntry) -> Result<MdEntry> {
		let parent_path = self
			.paths_by_id
			.lock()
			.get(&entry.parent_id)
			.cloned()
			.ok_or(Error::NotFound)?;
		let path = if parent_path == "/" {
			format!("/{}", entry.name)
		} else {
			format!("{}/{}", parent_path, entry.name)
		};
		let mut entries = self.entries.lock();
		if entries.contains_key(&path) {
			return Err(Error::AlreadyExists);
		}
		let mut published = entry.clone();
		published.file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
		let mut generations = self.generations.lock();
		let generation = generations.entry(entry.parent_id).or_insert(0);
		*generation += 1;
		published.generation = *generation;
		entries.insert(path.clone(), published.clone());
		self.paths_by_id.lock().insert(published.file_id, path);
		Ok(published)
	}

	fn update(&self, entry: &MdEntry) -> Result<()> {
		// the entry's path is derived from its parent, so a rename or a
		// move re-keys it
		let old_path = self
			.paths_by_id
			.lock()
			.get(&entry.file_id)
			.cloned()
			.ok_or(Error::NotFound)?;
		let parent_path = self
			.paths_by_id
			.lock()
			.get(&entry.parent_id)
			.cloned()
			.ok_or(Error::NotFound)?;
		let new_path = if parent_path == "/" {
			format!("/{}", entry.name)
		} else {
			format!("{}/{}", parent_path, entry.name)
		};

		let mut entries = self.entries.lock();
		let old = entries.remove(&old_path).ok_or(Error::NotFound)?;
		if new_path != old_path && entries.contains_key(&new_path) {
			entries.insert(old_path, old);
			return Err(Error::AlreadyExists);
		}
		let moved = old.parent_id != entry.parent_id;
		let mut stored = entry.clone();
		if moved {
			// a child lands under a new parent with a fresh generation
			let mut generations = self.generations.lock();
			let generation = generations.entry(entry.parent_id).or_insert(0);
			*generation += 1;
			stored.generation = *generation;
		}
		entries.insert(new_path.clone(), stored);
		self.paths_by_id.lock().insert(entry.file_id, new_path);
		Ok(())
	}

	fn delete(&self, entry: &MdEntry) -> Result<()> {
		let path = self
			.paths_by_id
			.lock()
			.remove(&entry.file_id)
			.ok_or(Error::NotFound)?;
		self.entries.lock().remove(&path);
		Ok(())
	}

	fn peek_vacuum_log(&self, _volume_id: u64, file_id: u64) -> Result<Option<VacuumLogEntry>> {
		Ok(self
			.vacuum_log
			.lock()
			.get(&file_id)
			.and_then(|q| q.front().cloned()))
	}

	fn remove_vacuum_log_entry(
		&self,
		writer_id: u64,
		file_id: u64,
		file_version: i64,
		manifest_mtime: TimeSpec,
	) -> Result<()> {
		let mut log = self.vacuum_log.lock();
		if let Some(queue) = log.get_mut(&file_id) {
			let head_matches = queue.front().map(|head| {
				head.writer_id == writer_id
					&& head.file_version == file_version
					&& head.manifest_mtime == manifest_mtime
			});
			if head_matches == Some(true) {
				queue.pop_front();
			}
			// popping an already-removed head succeeds
		}
		Ok(())
	}

	fn append_vacuum_log(&self, entry: &VacuumLogEntry) -> Result<()> {
		self.vacuum_log
			.lock()
			.entry(entry.file_id)
			.or_default()
			.push_back(entry.clone());
		Ok(())
	}

	fn cert_bundle(&self, _volume_id: u64) -> Result<Vec<GatewayCert>> {
		Ok(Vec::new())
	}
}

/// A loopback network of in-process gateways.
pub struct Network {
	/// The shared mock metadata service.
	pub ms: Arc<MockMs>,
	servers: RwLock<HashMap<u64, Arc<dyn GatewayServer>>>,
	ctxs: RwLock<HashMap<u64, Arc<GatewayContext>>>,
	dirs: Mutex<Vec<TempDir>>,
}

impl Network {
	/// An empty network with a fresh mock MS.
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			ms: MockMs::new(),
			servers: RwLock::new(HashMap::new()),
			ctxs: RwLock::new(HashMap::new()),
			dirs: Mutex::new(Vec::new()),
		})
	}

	fn make_ctx(&self, id: u64, kind: GatewayKind) -> Arc<GatewayContext> {
		let storage = TempDir::new().expect("tempdir");
		let metadata = TempDir::new().expect("tempdir");
		let config = GatewayConfig {
			storage_root: storage.path().to_owned(),
			metadata_root: metadata.path().to_owned(),
			..Default::default()
		};
		self.dirs.lock().push(storage);
		self.dirs.lock().push(metadata);
		let volume = Volume {
			id: VOLUME_ID,
			owner_id: USER_ID,
			block_size: BLOCK_SIZE,
			ms_public_key: None,
		};
		let ctx = Arc::new(GatewayContext::new(
			id,
			kind,
			USER_ID,
			volume,
			config,
			SigningKey::generate(&mut OsRng),
		));
		self.ctxs.write().insert(id, Arc::clone(&ctx));
		ctx
	}

	/// Adds a user gateway.
	pub fn add_ug(self: &Arc<Self>, id: u64) -> Arc<UgState> {
		let ctx = self.make_ctx(id, GatewayKind::UG);
		let transport: Arc<dyn Transport> = Arc::clone(self) as Arc<dyn Transport>;
		let state = UgState::new(
			ctx,
			self.ms.clone() as Arc<dyn MsClient>,
			transport,
			Arc::new(Driver::disabled()),
		)
		.expect("ug state");
		self.servers
			.write()
			.insert(id, Arc::new(UgServer::new(Arc::clone(&state))));
		self.refresh_certs();
		state
	}

	/// Adds a replica gateway with the built-in disk backend.
	pub fn add_rg(self: &Arc<Self>, id: u64) -> Arc<RgState> {
		let ctx = self.make_ctx(id, GatewayKind::RG);
		let state = RgState::new(ctx, Arc::new(Driver::disabled())).expect("rg state");
		self.servers
			.write()
			.insert(id, Arc::new(RgServer::new(Arc::clone(&state))));
		self.refresh_certs();
		state
	}

	/// Adds an acquisition gateway.
	pub fn add_ag(self: &Arc<Self>, id: u64) -> Arc<crate::ag::AgState> {
		let ctx = self.make_ctx(id, GatewayKind::AG);
		let state = crate::ag::AgState::new(
			ctx,
			self.ms.clone() as Arc<dyn MsClient>,
			Arc::new(Driver::disabled()),
		);
		self.servers
			.write()
			.insert(id, Arc::new(crate::ag::AgServer::new(Arc::clone(&state))));
		self.refresh_certs();
		state
	}

	/// Re-shares every gateway's cert with every other gateway.
	pub fn refresh_certs(&self) {
		let ctxs = self.ctxs.read();
		let certs: Vec<GatewayCert> = ctxs
			.values()
			.map(|ctx| GatewayCert {
				id: ctx.id,
				kind: ctx.kind,
				host: "localhost".to_owned(),
				port: 32780,
				public_key: ctx.public_key(),
			})
			.collect();
		for ctx in ctxs.values() {
			ctx.install_certs(certs.clone());
		}
	}
}

impl Transport for Network {
	fn exchange(&self, dest: u64, body: &[u8]) -> Result<Vec<u8>> {
		let server = self
			.servers
			.read()
			.get(&dest)
			.cloned()
			.ok_or(Error::NoData)?;
		let ctx = self
			.ctxs
			.read()
			.get(&dest)
			.cloned()
			.ok_or(Error::NoData)?;
		Ok(rpc::serve_body(&ctx, server.as_ref(), body))
	}
}

/// Signs an arbitrary block chunk as `ctx`; fixture for replication
/// tests.
pub fn sign_block(ctx: &GatewayContext, path: &str, data: &[u8]) -> Vec<u8> {
	let req = RequestData::block(path, 1, 1, ctx.id, VOLUME_ID, ctx.id, USER_ID, 0, 1);
	chunk::sign(ctx, &req, data).expect("signing cannot fail")
}
