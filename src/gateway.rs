//! Gateway identity, volume membership and the shared runtime context.

use crate::error::Error;
use crate::error::Result;
use ed25519_dalek::Signature;
use ed25519_dalek::Signer;
use ed25519_dalek::SigningKey;
use ed25519_dalek::Verifier;
use ed25519_dalek::VerifyingKey;
use parking_lot::RwLock;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// The three gateway roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayKind {
	/// User gateway: mounts the volume, coordinates writes.
	UG = 1,
	/// Replica gateway: stages durable copies of chunks.
	RG = 2,
	/// Acquisition gateway: exposes an existing dataset read-only.
	AG = 3,
}

/// A volume as this gateway sees it.
#[derive(Clone, Debug)]
pub struct Volume {
	/// Volume identifier.
	pub id: u64,
	/// User owning the volume.
	pub owner_id: u64,
	/// Block size in bytes; a fixed power of two.
	pub block_size: u64,
	/// Public key used to verify metadata-service responses.
	pub ms_public_key: Option<[u8; 32]>,
}

/// The MS-advertised identity of one gateway in the volume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayCert {
	/// Gateway identifier.
	pub id: u64,
	/// Role of the gateway.
	pub kind: GatewayKind,
	/// Host the gateway serves on.
	pub host: String,
	/// Port the gateway serves on.
	pub port: u16,
	/// ed25519 public key of the gateway.
	pub public_key: [u8; 32],
}

impl GatewayCert {
	/// The cert's verifying key.
	pub fn verifying_key(&self) -> Result<VerifyingKey> {
		VerifyingKey::from_bytes(&self.public_key)
			.map_err(|_| Error::ProtocolMismatch("malformed gateway public key".to_owned()))
	}
}

/// Local configuration of a gateway process.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
	/// URL of the metadata service.
	pub ms_url: String,
	/// Root of the local chunk store.
	pub storage_root: PathBuf,
	/// Root of the persisted upload-metadata tree.
	pub metadata_root: PathBuf,
	/// Block-cache size at which eviction starts, in bytes.
	pub cache_soft_limit: u64,
	/// Block-cache size never exceeded, in bytes.
	pub cache_hard_limit: u64,
	/// Path of the storage-driver executable, if one is installed.
	pub driver_exec: Option<PathBuf>,
	/// Worker processes per driver role.
	pub driver_workers: usize,
	/// Debug verbosity.
	pub debug_level: u32,
	/// Run without user credentials.
	pub anonymous: bool,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self {
			ms_url: String::new(),
			storage_root: PathBuf::from("/tmp/syndicate/storage"),
			metadata_root: PathBuf::from("/tmp/syndicate/metadata"),
			cache_soft_limit: 50 * 1024 * 1024,
			cache_hard_limit: 100 * 1024 * 1024,
			driver_exec: None,
			driver_workers: 4,
			debug_level: 0,
			anonymous: false,
		}
	}
}

/// Cooperative cancellation token threaded through background workers.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
	/// Creates a live token.
	pub fn new() -> Self {
		Self::default()
	}

	/// Requests cancellation.
	pub fn cancel(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	/// Tells whether cancellation was requested.
	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

/// Shared, handle-passed state of one gateway process.
///
/// There is no module-level mutable state; everything an operation needs
/// travels through a reference to this context.
pub struct GatewayContext {
	/// This gateway's identifier.
	pub id: u64,
	/// This gateway's role.
	pub kind: GatewayKind,
	/// User this gateway runs as.
	pub user_id: u64,
	/// The volume this gateway belongs to.
	pub volume: Volume,
	/// Local process configuration.
	pub config: GatewayConfig,
	/// Random per-process session id, stamped on in-flight uploads.
	pub session_id: i64,
	/// Cancellation token for background workers.
	pub cancel: CancelToken,
	signing_key: SigningKey,
	certs: RwLock<HashMap<u64, GatewayCert>>,
}

impl GatewayContext {
	/// Builds a gateway context.
	pub fn new(
		id: u64,
		kind: GatewayKind,
		user_id: u64,
		volume: Volume,
		config: GatewayConfig,
		signing_key: SigningKey,
	) -> Self {
		Self {
			id,
			kind,
			user_id,
			volume,
			config,
			session_id: crate::util::random64() as i64,
			cancel: CancelToken::new(),
			signing_key,
			certs: RwLock::new(HashMap::new()),
		}
	}

	/// The volume's block size in bytes.
	pub fn block_size(&self) -> u64 {
		self.volume.block_size
	}

	/// This gateway's public key.
	pub fn public_key(&self) -> [u8; 32] {
		self.signing_key.verifying_key().to_bytes()
	}

	/// Signs `data` with the gateway private key.
	pub fn sign(&self, data: &[u8]) -> [u8; 64] {
		self.signing_key.sign(data).to_bytes()
	}

	/// Verifies that `signer_id` produced `signature` over `data`.
	pub fn verify(&self, signer_id: u64, data: &[u8], signature: &[u8]) -> Result<()> {
		let sig_bytes: [u8; 64] = signature
			.try_into()
			.map_err(|_| Error::Io("malformed signature".to_owned()))?;
		let sig = Signature::from_bytes(&sig_bytes);
		let certs = self.certs.read();
		let cert = certs.get(&signer_id).ok_or(Error::PermissionDenied)?;
		cert.verifying_key()?
			.verify(data, &sig)
			.map_err(|_| Error::Io(format!("bad signature from gateway {}", signer_id)))
	}

	/// Replaces the cert set with a fresh MS view.
	pub fn install_certs(&self, certs: Vec<GatewayCert>) {
		let mut map = self.certs.write();
		map.clear();
		for cert in certs {
			map.insert(cert.id, cert);
		}
	}

	/// Looks up one gateway's cert.
	pub fn cert(&self, id: u64) -> Option<GatewayCert> {
		self.certs.read().get(&id).cloned()
	}

	/// Ids of every replica gateway in the volume, ascending.
	pub fn rg_ids(&self) -> Vec<u64> {
		let mut ids: Vec<u64> = self
			.certs
			.read()
			.values()
			.filter(|c| c.kind == GatewayKind::RG)
			.map(|c| c.id)
			.collect();
		ids.sort_unstable();
		ids
	}

	/// The ordered gateway list for fetching a file's data: the
	/// coordinator first, then each replica gateway.
	pub fn download_gateway_list(&self, coordinator_id: u64) -> Vec<u64> {
		let mut ids = vec![coordinator_id];
		for rg in self.rg_ids() {
			if rg != coordinator_id {
				ids.push(rg);
			}
		}
		ids
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use rand_core::OsRng;

	fn ctx_with_peer() -> (GatewayContext, SigningKey) {
		let key = SigningKey::generate(&mut OsRng);
		let peer_key = SigningKey::generate(&mut OsRng);
		let volume = Volume {
			id: 1,
			owner_id: 1,
			block_size: 65536,
			ms_public_key: None,
		};
		let ctx = GatewayContext::new(
			10,
			GatewayKind::UG,
			1,
			volume,
			GatewayConfig::default(),
			key,
		);
		ctx.install_certs(vec![GatewayCert {
			id: 20,
			kind: GatewayKind::RG,
			host: "localhost".to_owned(),
			port: 32780,
			public_key: peer_key.verifying_key().to_bytes(),
		}]);
		(ctx, peer_key)
	}

	#[test]
	fn verify_known_signer() {
		let (ctx, peer_key) = ctx_with_peer();
		let sig = peer_key.sign(b"hello").to_bytes();
		assert!(ctx.verify(20, b"hello", &sig).is_ok());
		assert!(ctx.verify(20, b"tampered", &sig).is_err());
	}

	#[test]
	fn verify_unknown_signer() {
		let (ctx, peer_key) = ctx_with_peer();
		let sig = peer_key.sign(b"hello").to_bytes();
		assert!(matches!(
			ctx.verify(99, b"hello", &sig),
			Err(Error::PermissionDenied)
		));
	}

	#[test]
	fn download_list_orders_coordinator_first() {
		let (ctx, _) = ctx_with_peer();
		assert_eq!(ctx.download_gateway_list(5), vec![5, 20]);
		assert_eq!(ctx.download_gateway_list(20), vec![20]);
	}
}
