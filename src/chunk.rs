//! Chunk transform, digest and signature pipeline.
//!
//! Ordering is fixed: a writer serializes (driver transform), then hashes,
//! then signs; a reader verifies, then deserializes. Replica gateways
//! therefore only ever hold post-serialization bytes and never see
//! plaintext.

use crate::driver::Driver;
use crate::driver::DriverRole;
use crate::error::Error;
use crate::error::Result;
use crate::gateway::GatewayContext;
use crate::gateway::GatewayKind;
use crate::manifest::Manifest;
use crate::manifest::ManifestMsg;
use crate::request::RequestData;
use crate::request::RequestTarget;
use crate::wire;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

/// Digest of a chunk's bytes.
pub fn hash(data: &[u8]) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(data);
	hasher.finalize().into()
}

/// Runs the "serialize" driver transform over a plain chunk.
///
/// A gateway with no serialize role installed passes the chunk through
/// unchanged.
pub fn serialize(driver: &Driver, req: &RequestData, plain: &[u8]) -> Result<Vec<u8>> {
	if !driver.has_role(DriverRole::Serialize) {
		return Ok(plain.to_vec());
	}
	let out = driver.dispatch(DriverRole::Serialize, req, Some(plain), true)?;
	out.ok_or_else(|| Error::Io("serialize driver returned no chunk".to_owned()))
}

/// Runs the "deserialize" driver transform over wire bytes.
///
/// Identity when the role is absent.
pub fn deserialize(driver: &Driver, req: &RequestData, data: &[u8]) -> Result<Vec<u8>> {
	if !driver.has_role(DriverRole::Deserialize) {
		return Ok(data.to_vec());
	}
	let out = driver.dispatch(DriverRole::Deserialize, req, Some(data), true)?;
	out.ok_or_else(|| Error::Io("deserialize driver returned no chunk".to_owned()))
}

/// What a chunk signature covers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ChunkAuth {
	file_id: u64,
	file_version: i64,
	target: RequestTarget,
	digest: [u8; 32],
}

/// A chunk bound to its writer by signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct SignedChunk {
	auth: ChunkAuth,
	signer_id: u64,
	payload: Vec<u8>,
	signature: Vec<u8>,
}

/// Signs an already-serialized chunk for the coordinates in `req`.
pub fn sign(ctx: &GatewayContext, req: &RequestData, payload: &[u8]) -> Result<Vec<u8>> {
	let auth = ChunkAuth {
		file_id: req.file_id,
		file_version: req.file_version,
		target: req.target,
		digest: hash(payload),
	};
	let auth_bytes = wire::encode(&auth)?;
	let signed = SignedChunk {
		auth,
		signer_id: ctx.id,
		payload: payload.to_vec(),
		signature: ctx.sign(&auth_bytes).to_vec(),
	};
	wire::encode(&signed)
}

/// Checks a signed chunk and returns its payload.
///
/// Rejects a signer other than `expected_signer`, a bad signature, and a
/// payload that disagrees with the signed digest. The payload is still
/// serialized; run `deserialize` on it afterwards.
pub fn verify(ctx: &GatewayContext, data: &[u8], expected_signer: u64) -> Result<Vec<u8>> {
	let (payload, _) = verify_with_target(ctx, data, expected_signer)?;
	Ok(payload)
}

/// Like `verify`, also returning the coordinates the writer signed.
pub fn verify_with_target(
	ctx: &GatewayContext,
	data: &[u8],
	expected_signer: u64,
) -> Result<(Vec<u8>, RequestTarget)> {
	let signed: SignedChunk = wire::decode(data).map_err(|_| corrupt())?;
	if signed.signer_id != expected_signer {
		return Err(Error::Io(format!(
			"chunk signed by gateway {}, expected {}",
			signed.signer_id, expected_signer
		)));
	}
	let auth_bytes = wire::encode(&signed.auth)?;
	ctx.verify(signed.signer_id, &auth_bytes, &signed.signature)?;
	if hash(&signed.payload) != signed.auth.digest {
		return Err(corrupt());
	}
	Ok((signed.payload, signed.auth.target))
}

fn corrupt() -> Error {
	Error::Io("corrupt chunk".to_owned())
}

/// Serializes a manifest into a chunk, in the layout this gateway role
/// emits: URL sets from acquisition gateways, per-block otherwise.
pub fn manifest_encode(ctx: &GatewayContext, manifest: &Manifest) -> Result<Vec<u8>> {
	let msg = match ctx.kind {
		GatewayKind::AG => manifest.to_wire_url_sets(),
		_ => manifest.to_wire_blocks(),
	};
	wire::encode(&msg)
}

/// Rebuilds a manifest from a chunk, accepting either layout.
pub fn manifest_decode(data: &[u8]) -> Result<Manifest> {
	let msg: ManifestMsg = wire::decode(data)?;
	Manifest::from_wire(msg)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::gateway::GatewayCert;
	use crate::gateway::GatewayConfig;
	use crate::gateway::Volume;
	use ed25519_dalek::SigningKey;
	use rand_core::OsRng;

	fn ctx(id: u64) -> GatewayContext {
		let volume = Volume {
			id: 1,
			owner_id: 1,
			block_size: 65536,
			ms_public_key: None,
		};
		GatewayContext::new(
			id,
			GatewayKind::UG,
			1,
			volume,
			GatewayConfig::default(),
			SigningKey::generate(&mut OsRng),
		)
	}

	fn share_certs(gateways: &[&GatewayContext]) {
		let certs: Vec<GatewayCert> = gateways
			.iter()
			.map(|g| GatewayCert {
				id: g.id,
				kind: g.kind,
				host: "localhost".to_owned(),
				port: 32780,
				public_key: g.public_key(),
			})
			.collect();
		for g in gateways {
			g.install_certs(certs.clone());
		}
	}

	#[test]
	fn sign_verify_round_trip() {
		let a = ctx(10);
		let b = ctx(20);
		share_certs(&[&a, &b]);

		let req = RequestData::block("/f", 0x100, 1, 10, 1, 10, 1, 0, 1);
		let signed = sign(&a, &req, b"block bytes").unwrap();
		let (payload, target) = verify_with_target(&b, &signed, 10).unwrap();
		assert_eq!(payload, b"block bytes");
		assert_eq!(
			target,
			RequestTarget::Block {
				block_id: 0,
				block_version: 1
			}
		);
	}

	#[test]
	fn wrong_signer_is_rejected() {
		let a = ctx(10);
		let b = ctx(20);
		share_certs(&[&a, &b]);

		let req = RequestData::block("/f", 0x100, 1, 10, 1, 10, 1, 0, 1);
		let signed = sign(&a, &req, b"block bytes").unwrap();
		let err = verify(&b, &signed, 20).unwrap_err();
		assert!(matches!(err, Error::Io(_)));
		assert!(err.to_string().contains("signed by gateway 10"));
	}

	#[test]
	fn tampered_payload_is_rejected() {
		let a = ctx(10);
		share_certs(&[&a]);

		let req = RequestData::block("/f", 0x100, 1, 10, 1, 10, 1, 0, 1);
		let signed = sign(&a, &req, b"block bytes").unwrap();
		// flip one payload byte somewhere past the header
		let mut bad = signed.clone();
		let idx = bad.len() - 70;
		bad[idx] ^= 0xff;
		assert!(verify(&a, &bad, 10).is_err());
	}

	#[test]
	fn identity_transform_without_driver() {
		let driver = Driver::disabled();
		let req = RequestData::block("/f", 0x100, 1, 10, 1, 10, 1, 0, 1);
		let wire_bytes = serialize(&driver, &req, b"plain").unwrap();
		assert_eq!(wire_bytes, b"plain");
		let plain = deserialize(&driver, &req, &wire_bytes).unwrap();
		assert_eq!(plain, b"plain");
	}

	#[test]
	fn manifest_chunk_round_trip() {
		let a = ctx(10);
		let mut m = Manifest::new(1, 10, 0x100, 1);
		m.put_block(0, crate::manifest::BlockInfo::new(1, Some([5; 32])), false)
			.unwrap();
		m.size = 100;
		let bytes = manifest_encode(&a, &m).unwrap();
		assert_eq!(manifest_decode(&bytes).unwrap(), m);
	}
}
