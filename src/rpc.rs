//! Gateway-to-gateway RPC: server dispatch and the typed client.
//!
//! An RPC body is one framed, signed request envelope optionally followed
//! by one framed dataplane chunk; the reply is one framed reply message
//! optionally followed by one chunk. The HTTP plumbing that moves bodies
//! between gateways lives outside the core, behind `Transport`.

use crate::chunk;
use crate::error::Error;
use crate::error::Result;
use crate::gateway::GatewayContext;
use crate::manifest::Manifest;
use crate::request::RequestData;
use crate::wire;
use crate::wire::ChunkDescriptor;
use crate::wire::ReplyMsg;
use crate::wire::RequestMsg;
use crate::wire::Verb;
use log::debug;
use log::warn;
use std::io::Cursor;

/// The verb handlers one gateway role serves.
///
/// Every verb defaults to `ProtocolMismatch`; each role overrides the
/// handlers meaningful for it.
pub trait GatewayServer: Send + Sync {
	/// Serves one signed block.
	fn get_block(&self, req: &RequestData) -> Result<Vec<u8>> {
		let _ = req;
		Err(unserved("GET_BLOCK"))
	}

	/// Serves one signed serialized manifest.
	fn get_manifest(&self, req: &RequestData) -> Result<Vec<u8>> {
		let _ = req;
		Err(unserved("GET_MANIFEST"))
	}

	/// Stores one signed block.
	fn put_block(&self, req: &RequestData, data: Vec<u8>) -> Result<()> {
		let _ = (req, data);
		Err(unserved("PUT_BLOCK"))
	}

	/// Stores one signed serialized manifest.
	fn put_manifest(&self, req: &RequestData, data: Vec<u8>) -> Result<()> {
		let _ = (req, data);
		Err(unserved("PUT_MANIFEST"))
	}

	/// Deletes a list of manifests and blocks.
	fn delete_chunks(&self, req: &RequestData, chunks: &[ChunkDescriptor]) -> Result<()> {
		let _ = (req, chunks);
		Err(unserved("DELETECHUNKS"))
	}

	/// Renames a file this gateway coordinates.
	fn rename(&self, req: &RequestData, new_fs_path: &str) -> Result<()> {
		let _ = (req, new_fs_path);
		Err(unserved("RENAME"))
	}

	/// Truncates a file this gateway coordinates.
	fn truncate(&self, req: &RequestData, new_size: u64) -> Result<()> {
		let _ = (req, new_size);
		Err(unserved("TRUNCATE"))
	}

	/// Detaches a file.
	fn detach(&self, req: &RequestData) -> Result<()> {
		let _ = req;
		Err(unserved("DETACH"))
	}

	/// Merges a manifest delta into a file this gateway coordinates.
	fn patch_manifest(&self, req: &RequestData, delta: Manifest) -> Result<()> {
		let _ = (req, delta);
		Err(unserved("PATCH_MANIFEST"))
	}
}

fn unserved(verb: &str) -> Error {
	Error::ProtocolMismatch(format!("{} is not served at this gateway role", verb))
}

/// Handles one RPC body and produces the reply body.
pub fn serve_body(ctx: &GatewayContext, server: &dyn GatewayServer, body: &[u8]) -> Vec<u8> {
	match serve_inner(ctx, server, body) {
		Ok((reply, data)) => encode_reply(&reply, data.as_deref()),
		Err(e) => {
			warn!("request failed: {}", e);
			encode_reply(&ReplyMsg::from_error(&e), None)
		}
	}
}

fn serve_inner(
	ctx: &GatewayContext,
	server: &dyn GatewayServer,
	body: &[u8],
) -> Result<(ReplyMsg, Option<Vec<u8>>)> {
	let mut cursor = Cursor::new(body);
	let msg_bytes = wire::read_frame(&mut cursor)?;
	let msg: RequestMsg = wire::decode(&msg_bytes)?;
	let data = if (cursor.position() as usize) < body.len() {
		Some(wire::read_frame(&mut cursor)?)
	} else {
		None
	};

	msg.verify(ctx)?;
	if msg.data.volume_id != ctx.volume.id {
		return Err(Error::InvalidArgument(format!(
			"request for volume {} at a member of volume {}",
			msg.data.volume_id, ctx.volume.id
		)));
	}

	debug!(
		"{:?} from gateway {} for {}",
		msg.verb, msg.data.src_gateway_id, msg.data
	);

	let req = &msg.data;
	match msg.verb {
		Verb::GetBlock => {
			let chunk = server.get_block(req)?;
			Ok((ReplyMsg::ok(), Some(chunk)))
		}
		Verb::GetManifest => {
			let chunk = server.get_manifest(req)?;
			Ok((ReplyMsg::ok(), Some(chunk)))
		}
		Verb::PutBlock => {
			let data = data.ok_or_else(|| {
				Error::ProtocolMismatch("PUT_BLOCK carries no chunk".to_owned())
			})?;
			server.put_block(req, data)?;
			Ok((ReplyMsg::ok(), None))
		}
		Verb::PutManifest => {
			let data = data.ok_or_else(|| {
				Error::ProtocolMismatch("PUT_MANIFEST carries no chunk".to_owned())
			})?;
			server.put_manifest(req, data)?;
			Ok((ReplyMsg::ok(), None))
		}
		Verb::DeleteChunks => {
			server.delete_chunks(req, &msg.chunks)?;
			Ok((ReplyMsg::ok(), None))
		}
		Verb::Rename => {
			let new_fs_path = msg
				.new_fs_path
				.as_deref()
				.ok_or_else(|| Error::InvalidArgument("RENAME without a destination".to_owned()))?;
			server.rename(req, new_fs_path)?;
			Ok((ReplyMsg::ok(), None))
		}
		Verb::Truncate => {
			let new_size = msg
				.new_size
				.ok_or_else(|| Error::InvalidArgument("TRUNCATE without a size".to_owned()))?;
			server.truncate(req, new_size)?;
			Ok((ReplyMsg::ok(), None))
		}
		Verb::Detach => {
			server.detach(req)?;
			Ok((ReplyMsg::ok(), None))
		}
		Verb::PatchManifest => {
			let data = data.ok_or_else(|| {
				Error::ProtocolMismatch("PATCH_MANIFEST carries no chunk".to_owned())
			})?;
			let delta = chunk::manifest_decode(&data)?;
			server.patch_manifest(req, delta)?;
			Ok((ReplyMsg::ok(), None))
		}
	}
}

fn encode_reply(reply: &ReplyMsg, data: Option<&[u8]>) -> Vec<u8> {
	let mut body = Vec::new();
	let bytes = wire::encode(reply).expect("reply serialization is infallible");
	wire::write_frame(&mut body, &bytes).expect("writing to a Vec cannot fail");
	if let Some(data) = data {
		wire::write_frame(&mut body, data).expect("writing to a Vec cannot fail");
	}
	body
}

/// Moves one request body to a destination gateway and returns the
/// reply body.
///
/// Implemented over HTTP POST outside the core; tests use a loopback.
pub trait Transport: Send + Sync {
	/// Performs one exchange with gateway `dest`.
	fn exchange(&self, dest: u64, body: &[u8]) -> Result<Vec<u8>>;
}

/// Signs and sends one request, returning the reply chunk if any.
pub fn call(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	dest: u64,
	mut msg: RequestMsg,
	data: Option<&[u8]>,
) -> Result<Option<Vec<u8>>> {
	msg.sign(ctx)?;
	let mut body = Vec::new();
	let bytes = wire::encode(&msg)?;
	wire::write_frame(&mut body, &bytes)?;
	if let Some(data) = data {
		wire::write_frame(&mut body, data)?;
	}

	let reply_body = transport.exchange(dest, &body)?;
	let mut cursor = Cursor::new(reply_body.as_slice());
	let reply_bytes = wire::read_frame(&mut cursor)?;
	let reply: ReplyMsg = wire::decode(&reply_bytes)?;
	reply.into_result()?;

	if (cursor.position() as usize) < reply_body.len() {
		Ok(Some(wire::read_frame(&mut cursor)?))
	} else {
		Ok(None)
	}
}

/// Fetches one signed block from `dest`.
pub fn get_block(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	dest: u64,
	req: &RequestData,
) -> Result<Vec<u8>> {
	let msg = RequestMsg::new(Verb::GetBlock, req.clone());
	call(ctx, transport, dest, msg, None)?
		.ok_or_else(|| Error::ProtocolMismatch("GET_BLOCK reply carried no chunk".to_owned()))
}

/// Fetches and verifies one manifest from `dest`.
///
/// The manifest chunk must verify against the file's coordinator, which
/// signed it at flush time; `dest` may be a replica holding a copy.
pub fn get_manifest(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	dest: u64,
	req: &RequestData,
) -> Result<Manifest> {
	let msg = RequestMsg::new(Verb::GetManifest, req.clone());
	let data = call(ctx, transport, dest, msg, None)?
		.ok_or_else(|| Error::ProtocolMismatch("GET_MANIFEST reply carried no chunk".to_owned()))?;
	let payload = chunk::verify(ctx, &data, req.coordinator_id)?;
	chunk::manifest_decode(&payload)
}

/// Stores one signed block at `dest`.
pub fn put_block(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	dest: u64,
	req: &RequestData,
	data: &[u8],
) -> Result<()> {
	let msg = RequestMsg::new(Verb::PutBlock, req.clone());
	call(ctx, transport, dest, msg, Some(data))?;
	Ok(())
}

/// Stores one signed serialized manifest at `dest`.
pub fn put_manifest(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	dest: u64,
	req: &RequestData,
	data: &[u8],
) -> Result<()> {
	let msg = RequestMsg::new(Verb::PutManifest, req.clone());
	call(ctx, transport, dest, msg, Some(data))?;
	Ok(())
}

/// Deletes a list of chunks at `dest`.
pub fn delete_chunks(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	dest: u64,
	req: &RequestData,
	chunks: Vec<ChunkDescriptor>,
) -> Result<()> {
	let mut msg = RequestMsg::new(Verb::DeleteChunks, req.clone());
	msg.chunks = chunks;
	call(ctx, transport, dest, msg, None)?;
	Ok(())
}

/// Asks the coordinator `dest` to rename a file.
pub fn rename(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	dest: u64,
	req: &RequestData,
	new_fs_path: &str,
) -> Result<()> {
	let mut msg = RequestMsg::new(Verb::Rename, req.clone());
	msg.new_fs_path = Some(new_fs_path.to_owned());
	call(ctx, transport, dest, msg, None)?;
	Ok(())
}

/// Asks the coordinator `dest` to truncate a file.
pub fn truncate(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	dest: u64,
	req: &RequestData,
	new_size: u64,
) -> Result<()> {
	let mut msg = RequestMsg::new(Verb::Truncate, req.clone());
	msg.new_size = Some(new_size);
	call(ctx, transport, dest, msg, None)?;
	Ok(())
}

/// Asks `dest` to detach a file.
pub fn detach(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	dest: u64,
	req: &RequestData,
) -> Result<()> {
	let msg = RequestMsg::new(Verb::Detach, req.clone());
	call(ctx, transport, dest, msg, None)?;
	Ok(())
}

/// Pushes a manifest delta to the coordinator `dest`.
pub fn patch_manifest(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	dest: u64,
	req: &RequestData,
	delta: &Manifest,
) -> Result<()> {
	let msg = RequestMsg::new(Verb::PatchManifest, req.clone());
	let data = chunk::manifest_encode(ctx, delta)?;
	call(ctx, transport, dest, msg, Some(data.as_slice()))?;
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::testutil;
	use crate::testutil::BLOCK_SIZE;

	#[test]
	fn unknown_sender_is_rejected() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		let _rg = net.add_rg(20);

		// gateway 99 is not in the volume's cert set
		let mut req = crate::request::RequestData::block(
			"/f",
			1,
			1,
			10,
			testutil::VOLUME_ID,
			10,
			testutil::USER_ID,
			0,
			1,
		);
		req.src_gateway_id = 99;
		let msg = RequestMsg::new(Verb::GetBlock, req);
		let rc = call(&ug.ctx, &*net, 20, msg, None);
		assert!(matches!(rc, Err(Error::PermissionDenied)));
	}

	#[test]
	fn wrong_volume_is_rejected() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		let _rg = net.add_rg(20);

		let mut req = crate::request::RequestData::block(
			"/f",
			1,
			1,
			10,
			testutil::VOLUME_ID,
			10,
			testutil::USER_ID,
			0,
			1,
		);
		req.volume_id = testutil::VOLUME_ID + 1;
		let msg = RequestMsg::new(Verb::GetBlock, req);
		let rc = call(&ug.ctx, &*net, 20, msg, None);
		assert!(matches!(rc, Err(Error::InvalidArgument(_))));
	}

	#[test]
	fn replica_refuses_a_manifest_from_a_non_coordinator() {
		let net = testutil::Network::new();
		let ug_a = net.add_ug(10);
		let ug_b = net.add_ug(11);
		let _ = ug_a;
		let _rg = net.add_rg(20);
		net.refresh_certs();

		// B replicates a manifest that names A as coordinator
		let mut manifest = crate::manifest::Manifest::new(testutil::VOLUME_ID, 10, 0x300, 1);
		manifest
			.put_block(0, crate::manifest::BlockInfo::new(1, None), false)
			.unwrap();
		let req = crate::request::RequestData::manifest(
			"/f",
			0x300,
			1,
			10,
			testutil::VOLUME_ID,
			11,
			testutil::USER_ID,
			crate::util::TimeSpec::new(5, 0),
		);
		let encoded = crate::chunk::manifest_encode(&ug_b.ctx, &manifest).unwrap();
		let signed = crate::chunk::sign(&ug_b.ctx, &req, &encoded).unwrap();
		let rc = put_manifest(&ug_b.ctx, &*net, 20, &req, &signed);
		assert!(matches!(rc, Err(Error::Stale)));
	}

	#[test]
	fn replica_rejects_ug_only_verbs() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		let _rg = net.add_rg(20);

		let req = crate::request::RequestData::manifest(
			"/f",
			1,
			1,
			10,
			testutil::VOLUME_ID,
			10,
			testutil::USER_ID,
			crate::util::TimeSpec::new(1, 0),
		);
		let rc = rename(&ug.ctx, &*net, 20, &req, "/g");
		assert!(matches!(rc, Err(Error::ProtocolMismatch(_))));
		let rc = truncate(&ug.ctx, &*net, 20, &req, BLOCK_SIZE);
		assert!(matches!(rc, Err(Error::ProtocolMismatch(_))));
		let rc = detach(&ug.ctx, &*net, 20, &req);
		assert!(matches!(rc, Err(Error::ProtocolMismatch(_))));
	}

	#[test]
	fn non_coordinator_get_manifest_is_stale() {
		let net = testutil::Network::new();
		let ug_a = net.add_ug(10);
		let ug_b = net.add_ug(11);

		ug_a.create("/owned", 0o644).unwrap();
		// warm B's cache so its server can resolve the path
		ug_b.stat("/owned").unwrap();

		let ent = net.ms.entry("/owned").unwrap();
		let req = crate::request::RequestData::manifest(
			"/owned",
			ent.file_id,
			1,
			10,
			testutil::VOLUME_ID,
			10,
			testutil::USER_ID,
			ent.manifest_mtime,
		);
		// B does not coordinate the file; it must punt to the coordinator
		let rc = get_manifest(&ug_a.ctx, &*net, 11, &req);
		assert!(matches!(rc, Err(Error::Stale)));
	}

	#[test]
	fn tampered_body_is_rejected() {
		let net = testutil::Network::new();
		let ug = net.add_ug(10);
		let _rg = net.add_rg(20);

		let req = crate::request::RequestData::block(
			"/f",
			1,
			1,
			10,
			testutil::VOLUME_ID,
			10,
			testutil::USER_ID,
			0,
			1,
		);
		let mut msg = RequestMsg::new(Verb::GetBlock, req);
		msg.sign(&ug.ctx).unwrap();
		// flip a field after signing
		msg.data.file_id = 2;
		let mut body = Vec::new();
		let bytes = wire::encode(&msg).unwrap();
		wire::write_frame(&mut body, &bytes).unwrap();
		let reply_body = net.exchange(20, &body).unwrap();

		let mut cursor = Cursor::new(reply_body.as_slice());
		let reply: ReplyMsg = wire::decode(&wire::read_frame(&mut cursor).unwrap()).unwrap();
		assert_eq!(reply.error_code, -libc::EIO);
	}
}
