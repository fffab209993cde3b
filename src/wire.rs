//! Wire encoding shared by gateway-to-gateway RPC and the driver pipes.
//!
//! Every message travels as one length-delimited frame: an 8-byte
//! big-endian length followed by the payload. An RPC body is one framed
//! request message optionally followed by one framed chunk; a reply is one
//! framed reply message optionally followed by one framed chunk. Driver
//! pipes use the identical framing.

use crate::error::Error;
use crate::error::Result;
use crate::gateway::GatewayContext;
use crate::request::RequestData;
use crate::util::TimeSpec;
use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use serde::Deserialize;
use serde::Serialize;
use std::io::Read;
use std::io::Write;

/// Largest frame a gateway will read.
pub const MAX_FRAME: u64 = 64 * 1024 * 1024;

/// Writes one length-delimited frame.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<()> {
	w.write_u64::<BigEndian>(payload.len() as u64)?;
	w.write_all(payload)?;
	w.flush()?;
	Ok(())
}

/// Reads one length-delimited frame.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>> {
	let len = r.read_u64::<BigEndian>()?;
	if len > MAX_FRAME {
		return Err(Error::ProtocolMismatch(format!(
			"frame of {} bytes exceeds the {} byte limit",
			len, MAX_FRAME
		)));
	}
	let mut buf = vec![0u8; len as usize];
	r.read_exact(&mut buf)?;
	Ok(buf)
}

/// Writes an int64 status frame (driver replies).
pub fn write_status<W: Write>(w: &mut W, status: i64) -> Result<()> {
	write_frame(w, &status.to_be_bytes())
}

/// Reads an int64 status frame (driver replies).
pub fn read_status<R: Read>(r: &mut R) -> Result<i64> {
	let buf = read_frame(r)?;
	let bytes: [u8; 8] = buf
		.as_slice()
		.try_into()
		.map_err(|_| Error::ProtocolMismatch("truncated status frame".to_owned()))?;
	Ok(i64::from_be_bytes(bytes))
}

/// RPC verbs a gateway serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
	/// Fetch one signed block.
	GetBlock,
	/// Fetch one signed serialized manifest.
	GetManifest,
	/// Store one signed block.
	PutBlock,
	/// Store one signed serialized manifest.
	PutManifest,
	/// Delete a heterogeneous list of manifests and blocks.
	DeleteChunks,
	/// Rename a file at its coordinator.
	Rename,
	/// Truncate a file at its coordinator.
	Truncate,
	/// Detach (unlink) a file.
	Detach,
	/// Merge a manifest delta at the coordinator.
	PatchManifest,
}

/// Addresses one chunk within a `DeleteChunks` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkDescriptor {
	/// A manifest snapshot, by modtime.
	Manifest {
		/// Modtime identifying the snapshot.
		mtime: TimeSpec,
	},
	/// A block, by id and exact version.
	Block {
		/// Zero-based block index.
		block_id: u64,
		/// Version of that block.
		block_version: i64,
	},
}

/// The controlplane envelope of one RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestMsg {
	/// Operation requested.
	pub verb: Verb,
	/// Request coordinates and authorization fields.
	pub data: RequestData,
	/// Chunks addressed by a `DeleteChunks` request.
	pub chunks: Vec<ChunkDescriptor>,
	/// Destination path of a `Rename`.
	pub new_fs_path: Option<String>,
	/// New size of a `Truncate`.
	pub new_size: Option<u64>,
	/// Signature over the serialized message with this field empty.
	pub signature: Vec<u8>,
}

impl RequestMsg {
	/// Builds an unsigned envelope.
	pub fn new(verb: Verb, data: RequestData) -> Self {
		Self {
			verb,
			data,
			chunks: Vec::new(),
			new_fs_path: None,
			new_size: None,
			signature: Vec::new(),
		}
	}

	fn signable_bytes(&self) -> Result<Vec<u8>> {
		let mut unsigned = self.clone();
		unsigned.signature = Vec::new();
		bincode::serialize(&unsigned)
			.map_err(|e| Error::Io(format!("request serialization: {}", e)))
	}

	/// Signs the envelope with the sender's key.
	pub fn sign(&mut self, ctx: &GatewayContext) -> Result<()> {
		let bytes = self.signable_bytes()?;
		self.signature = ctx.sign(&bytes).to_vec();
		Ok(())
	}

	/// Verifies the envelope against the sender's MS-advertised key.
	pub fn verify(&self, ctx: &GatewayContext) -> Result<()> {
		let bytes = self.signable_bytes()?;
		ctx.verify(self.data.src_gateway_id, &bytes, &self.signature)
	}
}

/// The controlplane reply of one RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyMsg {
	/// Zero on success, a negated errno otherwise.
	pub error_code: i32,
}

impl ReplyMsg {
	/// A success reply.
	pub fn ok() -> Self {
		Self { error_code: 0 }
	}

	/// A failure reply carrying the error's negated errno.
	pub fn from_error(err: &Error) -> Self {
		Self {
			error_code: -err.errno(),
		}
	}

	/// Converts the reply back into a result.
	pub fn into_result(self) -> Result<()> {
		if self.error_code == 0 {
			Ok(())
		} else {
			Err(Error::from_errno(-self.error_code))
		}
	}
}

/// Encodes a message with bincode.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
	bincode::serialize(msg).map_err(|e| Error::Io(format!("message serialization: {}", e)))
}

/// Decodes a message with bincode.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
	bincode::deserialize(bytes)
		.map_err(|e| Error::ProtocolMismatch(format!("message deserialization: {}", e)))
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn frame_round_trip() {
		let mut buf = Vec::new();
		write_frame(&mut buf, b"abc").unwrap();
		write_status(&mut buf, -5).unwrap();
		write_frame(&mut buf, b"").unwrap();

		let mut cur = Cursor::new(buf);
		assert_eq!(read_frame(&mut cur).unwrap(), b"abc");
		assert_eq!(read_status(&mut cur).unwrap(), -5);
		assert_eq!(read_frame(&mut cur).unwrap(), Vec::<u8>::new());
	}

	#[test]
	fn frame_limit_enforced() {
		let mut buf = Vec::new();
		buf.extend_from_slice(&(MAX_FRAME + 1).to_be_bytes());
		let mut cur = Cursor::new(buf);
		assert!(matches!(
			read_frame(&mut cur),
			Err(Error::ProtocolMismatch(_))
		));
	}

	#[test]
	fn truncated_frame_is_an_error() {
		let mut buf = Vec::new();
		write_frame(&mut buf, b"abcdef").unwrap();
		buf.truncate(buf.len() - 2);
		let mut cur = Cursor::new(buf);
		assert!(read_frame(&mut cur).is_err());
	}

	#[test]
	fn reply_error_round_trip() {
		let reply = ReplyMsg::from_error(&Error::NotFound);
		assert_eq!(reply.error_code, -libc::ENOENT);
		assert!(matches!(reply.into_result(), Err(Error::NotFound)));
		assert!(ReplyMsg::ok().into_result().is_ok());
	}
}
