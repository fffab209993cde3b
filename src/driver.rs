//! Out-of-process storage-driver worker pools.
//!
//! A driver is an executable spawned as a fixed pool of long-lived child
//! processes per role, each a single-threaded consumer of its stdin. One
//! dispatch writes a framed request and optional chunk, then reads a
//! framed int64 status and optional chunk back. Pool saturation is a
//! gateway-side, retryable condition; a non-zero status or a dead child is
//! a driver error and is never retried silently.

use crate::error::Error;
use crate::error::Result;
use crate::request::RequestData;
use crate::wire;
use log::debug;
use log::error;
use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;
use std::process::Child;
use std::process::ChildStdin;
use std::process::ChildStdout;
use std::process::Command;
use std::process::Stdio;
use uuid::Uuid;

/// The roles a driver executable may serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DriverRole {
	/// Fetch a chunk from backing storage.
	Read,
	/// Store a chunk into backing storage.
	Write,
	/// Remove a chunk from backing storage.
	Delete,
	/// Transform a chunk before signing (compression, encryption).
	Serialize,
	/// Inverse transform after verification.
	Deserialize,
	/// Rewrite a block URL for CDN access.
	CdnUrl,
	/// Produce dataset stanzas for an acquisition gateway.
	Crawl,
}

impl DriverRole {
	/// The role's name, as passed to the driver executable.
	pub fn as_str(&self) -> &'static str {
		match self {
			DriverRole::Read => "read",
			DriverRole::Write => "write",
			DriverRole::Delete => "delete",
			DriverRole::Serialize => "serialize",
			DriverRole::Deserialize => "deserialize",
			DriverRole::CdnUrl => "cdn_url",
			DriverRole::Crawl => "crawl",
		}
	}

	/// Tells whether a successful dispatch carries a chunk back.
	fn replies_with_chunk(&self) -> bool {
		matches!(
			self,
			DriverRole::Read | DriverRole::Serialize | DriverRole::Deserialize | DriverRole::CdnUrl
		)
	}
}

/// One long-lived driver child process.
pub struct DriverProc {
	child: Child,
	stdin: ChildStdin,
	stdout: BufReader<ChildStdout>,
	pid: u32,
	tag: Uuid,
	broken: bool,
}

impl DriverProc {
	/// Spawns one worker for `role`.
	fn spawn(exec: &Path, role: DriverRole) -> Result<Self> {
		let mut child = Command::new(exec)
			.arg(role.as_str())
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.spawn()?;
		let stdin = child
			.stdin
			.take()
			.ok_or_else(|| Error::Io("driver child has no stdin".to_owned()))?;
		let stdout = child
			.stdout
			.take()
			.ok_or_else(|| Error::Io("driver child has no stdout".to_owned()))?;
		let pid = child.id();
		let tag = Uuid::new_v4();
		debug!("spawned {} worker pid {} tag {}", role.as_str(), pid, tag);
		Ok(Self {
			child,
			stdin,
			stdout: BufReader::new(stdout),
			pid,
			tag,
			broken: false,
		})
	}

	/// Pid of the child.
	pub fn pid(&self) -> u32 {
		self.pid
	}

	/// Writes the framed request message.
	pub fn write_request(&mut self, req: &RequestData) -> Result<()> {
		let bytes = wire::encode(req)?;
		wire::write_frame(&mut self.stdin, &bytes)
	}

	/// Writes one framed chunk.
	pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
		wire::write_frame(&mut self.stdin, chunk)
	}

	/// Reads the framed int64 status.
	pub fn read_status(&mut self) -> Result<i64> {
		wire::read_status(&mut self.stdout)
	}

	/// Reads one framed chunk.
	pub fn read_chunk(&mut self) -> Result<Vec<u8>> {
		wire::read_frame(&mut self.stdout)
	}

	/// Borrows the child's stdout for streaming consumers (crawler).
	pub fn stdout(&mut self) -> &mut BufReader<ChildStdout> {
		&mut self.stdout
	}

	/// Marks the worker unusable; it is respawned on release.
	pub fn poison(&mut self) {
		self.broken = true;
	}

	fn is_alive(&mut self) -> bool {
		!self.broken && matches!(self.child.try_wait(), Ok(None))
	}
}

impl Drop for DriverProc {
	fn drop(&mut self) {
		let _ = self.child.kill();
		let _ = self.child.wait();
	}
}

/// A fixed pool of workers serving one role.
pub struct ProcGroup {
	role: DriverRole,
	exec: PathBuf,
	free: Mutex<Vec<DriverProc>>,
	cond: Condvar,
	size: usize,
}

impl ProcGroup {
	/// Spawns `size` workers for `role`.
	fn start(exec: &Path, role: DriverRole, size: usize) -> Result<Self> {
		let mut free = Vec::with_capacity(size);
		for _ in 0..size {
			free.push(DriverProc::spawn(exec, role)?);
		}
		Ok(Self {
			role,
			exec: exec.to_owned(),
			free: Mutex::new(free),
			cond: Condvar::new(),
			size,
		})
	}

	/// Number of workers the group was started with.
	pub fn size(&self) -> usize {
		self.size
	}

	/// Takes a free worker, or `None` immediately if the pool is
	/// saturated.
	pub fn acquire(&self) -> Option<DriverProc> {
		self.free.lock().pop()
	}

	/// Takes a free worker, blocking until one is released.
	pub fn acquire_blocking(&self) -> DriverProc {
		let mut free = self.free.lock();
		loop {
			if let Some(proc) = free.pop() {
				return proc;
			}
			self.cond.wait(&mut free);
		}
	}

	/// Returns a worker to the pool, respawning it if it broke.
	pub fn release(&self, mut proc: DriverProc) {
		if !proc.is_alive() {
			warn!(
				"{} worker pid {} died; respawning",
				self.role.as_str(),
				proc.pid
			);
			drop(proc);
			match DriverProc::spawn(&self.exec, self.role) {
				Ok(fresh) => proc = fresh,
				Err(e) => {
					error!("respawn of {} worker: {}", self.role.as_str(), e);
					return;
				}
			}
		}
		self.free.lock().push(proc);
		self.cond.notify_one();
	}
}

/// A driver executable and its per-role worker pools.
pub struct Driver {
	groups: HashMap<DriverRole, ProcGroup>,
}

impl Driver {
	/// Starts pools of `workers` processes for each of `roles`.
	pub fn start(exec: &Path, roles: &[DriverRole], workers: usize) -> Result<Self> {
		let mut groups = HashMap::new();
		for role in roles {
			groups.insert(*role, ProcGroup::start(exec, *role, workers)?);
		}
		Ok(Self { groups })
	}

	/// A driver with no roles installed; every dispatch is `NoData`.
	pub fn disabled() -> Self {
		Self {
			groups: HashMap::new(),
		}
	}

	/// The pool serving `role`, if installed.
	pub fn group(&self, role: DriverRole) -> Option<&ProcGroup> {
		self.groups.get(&role)
	}

	/// Tells whether `role` is installed.
	pub fn has_role(&self, role: DriverRole) -> bool {
		self.groups.contains_key(&role)
	}

	/// Runs one request through a worker of `role`.
	///
	/// With `blocking` unset, saturation returns `NoData` immediately;
	/// blocking callers wait for a worker instead. A non-zero worker
	/// status, a dead child or a truncated reply is a driver error.
	pub fn dispatch(
		&self,
		role: DriverRole,
		req: &RequestData,
		chunk: Option<&[u8]>,
		blocking: bool,
	) -> Result<Option<Vec<u8>>> {
		let group = self.group(role).ok_or(Error::NoData)?;
		let mut proc = if blocking {
			group.acquire_blocking()
		} else {
			group.acquire().ok_or(Error::NoData)?
		};

		let result = Self::dispatch_on(&mut proc, role, req, chunk);
		if result.is_err() {
			proc.poison();
		}
		group.release(proc);
		result
	}

	fn dispatch_on(
		proc: &mut DriverProc,
		role: DriverRole,
		req: &RequestData,
		chunk: Option<&[u8]>,
	) -> Result<Option<Vec<u8>>> {
		let pid = proc.pid;
		let io_err = move |e: Error| Error::Driver {
			pid,
			role: role.as_str(),
			status: -(e.errno() as i64),
		};

		proc.write_request(req).map_err(io_err)?;
		if let Some(chunk) = chunk {
			proc.write_chunk(chunk).map_err(io_err)?;
		}

		let status = proc.read_status().map_err(io_err)?;
		if status != 0 {
			return Err(Error::Driver {
				pid: proc.pid,
				role: role.as_str(),
				status,
			});
		}

		if role.replies_with_chunk() {
			let reply = proc.read_chunk().map_err(io_err)?;
			Ok(Some(reply))
		} else {
			Ok(None)
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Write as _;
	use std::os::unix::fs::PermissionsExt;
	use tempfile::TempDir;

	/// A driver executable that ignores its role and echoes stdin.
	fn echo_driver() -> (TempDir, PathBuf) {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("echo-driver");
		let mut file = std::fs::File::create(&path).unwrap();
		file.write_all(b"#!/bin/sh\nexec cat\n").unwrap();
		drop(file);
		let mut perms = std::fs::metadata(&path).unwrap().permissions();
		perms.set_mode(0o755);
		std::fs::set_permissions(&path, perms).unwrap();
		(dir, path)
	}

	#[test]
	fn pool_saturation_and_release() {
		let (_dir, exec) = echo_driver();
		let group = ProcGroup::start(&exec, DriverRole::Read, 2).unwrap();
		let a = group.acquire().unwrap();
		let b = group.acquire().unwrap();
		assert!(group.acquire().is_none());
		group.release(a);
		let c = group.acquire().unwrap();
		assert!(group.acquire().is_none());
		group.release(b);
		group.release(c);
	}

	#[test]
	fn frames_cross_a_real_pipe() {
		// the echo driver sends back whatever frame goes in
		let (_dir, exec) = echo_driver();
		let group = ProcGroup::start(&exec, DriverRole::Read, 1).unwrap();
		let mut proc = group.acquire().unwrap();
		proc.write_chunk(b"payload bytes").unwrap();
		assert_eq!(proc.read_chunk().unwrap(), b"payload bytes");
		group.release(proc);
	}

	#[test]
	fn dead_worker_is_respawned_on_release() {
		let (_dir, exec) = echo_driver();
		let group = ProcGroup::start(&exec, DriverRole::Read, 1).unwrap();
		let mut proc = group.acquire().unwrap();
		let old_pid = proc.pid();
		proc.poison();
		group.release(proc);
		let fresh = group.acquire().unwrap();
		assert_ne!(fresh.pid(), old_pid);
		group.release(fresh);
	}

	#[test]
	fn absent_role_is_no_data() {
		let driver = Driver::disabled();
		let req = RequestData::block("/f", 1, 1, 1, 1, 1, 1, 0, 1);
		assert!(matches!(
			driver.dispatch(DriverRole::Read, &req, None, false),
			Err(Error::NoData)
		));
	}
}
