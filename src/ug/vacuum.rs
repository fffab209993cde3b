//! Asynchronous reclamation of superseded chunks.
//!
//! Each vacuum context targets one `(file_id, file_version, manifest_mtime)`
//! tuple. The worker peeks the MS vacuum log head, rebuilds the set of
//! blocks the write superseded (downloading the prior manifest from the
//! replicas when the caller did not supply it), fans a DELETECHUNKS out to
//! every replica, and pops the log head it peeked. The tuple may be
//! re-processed any number of times: the pop is idempotent, deletes
//! address exact versions, and the mtime travels in the request, so the
//! work unit's identity never depends on the clock.

use crate::cache::FsCache;
use crate::error::Result;
use crate::gateway::GatewayContext;
use crate::manifest::Manifest;
use crate::ms::MsClient;
use crate::ms::VacuumLogEntry;
use crate::replication;
use crate::replication::RgContext;
use crate::request::RequestData;
use crate::rpc;
use crate::rpc::Transport;
use crate::util::random64;
use crate::util::Semaphore;
use crate::util::TimeSpec;
use crate::wire::ChunkDescriptor;
use crate::wire::RequestMsg;
use crate::wire::Verb;
use log::debug;
use log::error;
use log::info;
use log::warn;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

/// Longest retry delay, in seconds.
const MAX_DELAY_SECS: i64 = 3600;

/// One unit of vacuum work.
pub struct VacuumContext {
	/// Path of the file within the volume.
	pub fs_path: String,
	/// File identifier.
	pub file_id: u64,
	/// File version the superseded write belonged to.
	pub file_version: i64,
	/// Manifest modtime the write superseded.
	pub manifest_mtime: TimeSpec,
	/// Replaced blocks, when the flush that created the garbage is
	/// still around to say; rebuilt from the replicas otherwise.
	pub old_blocks: Option<Manifest>,
	/// Set when the whole file is being unlinked; the live manifest is
	/// then fair game.
	pub unlinking: bool,
	delay: i64,
	retry_at: Option<Instant>,
}

impl VacuumContext {
	/// Builds a context for one superseded write.
	pub fn new(
		fs_path: &str,
		file_id: u64,
		file_version: i64,
		manifest_mtime: TimeSpec,
		old_blocks: Option<Manifest>,
	) -> Self {
		Self {
			fs_path: fs_path.to_owned(),
			file_id,
			file_version,
			manifest_mtime,
			old_blocks,
			unlinking: false,
			delay: 0,
			retry_at: None,
		}
	}

	/// Marks the context as an unlink; every chunk of the file is
	/// reclaimed, current manifest included.
	pub fn unlinking(mut self) -> Self {
		self.unlinking = true;
		self
	}

	/// Backs the retry deadline off exponentially with jitter, capped
	/// at an hour.
	fn set_delay(&mut self) {
		if self.delay <= 1 {
			self.delay = 1;
		}
		if self.delay < MAX_DELAY_SECS {
			let jitter = (random64() % self.delay as u64) as i64;
			self.delay = ((self.delay << 1) + jitter).min(MAX_DELAY_SECS);
		}
		self.retry_at = Some(Instant::now() + Duration::from_secs(self.delay as u64));
	}
}

/// What became of one processing pass.
enum Outcome {
	/// The garbage is gone and the log entry popped.
	Done,
	/// A replica refused; try again after the backoff.
	Retry,
	/// The replicas no longer hold a block the MS names: lost data.
	/// Logged, never retried.
	Fatal,
}

struct Inner {
	ctx: Arc<GatewayContext>,
	ms: Arc<dyn MsClient>,
	transport: Arc<dyn Transport>,
	cache: Arc<FsCache>,
	queue: RwLock<VecDeque<VacuumContext>>,
	wake: Semaphore,
}

/// The vacuum worker and its queue.
pub struct Vacuumer {
	inner: Arc<Inner>,
	thread: Mutex<Option<JoinHandle<()>>>,
}

impl Vacuumer {
	/// Starts the worker thread.
	pub fn start(
		ctx: Arc<GatewayContext>,
		ms: Arc<dyn MsClient>,
		transport: Arc<dyn Transport>,
		cache: Arc<FsCache>,
	) -> Self {
		let inner = Arc::new(Inner {
			ctx,
			ms,
			transport,
			cache,
			queue: RwLock::new(VecDeque::new()),
			wake: Semaphore::new(0),
		});
		let worker = Arc::clone(&inner);
		let thread = thread::Builder::new()
			.name("vacuumer".to_owned())
			.spawn(move || worker_main(worker))
			.expect("vacuumer thread spawn");
		Self {
			inner,
			thread: Mutex::new(Some(thread)),
		}
	}

	/// Queues one context.
	pub fn enqueue(&self, vctx: VacuumContext) {
		self.inner.queue.write().push_back(vctx);
		self.inner.wake.release();
	}

	/// Pending contexts.
	pub fn backlog(&self) -> usize {
		self.inner.queue.read().len()
	}

	/// Stops the worker; pending contexts stay queued for the next run.
	pub fn stop(&self) {
		self.inner.ctx.cancel.cancel();
		self.inner.wake.release();
		if let Some(handle) = self.thread.lock().take() {
			let _ = handle.join();
		}
	}

	/// Runs one context synchronously; test aid.
	#[cfg(test)]
	pub fn process_one(&self, vctx: &mut VacuumContext) -> Result<bool> {
		match process(&self.inner, vctx) {
			Outcome::Done => Ok(true),
			Outcome::Retry => Ok(false),
			Outcome::Fatal => Ok(false),
		}
	}
}

fn worker_main(inner: Arc<Inner>) {
	debug!("vacuumer start");
	loop {
		inner.wake.acquire();
		if inner.ctx.cancel.is_cancelled() {
			break;
		}
		let Some(mut vctx) = inner.queue.write().pop_front() else {
			continue;
		};

		// honor the retry deadline, a second at a time so cancellation
		// stays responsive
		if let Some(retry_at) = vctx.retry_at {
			while Instant::now() < retry_at {
				if inner.ctx.cancel.is_cancelled() {
					return;
				}
				let left = retry_at.saturating_duration_since(Instant::now());
				thread::sleep(Duration::from_secs(1).min(left));
			}
		}

		match process(&inner, &mut vctx) {
			Outcome::Done => {
				debug!(
					"vacuumed {:X}.{} manifest {}",
					vctx.file_id, vctx.file_version, vctx.manifest_mtime
				);
			}
			Outcome::Fatal => {
				error!(
					"vacuum of {:X}.{} manifest {} lost data; giving up",
					vctx.file_id, vctx.file_version, vctx.manifest_mtime
				);
			}
			Outcome::Retry => {
				vctx.set_delay();
				info!(
					"vacuum of {:X}.{} manifest {} retries in {}s",
					vctx.file_id, vctx.file_version, vctx.manifest_mtime, vctx.delay
				);
				inner.queue.write().push_back(vctx);
				inner.wake.release();
			}
		}
	}
	debug!("vacuumer stop");
}

fn process(inner: &Inner, vctx: &mut VacuumContext) -> Outcome {
	let ctx = &inner.ctx;

	// 1. peek the log head
	let head = match inner.ms.peek_vacuum_log(ctx.volume.id, vctx.file_id) {
		Ok(Some(head)) => head,
		Ok(None) => return Outcome::Done,
		Err(e) => {
			warn!("vacuum log peek for {:X}: {}", vctx.file_id, e);
			return Outcome::Retry;
		}
	};
	if head.writer_id != ctx.id {
		// someone else's garbage; nothing for this gateway to do
		return Outcome::Done;
	}

	// never vacuum the live manifest, unless the file is going away
	if !vctx.unlinking && head.manifest_mtime == current_manifest_mtime(inner, &vctx.fs_path) {
		return Outcome::Done;
	}

	// 2. rebuild the replaced-block set if the caller had none
	let old_blocks = match vctx.old_blocks.as_ref() {
		Some(m) => m.clone(),
		None => match download_old_blocks(inner, vctx, &head) {
			Ok(Some(m)) => {
				vctx.old_blocks = Some(m.clone());
				m
			}
			Ok(None) => return Outcome::Fatal,
			Err(e) => {
				warn!(
					"prior manifest {} of {:X}: {}",
					head.manifest_mtime, vctx.file_id, e
				);
				return Outcome::Retry;
			}
		},
	};

	// 3. one DELETECHUNKS covering the manifest and every dead block
	let mut chunks = vec![ChunkDescriptor::Manifest {
		mtime: head.manifest_mtime,
	}];
	for (id, info) in old_blocks.iter() {
		chunks.push(ChunkDescriptor::Block {
			block_id: *id,
			block_version: info.version,
		});
	}
	let req = RequestData::manifest(
		&vctx.fs_path,
		vctx.file_id,
		head.file_version,
		ctx.id,
		ctx.volume.id,
		ctx.id,
		ctx.user_id,
		head.manifest_mtime,
	);
	let mut msg = RequestMsg::new(Verb::DeleteChunks, req);
	msg.chunks = chunks;

	// 4. every replica must agree before the log entry may go
	let rg_ctx = RgContext::for_volume(ctx);
	if let Err(e) = replication::replicate_all(ctx, inner.transport.as_ref(), &msg, None, &rg_ctx) {
		warn!(
			"DELETECHUNKS for {:X}.{} manifest {}: {}",
			vctx.file_id, head.file_version, head.manifest_mtime, e
		);
		return Outcome::Retry;
	}

	// 5. pop the head we peeked
	match inner.ms.remove_vacuum_log_entry(
		head.writer_id,
		head.file_id,
		head.file_version,
		head.manifest_mtime,
	) {
		Ok(()) => Outcome::Done,
		Err(e) => {
			warn!("vacuum log pop for {:X}: {}", vctx.file_id, e);
			Outcome::Retry
		}
	}
}

/// Modtime of the file's live manifest, if the inode is still cached.
fn current_manifest_mtime(inner: &Inner, fs_path: &str) -> TimeSpec {
	inner
		.cache
		.resolve(fs_path)
		.ok()
		.map(|node| node.state.read().manifest_mtime)
		.unwrap_or_default()
}

/// Downloads the superseded manifest from the replicas and resolves the
/// MS's affected blocks against it.
///
/// `Ok(None)` means the manifest lacks a block the MS names, which
/// indicates lost data.
fn download_old_blocks(
	inner: &Inner,
	vctx: &VacuumContext,
	head: &VacuumLogEntry,
) -> Result<Option<Manifest>> {
	let ctx = &inner.ctx;
	let req = RequestData::manifest(
		&vctx.fs_path,
		head.file_id,
		head.file_version,
		ctx.id,
		ctx.volume.id,
		ctx.id,
		ctx.user_id,
		head.manifest_mtime,
	);

	let mut manifest = None;
	for rg in ctx.rg_ids() {
		match rpc::get_manifest(ctx, inner.transport.as_ref(), rg, &req) {
			Ok(m) => {
				manifest = Some(m);
				break;
			}
			Err(e) => warn!(
				"prior manifest {} from RG {}: {}",
				head.manifest_mtime, rg, e
			),
		}
	}
	let manifest = manifest.ok_or(crate::error::Error::NoData)?;

	let mut old_blocks = Manifest::new(ctx.volume.id, ctx.id, head.file_id, head.file_version);
	old_blocks.modtime = head.manifest_mtime;
	for block_id in &head.affected_blocks {
		let Some(info) = manifest.get_block(*block_id) else {
			error!(
				"manifest {} of {:X} lacks block {} named by the vacuum log",
				head.manifest_mtime, head.file_id, block_id
			);
			return Ok(None);
		};
		old_blocks.put_block(*block_id, *info, true)?;
	}
	Ok(Some(old_blocks))
}
