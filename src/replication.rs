//! Replica fan-out: push one prepared request to every RG in parallel.

use crate::error::Error;
use crate::error::Result;
use crate::gateway::GatewayContext;
use crate::rpc;
use crate::rpc::Transport;
use crate::util::Semaphore;
use crate::wire::RequestMsg;
use log::warn;
use parking_lot::Mutex;
use std::thread;

/// Concurrent sends per fan-out.
const MAX_CONCURRENT: usize = 8;

/// Per-replica progress of one fan-out.
#[derive(Clone, Debug)]
pub enum RgStatus {
	/// Not yet sent.
	NotStarted,
	/// Send in flight.
	InProgress,
	/// The replica acknowledged.
	Success,
	/// The replica refused or was unreachable.
	Failed(Error),
}

/// Tracks one fan-out across the volume's replica gateways.
pub struct RgContext {
	rgs: Vec<u64>,
	status: Mutex<Vec<RgStatus>>,
}

impl RgContext {
	/// Builds a context covering `rgs`.
	pub fn new(rgs: Vec<u64>) -> Self {
		let status = vec![RgStatus::NotStarted; rgs.len()];
		Self {
			rgs,
			status: Mutex::new(status),
		}
	}

	/// Builds a context covering every RG the volume advertises.
	pub fn for_volume(ctx: &GatewayContext) -> Self {
		Self::new(ctx.rg_ids())
	}

	/// The replica ids covered.
	pub fn rgs(&self) -> &[u64] {
		&self.rgs
	}

	/// Snapshot of each replica's status, in `rgs()` order.
	pub fn statuses(&self) -> Vec<RgStatus> {
		self.status.lock().clone()
	}

	/// Ids of replicas that did not succeed.
	pub fn failed_rgs(&self) -> Vec<u64> {
		self.status
			.lock()
			.iter()
			.zip(&self.rgs)
			.filter(|(s, _)| !matches!(s, RgStatus::Success))
			.map(|(_, id)| *id)
			.collect()
	}

	fn set(&self, idx: usize, status: RgStatus) {
		self.status.lock()[idx] = status;
	}
}

/// Sends `msg` (and its optional dataplane chunk) to every replica in
/// `rg_ctx`, with bounded concurrency.
///
/// Succeeds only if every replica succeeded. Per-replica failures are
/// recorded in the context and collapse into one `Io` result; retry
/// policy belongs to the caller.
pub fn replicate_all(
	ctx: &GatewayContext,
	transport: &dyn Transport,
	msg: &RequestMsg,
	data: Option<&[u8]>,
	rg_ctx: &RgContext,
) -> Result<()> {
	if rg_ctx.rgs.is_empty() {
		return Ok(());
	}

	let gate = Semaphore::new(MAX_CONCURRENT);
	thread::scope(|scope| {
		for (idx, rg) in rg_ctx.rgs.iter().enumerate() {
			let gate = &gate;
			let rg_ctx = &rg_ctx;
			let msg = msg.clone();
			scope.spawn(move || {
				gate.acquire();
				rg_ctx.set(idx, RgStatus::InProgress);
				let rc = rpc::call(ctx, transport, *rg, msg, data);
				match rc {
					Ok(_) => rg_ctx.set(idx, RgStatus::Success),
					Err(e) => {
						warn!("replication to RG {} failed: {}", rg, e);
						rg_ctx.set(idx, RgStatus::Failed(e));
					}
				}
				gate.release();
			});
		}
	});

	let failed = rg_ctx.failed_rgs();
	if failed.is_empty() {
		Ok(())
	} else {
		Err(Error::Io(format!(
			"replication incomplete: RGs {:?} did not acknowledge",
			failed
		)))
	}
}
