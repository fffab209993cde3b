//! A single-thread work queue with fire-and-forget and promise submissions.
//!
//! Used for deferred inode removal and other background chores that must
//! not run under a caller's locks.

use crate::error::Error;
use crate::error::Result;
use crossbeam::channel;
use log::debug;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

type Work = Box<dyn FnOnce() -> Result<()> + Send>;

struct Inner {
	queue: Mutex<VecDeque<(Work, Option<channel::Sender<Result<()>>>)>>,
	cond: Condvar,
	running: AtomicBool,
}

/// Handle on a promise submission; resolves when the work ran.
pub struct Promise {
	rx: channel::Receiver<Result<()>>,
}

impl Promise {
	/// Blocks until the work completed and returns its result.
	pub fn wait(self) -> Result<()> {
		self.rx
			.recv()
			.unwrap_or_else(|_| Err(Error::Io("work queue stopped".to_owned())))
	}
}

/// The work queue and its worker thread.
pub struct WorkQueue {
	inner: Arc<Inner>,
	thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
	/// Starts the worker thread.
	pub fn start(name: &str) -> Self {
		let inner = Arc::new(Inner {
			queue: Mutex::new(VecDeque::new()),
			cond: Condvar::new(),
			running: AtomicBool::new(true),
		});
		let worker = Arc::clone(&inner);
		let thread = thread::Builder::new()
			.name(name.to_owned())
			.spawn(move || worker_main(worker))
			.expect("work queue thread spawn");
		Self {
			inner,
			thread: Mutex::new(Some(thread)),
		}
	}

	/// Enqueues fire-and-forget work.
	pub fn add<F: FnOnce() -> Result<()> + Send + 'static>(&self, work: F) {
		self.push(Box::new(work), None);
	}

	/// Enqueues work and returns a promise for its result.
	pub fn add_promise<F: FnOnce() -> Result<()> + Send + 'static>(&self, work: F) -> Promise {
		let (tx, rx) = channel::bounded(1);
		self.push(Box::new(work), Some(tx));
		Promise { rx }
	}

	fn push(&self, work: Work, promise: Option<channel::Sender<Result<()>>>) {
		let mut queue = self.inner.queue.lock();
		queue.push_back((work, promise));
		drop(queue);
		self.inner.cond.notify_one();
	}

	/// Stops the worker after it drains the pending work.
	pub fn stop(&self) {
		self.inner.running.store(false, Ordering::SeqCst);
		self.inner.cond.notify_all();
		if let Some(handle) = self.thread.lock().take() {
			let _ = handle.join();
		}
	}
}

impl Drop for WorkQueue {
	fn drop(&mut self) {
		self.stop();
	}
}

fn worker_main(inner: Arc<Inner>) {
	debug!("work queue start");
	loop {
		let next = {
			let mut queue = inner.queue.lock();
			loop {
				if let Some(item) = queue.pop_front() {
					break Some(item);
				}
				if !inner.running.load(Ordering::SeqCst) {
					break None;
				}
				inner.cond.wait(&mut queue);
			}
		};
		let Some((work, promise)) = next else {
			break;
		};
		let rc = work();
		if let Err(e) = &rc {
			debug!("work item rc = {}", e);
		}
		if let Some(tx) = promise {
			let _ = tx.send(rc);
		}
	}
	debug!("work queue stop");
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::AtomicUsize;

	#[test]
	fn promise_returns_the_work_result() {
		let wq = WorkQueue::start("test-wq");
		let ok = wq.add_promise(|| Ok(()));
		let err = wq.add_promise(|| Err(Error::NotFound));
		assert!(ok.wait().is_ok());
		assert!(matches!(err.wait(), Err(Error::NotFound)));
		wq.stop();
	}

	#[test]
	fn pending_work_drains_on_stop() {
		let wq = WorkQueue::start("test-wq");
		let count = Arc::new(AtomicUsize::new(0));
		for _ in 0..16 {
			let count = Arc::clone(&count);
			wq.add(move || {
				count.fetch_add(1, Ordering::SeqCst);
				Ok(())
			});
		}
		wq.stop();
		assert_eq!(count.load(Ordering::SeqCst), 16);
	}
}
