//! This module implements utility types shared across the gateway core.

use parking_lot::Condvar;
use parking_lot::Mutex;
use rand_core::OsRng;
use rand_core::RngCore;
use serde::Deserialize;
use serde::Serialize;
use std::env;
use std::fmt;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// A wall-clock timestamp with nanosecond precision.
///
/// Manifest modtimes and freshness stamps are carried end-to-end in this
/// form so the identity of a work unit never depends on a reread of the
/// clock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeSpec {
	/// Seconds since the Unix epoch.
	pub sec: i64,
	/// Nanoseconds within the second.
	pub nsec: i32,
}

impl TimeSpec {
	/// Builds a timestamp from its parts.
	pub fn new(sec: i64, nsec: i32) -> Self {
		Self { sec, nsec }
	}

	/// Returns the current wall-clock time.
	pub fn now() -> Self {
		let d = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.expect("System clock panic!");
		Self {
			sec: d.as_secs() as i64,
			nsec: d.subsec_nanos() as i32,
		}
	}

	/// Difference `self - other` in milliseconds.
	pub fn diff_ms(&self, other: &TimeSpec) -> i64 {
		(self.sec - other.sec) * 1000 + (self.nsec as i64 - other.nsec as i64) / 1_000_000
	}

	/// Tells whether the stamp is unset.
	pub fn is_zero(&self) -> bool {
		self.sec == 0 && self.nsec == 0
	}
}

impl fmt::Display for TimeSpec {
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(fmt, "{}.{}", self.sec, self.nsec)
	}
}

/// Returns a random 64-bit integer from the OS entropy source.
pub fn random64() -> u64 {
	OsRng.next_u64()
}

/// A counting semaphore.
///
/// Gates driver-process acquisition and bounds replication fan-out
/// concurrency.
pub struct Semaphore {
	count: Mutex<usize>,
	cond: Condvar,
}

impl Semaphore {
	/// Creates a semaphore holding `count` permits.
	pub fn new(count: usize) -> Self {
		Self {
			count: Mutex::new(count),
			cond: Condvar::new(),
		}
	}

	/// Takes a permit, blocking until one is free.
	pub fn acquire(&self) {
		let mut count = self.count.lock();
		while *count == 0 {
			self.cond.wait(&mut count);
		}
		*count -= 1;
	}

	/// Takes a permit if one is free, without blocking.
	pub fn try_acquire(&self) -> bool {
		let mut count = self.count.lock();
		if *count == 0 {
			return false;
		}
		*count -= 1;
		true
	}

	/// Returns a permit.
	pub fn release(&self) {
		let mut count = self.count.lock();
		*count += 1;
		self.cond.notify_one();
	}
}

/// Configuration of the request trace subsystem, read from the
/// environment at startup.
///
/// Only the knobs are parsed here; log rollover and upload run outside
/// the gateway core.
#[derive(Clone, Debug, Default)]
pub struct TraceConfig {
	/// Master switch.
	pub enabled: bool,
	/// Host receiving trace logs.
	pub server_hostname: Option<String>,
	/// Port on the trace host.
	pub server_port: Option<u16>,
	/// Seconds between trace synchronizations.
	pub sync_delay: Option<u64>,
	/// Seconds before a trace upload is abandoned.
	pub timeout: Option<u64>,
	/// Salt mixed into hashed path names in traces.
	pub path_salt: Option<String>,
}

impl TraceConfig {
	/// Reads the trace configuration from the environment.
	pub fn from_env() -> Self {
		Self {
			enabled: env::var("IRODSFS_LOG_TRACE")
				.map(|v| v == "1")
				.unwrap_or(false),
			server_hostname: env::var("IRODSFS_LOG_SERVER_HOSTNAME").ok(),
			server_port: env::var("IRODSFS_LOG_SERVER_PORTNUM")
				.ok()
				.and_then(|v| v.parse().ok()),
			sync_delay: env::var("IRODSFS_LOG_SERVER_SYNC_DELAY")
				.ok()
				.and_then(|v| v.parse().ok()),
			timeout: env::var("IRODSFS_LOG_SERVER_TIMEOUT")
				.ok()
				.and_then(|v| v.parse().ok()),
			path_salt: env::var("IRODSFS_LOG_PATH_SALT").ok(),
		}
	}
}

/// Splits a filesystem path into its non-empty components.
pub fn path_components(path: &str) -> Vec<&str> {
	path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Returns the last component of a filesystem path.
pub fn path_basename(path: &str) -> &str {
	path_components(path).last().copied().unwrap_or("/")
}

/// Returns the path with its last component removed.
pub fn path_dirname(path: &str) -> String {
	let comps = path_components(path);
	if comps.len() <= 1 {
		return "/".to_owned();
	}
	format!("/{}", comps[..comps.len() - 1].join("/"))
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn timespec_diff() {
		let a = TimeSpec::new(10, 500_000_000);
		let b = TimeSpec::new(9, 0);
		assert_eq!(a.diff_ms(&b), 1500);
		assert_eq!(b.diff_ms(&a), -1500);
	}

	#[test]
	fn timespec_ordering() {
		assert!(TimeSpec::new(1, 0) < TimeSpec::new(1, 1));
		assert!(TimeSpec::new(1, 999_999_999) < TimeSpec::new(2, 0));
	}

	#[test]
	fn semaphore_counts() {
		let sem = Semaphore::new(2);
		assert!(sem.try_acquire());
		assert!(sem.try_acquire());
		assert!(!sem.try_acquire());
		sem.release();
		assert!(sem.try_acquire());
	}

	#[test]
	fn paths() {
		assert_eq!(path_components("/a/b/c"), vec!["a", "b", "c"]);
		assert_eq!(path_basename("/a/b/c"), "c");
		assert_eq!(path_dirname("/a/b/c"), "/a/b");
		assert_eq!(path_dirname("/a"), "/");
		assert_eq!(path_dirname("/"), "/");
	}
}
