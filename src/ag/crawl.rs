//! The acquisition crawler: poll the crawl driver and publish datasets.
//!
//! The driver emits four-line stanzas:
//!
//! ```text
//! <cmd>\n                  cmd in {C,U,D,F}
//! <type> 0<mode> <size>\n  type in {F,D}, mode octal
//! <absolute-path>\n
//! \0\n
//! ```
//!
//! A stanza missing its terminator triggers a resync: lines are consumed
//! until `\0\n` shows up and the partial stanza is discarded.

use super::AgState;
use crate::driver::DriverRole;
use crate::error::Error;
use crate::error::Result;
use crate::gateway::CancelToken;
use crate::ms::EntryType;
use crate::ms::MdEntry;
use crate::util::path_basename;
use crate::util::path_dirname;
use crate::util::TimeSpec;
use log::debug;
use log::info;
use log::warn;
use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// The terminator line closing every stanza.
const TERMINATOR: &str = "\0\n";

/// What a stanza asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrawlCommand {
	/// Publish a new entry.
	Create,
	/// Refresh an existing entry.
	Update,
	/// Withdraw an entry.
	Delete,
	/// The crawler has no more work.
	Finish,
}

/// One parsed crawler stanza.
#[derive(Clone, Debug)]
pub struct CrawlStanza {
	/// Requested operation.
	pub cmd: CrawlCommand,
	/// File or directory.
	pub entry_type: EntryType,
	/// POSIX permission bits.
	pub mode: u32,
	/// Size in bytes.
	pub size: u64,
	/// Absolute path of the dataset entry.
	pub path: String,
}

fn parse_command(line: &str) -> Result<CrawlCommand> {
	match line {
		"C" => Ok(CrawlCommand::Create),
		"U" => Ok(CrawlCommand::Update),
		"D" => Ok(CrawlCommand::Delete),
		"F" => Ok(CrawlCommand::Finish),
		_ => Err(Error::ProtocolMismatch(format!(
			"unknown crawl command {:?}",
			line
		))),
	}
}

fn parse_metadata(line: &str) -> Result<(EntryType, u32, u64)> {
	let mut fields = line.split_whitespace();
	let entry_type = match fields.next() {
		Some("F") => EntryType::File,
		Some("D") => EntryType::Dir,
		other => {
			return Err(Error::ProtocolMismatch(format!(
				"bad crawl entry type {:?}",
				other
			)))
		}
	};
	let mode_str = fields
		.next()
		.ok_or_else(|| Error::ProtocolMismatch("crawl stanza lacks a mode".to_owned()))?;
	let mode = u32::from_str_radix(mode_str, 8)
		.map_err(|_| Error::ProtocolMismatch(format!("bad crawl mode {:?}", mode_str)))?;
	let size = fields
		.next()
		.ok_or_else(|| Error::ProtocolMismatch("crawl stanza lacks a size".to_owned()))?
		.parse::<u64>()
		.map_err(|_| Error::ProtocolMismatch("bad crawl size".to_owned()))?;
	Ok((entry_type, mode, size))
}

/// Reads one stanza.
///
/// Returns `Ok(None)` at end of input. A malformed stanza consumes input
/// up to the next terminator and returns `ProtocolMismatch`.
pub fn read_stanza<R: BufRead>(input: &mut R) -> Result<Option<CrawlStanza>> {
	let mut lines: Vec<String> = Vec::with_capacity(3);
	for i in 0..3 {
		let mut line = String::new();
		let n = input.read_line(&mut line)?;
		if n == 0 {
			if i == 0 {
				return Ok(None);
			}
			return Err(Error::ProtocolMismatch(
				"crawl input ended mid-stanza".to_owned(),
			));
		}
		if line == TERMINATOR {
			return Err(Error::ProtocolMismatch(format!(
				"early terminator at stanza line {}",
				i
			)));
		}
		if line.ends_with('\n') {
			line.pop();
		}
		lines.push(line);
	}

	let mut term = String::new();
	let n = input.read_line(&mut term)?;
	if n == 0 || term != TERMINATOR {
		resync(input)?;
		return Err(Error::ProtocolMismatch(
			"stanza missing its terminator".to_owned(),
		));
	}

	let cmd = parse_command(&lines[0])?;
	if cmd == CrawlCommand::Finish {
		return Ok(Some(CrawlStanza {
			cmd,
			entry_type: EntryType::File,
			mode: 0,
			size: 0,
			path: String::new(),
		}));
	}
	let (entry_type, mode, size) = parse_metadata(&lines[1])?;
	let path = lines[2].clone();
	if !path.starts_with('/') {
		return Err(Error::ProtocolMismatch(format!(
			"crawl path {:?} is not absolute",
			path
		)));
	}
	Ok(Some(CrawlStanza {
		cmd,
		entry_type,
		mode,
		size,
		path,
	}))
}

/// Consumes input until the next terminator.
fn resync<R: BufRead>(input: &mut R) -> Result<()> {
	loop {
		let mut line = String::new();
		let n = input.read_line(&mut line)?;
		if n == 0 || line == TERMINATOR {
			return Ok(());
		}
	}
}

/// Applies one stanza to the MS and the published map.
pub fn apply_stanza(state: &AgState, stanza: &CrawlStanza) -> Result<()> {
	match stanza.cmd {
		CrawlCommand::Finish => Ok(()),
		CrawlCommand::Create => {
			let entry = build_entry(state, stanza);
			let published = state.ms.create(&entry)?;
			let manifest = match stanza.entry_type {
				EntryType::File => Some(state.synthesize_manifest(&published, None)),
				EntryType::Dir => None,
			};
			info!("published {} ({} bytes)", stanza.path, stanza.size);
			state.insert_published(&stanza.path, published, manifest);
			Ok(())
		}
		CrawlCommand::Update => {
			let mut entry = match state.published(&stanza.path) {
				Some((entry, _)) => entry,
				None => build_entry(state, stanza),
			};
			entry.mode = stanza.mode;
			entry.size = stanza.size;
			entry.mtime = TimeSpec::now();
			entry.manifest_mtime = entry.mtime;
			entry.write_nonce += 1;
			state.ms.update(&entry)?;
			let manifest = match stanza.entry_type {
				EntryType::File => Some(state.synthesize_manifest(&entry, None)),
				EntryType::Dir => None,
			};
			state.insert_published(&stanza.path, entry, manifest);
			Ok(())
		}
		CrawlCommand::Delete => {
			if let Some((entry, _)) = state.published(&stanza.path) {
				state.ms.delete(&entry)?;
			}
			state.remove_published(&stanza.path);
			Ok(())
		}
	}
}

fn build_entry(state: &AgState, stanza: &CrawlStanza) -> MdEntry {
	let now = TimeSpec::now();
	// a parent directory published earlier anchors the new entry; the
	// volume root otherwise
	let parent_id = state
		.published(&path_dirname(&stanza.path))
		.map(|(ent, _)| ent.file_id)
		.unwrap_or(0);
	MdEntry {
		entry_type: stanza.entry_type,
		name: path_basename(&stanza.path).to_owned(),
		file_id: 0,
		version: 1,
		owner: state.ctx.user_id,
		coordinator: state.ctx.id,
		volume: state.ctx.volume.id,
		mode: stanza.mode,
		size: stanza.size,
		ctime: now,
		mtime: now,
		manifest_mtime: now,
		write_nonce: 1,
		xattr_nonce: 1,
		generation: 0,
		num_children: 0,
		parent_id,
		max_read_freshness: 5000,
		max_write_freshness: 0,
	}
}

/// The crawler loop: poll the crawl driver until cancelled.
pub fn run(state: Arc<AgState>, cancel: CancelToken) {
	debug!("crawler start");
	while !cancel.is_cancelled() {
		let Some(group) = state.driver.group(DriverRole::Crawl) else {
			thread::sleep(Duration::from_secs(1));
			continue;
		};
		let Some(mut proc) = group.acquire() else {
			thread::sleep(Duration::from_millis(100));
			continue;
		};

		let stanza = read_stanza(proc.stdout());
		let mut pass_done = false;
		match &stanza {
			Err(e) => warn!("crawl stanza: {}", e),
			Ok(None) => {
				// the driver hung up; have the group respawn it
				proc.poison();
			}
			Ok(Some(stanza)) => {
				if stanza.cmd == CrawlCommand::Finish {
					debug!("crawler finished a pass");
					pass_done = true;
				} else if let Err(e) = apply_stanza(&state, stanza) {
					warn!("crawl apply for {}: {}", stanza.path, e);
				}
			}
		}
		group.release(proc);
		if pass_done {
			thread::sleep(Duration::from_secs(1));
		}
	}
	debug!("crawler stop");
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Cursor;

	#[test]
	fn stanza_round_trip() {
		let mut input = Cursor::new(b"C\nF 0644 1000\n/data/a.txt\n\0\n".to_vec());
		let stanza = read_stanza(&mut input).unwrap().unwrap();
		assert_eq!(stanza.cmd, CrawlCommand::Create);
		assert_eq!(stanza.entry_type, EntryType::File);
		assert_eq!(stanza.mode, 0o644);
		assert_eq!(stanza.size, 1000);
		assert_eq!(stanza.path, "/data/a.txt");
		assert!(read_stanza(&mut input).unwrap().is_none());
	}

	#[test]
	fn finish_stanza() {
		let mut input = Cursor::new(b"F\n- - -\n-\n\0\n".to_vec());
		let stanza = read_stanza(&mut input).unwrap().unwrap();
		assert_eq!(stanza.cmd, CrawlCommand::Finish);
	}

	#[test]
	fn directory_stanza() {
		let mut input = Cursor::new(b"U\nD 0755 0\n/data\n\0\n".to_vec());
		let stanza = read_stanza(&mut input).unwrap().unwrap();
		assert_eq!(stanza.cmd, CrawlCommand::Update);
		assert_eq!(stanza.entry_type, EntryType::Dir);
		assert_eq!(stanza.mode, 0o755);
	}

	#[test]
	fn missing_terminator_resyncs() {
		// first stanza lacks its terminator; the reader discards up to
		// the next one and the following stanza parses cleanly
		let bytes = b"C\nF 0644 10\n/x\nC\nF 0644 20\n/y\n\0\nD\nD 0755 0\n/z\n\0\n".to_vec();
		let mut input = Cursor::new(bytes);
		assert!(matches!(
			read_stanza(&mut input),
			Err(Error::ProtocolMismatch(_))
		));
		let stanza = read_stanza(&mut input).unwrap().unwrap();
		assert_eq!(stanza.cmd, CrawlCommand::Delete);
		assert_eq!(stanza.path, "/z");
	}

	#[test]
	fn bad_command_is_rejected() {
		let mut input = Cursor::new(b"X\nF 0644 10\n/x\n\0\n".to_vec());
		assert!(matches!(
			read_stanza(&mut input),
			Err(Error::ProtocolMismatch(_))
		));
	}
}
