//! Credential entry on the controlling terminal.

use crate::error::Error;
use crate::error::Result;
use libc::tcgetattr;
use libc::tcsetattr;
use libc::termios;
use libc::ECHO;
use libc::ECHOE;
use libc::STDIN_FILENO;
use libc::TCSANOW;
use log::warn;
use std::io;
use std::io::BufRead;
use std::io::Write;
use std::mem::MaybeUninit;

/// Puts the saved terminal state back on drop, so an early error cannot
/// leave the terminal with echo disabled.
struct EchoGuard {
	saved: termios,
}

impl Drop for EchoGuard {
	fn drop(&mut self) {
		let rc = unsafe { tcsetattr(STDIN_FILENO, TCSANOW, &self.saved) };
		if rc != 0 {
			warn!(
				"could not restore terminal state: {}",
				io::Error::last_os_error()
			);
		}
	}
}

/// Reads one line from stdin with echo suppressed; used for `-p`
/// password entry.
///
/// Fails when stdin is not a terminal or the terminal state cannot be
/// changed.
pub fn read_secret(prompt: &str) -> Result<String> {
	let saved = unsafe {
		let mut t = MaybeUninit::<termios>::zeroed().assume_init();
		if tcgetattr(STDIN_FILENO, &mut t) != 0 {
			return Err(io::Error::last_os_error().into());
		}
		t
	};

	let mut quiet = saved;
	quiet.c_lflag &= !(ECHO | ECHOE);
	let rc = unsafe { tcsetattr(STDIN_FILENO, TCSANOW, &quiet) };
	if rc != 0 {
		return Err(io::Error::last_os_error().into());
	}
	let guard = EchoGuard { saved };

	print!("{}", prompt);
	io::stdout().flush()?;

	let mut line = String::new();
	let n = io::stdin().lock().read_line(&mut line)?;
	println!();
	drop(guard);

	if n == 0 {
		return Err(Error::Io("end of input while reading a secret".to_owned()));
	}
	while line.ends_with('\n') || line.ends_with('\r') {
		line.pop();
	}
	Ok(line)
}
