//! Command-line options shared by every gateway binary.

use crate::error::Error;
use crate::error::Result;
use std::io::BufRead;
use std::path::PathBuf;

/// Parsed command-line options.
#[derive(Clone, Debug, Default)]
pub struct Opts {
	/// `-c`: configuration file.
	pub config: Option<PathBuf>,
	/// `-m`: metadata-service URL.
	pub ms_url: Option<String>,
	/// `-u`: user name.
	pub username: Option<String>,
	/// `-p`: user password.
	pub password: Option<String>,
	/// Set when `-p` was given without its argument; the binary prompts
	/// on the controlling terminal.
	pub password_prompt: bool,
	/// `-U`: path to the user private key.
	pub user_key_path: Option<PathBuf>,
	/// `-P`: user private key PEM, inline.
	pub user_key_pem: Option<String>,
	/// `-v`: volume name.
	pub volume: Option<String>,
	/// `-g`: gateway name.
	pub gateway: Option<String>,
	/// `-V`: path to the volume public key.
	pub volume_pubkey_path: Option<PathBuf>,
	/// `-G`: path to the gateway private key.
	pub gateway_key_path: Option<PathBuf>,
	/// `-K`: decryption password for the gateway private key.
	pub gateway_key_password: Option<String>,
	/// `-S`: path to the syndicate public key.
	pub syndicate_pubkey_path: Option<PathBuf>,
	/// `-T`: TLS private key.
	pub tls_key: Option<PathBuf>,
	/// `-C`: TLS certificate.
	pub tls_cert: Option<PathBuf>,
	/// `-r`: storage root.
	pub storage_root: Option<PathBuf>,
	/// `-l`: cache soft limit, bytes.
	pub cache_soft_limit: Option<u64>,
	/// `-L`: cache hard limit, bytes.
	pub cache_hard_limit: Option<u64>,
	/// `-d`: debug level.
	pub debug_level: u32,
	/// `-a`: anonymous operation.
	pub anonymous: bool,
}

fn missing(flag: &str) -> Error {
	Error::InvalidArgument(format!("option {} requires an argument", flag))
}

fn parse_number(flag: &str, value: &str) -> Result<u64> {
	value
		.parse()
		.map_err(|_| Error::InvalidArgument(format!("option {} takes a number", flag)))
}

/// Parses the argument list.
///
/// `-R` switches to reading the remaining arguments from stdin, one per
/// line. `-p` may appear without its argument; the caller then prompts.
pub fn parse<I: Iterator<Item = String>>(args: I) -> Result<Opts> {
	let mut queue: Vec<String> = args.collect();
	queue.reverse();
	let mut opts = Opts::default();

	while let Some(arg) = queue.pop() {
		match arg.as_str() {
			"-c" => opts.config = Some(queue.pop().ok_or_else(|| missing("-c"))?.into()),
			"-m" => opts.ms_url = Some(queue.pop().ok_or_else(|| missing("-m"))?),
			"-u" => opts.username = Some(queue.pop().ok_or_else(|| missing("-u"))?),
			"-p" => {
				// the argument may be withheld to avoid a password in
				// the process list
				match queue.last() {
					Some(next) if !next.starts_with('-') => {
						opts.password = queue.pop();
					}
					_ => opts.password_prompt = true,
				}
			}
			"-U" => opts.user_key_path = Some(queue.pop().ok_or_else(|| missing("-U"))?.into()),
			"-P" => opts.user_key_pem = Some(queue.pop().ok_or_else(|| missing("-P"))?),
			"-v" => opts.volume = Some(queue.pop().ok_or_else(|| missing("-v"))?),
			"-g" => opts.gateway = Some(queue.pop().ok_or_else(|| missing("-g"))?),
			"-V" => {
				opts.volume_pubkey_path = Some(queue.pop().ok_or_else(|| missing("-V"))?.into())
			}
			"-G" => opts.gateway_key_path = Some(queue.pop().ok_or_else(|| missing("-G"))?.into()),
			"-K" => opts.gateway_key_password = Some(queue.pop().ok_or_else(|| missing("-K"))?),
			"-S" => {
				opts.syndicate_pubkey_path = Some(queue.pop().ok_or_else(|| missing("-S"))?.into())
			}
			"-T" => opts.tls_key = Some(queue.pop().ok_or_else(|| missing("-T"))?.into()),
			"-C" => opts.tls_cert = Some(queue.pop().ok_or_else(|| missing("-C"))?.into()),
			"-r" => opts.storage_root = Some(queue.pop().ok_or_else(|| missing("-r"))?.into()),
			"-l" => {
				let v = queue.pop().ok_or_else(|| missing("-l"))?;
				opts.cache_soft_limit = Some(parse_number("-l", &v)?);
			}
			"-L" => {
				let v = queue.pop().ok_or_else(|| missing("-L"))?;
				opts.cache_hard_limit = Some(parse_number("-L", &v)?);
			}
			"-d" => {
				let v = queue.pop().ok_or_else(|| missing("-d"))?;
				opts.debug_level = parse_number("-d", &v)? as u32;
			}
			"-a" => opts.anonymous = true,
			"-R" => {
				// remaining arguments come from stdin, one per line
				let stdin = std::io::stdin();
				let mut extra: Vec<String> = Vec::new();
				for line in stdin.lock().lines() {
					let line = line?;
					if line.is_empty() {
						continue;
					}
					extra.push(line);
				}
				extra.reverse();
				queue.extend(extra);
			}
			other => {
				return Err(Error::InvalidArgument(format!(
					"unrecognized option {}",
					other
				)))
			}
		}
	}
	Ok(opts)
}

#[cfg(test)]
mod test {
	use super::*;

	fn argv(args: &[&str]) -> impl Iterator<Item = String> {
		args.iter()
			.map(|s| s.to_string())
			.collect::<Vec<_>>()
			.into_iter()
	}

	#[test]
	fn full_surface() {
		let opts = parse(argv(&[
			"-m",
			"https://ms.example.com",
			"-u",
			"alice",
			"-p",
			"secret",
			"-v",
			"vol",
			"-g",
			"ug-1",
			"-G",
			"/keys/gw.key",
			"-r",
			"/var/syndicate",
			"-l",
			"1048576",
			"-L",
			"2097152",
			"-d",
			"2",
			"-a",
		]))
		.unwrap();
		assert_eq!(opts.ms_url.as_deref(), Some("https://ms.example.com"));
		assert_eq!(opts.username.as_deref(), Some("alice"));
		assert_eq!(opts.password.as_deref(), Some("secret"));
		assert_eq!(opts.volume.as_deref(), Some("vol"));
		assert_eq!(opts.gateway.as_deref(), Some("ug-1"));
		assert_eq!(opts.cache_soft_limit, Some(1048576));
		assert_eq!(opts.cache_hard_limit, Some(2097152));
		assert_eq!(opts.debug_level, 2);
		assert!(opts.anonymous);
		assert!(!opts.password_prompt);
	}

	#[test]
	fn withheld_password_prompts() {
		let opts = parse(argv(&["-p", "-v", "vol"])).unwrap();
		assert!(opts.password_prompt);
		assert!(opts.password.is_none());
		assert_eq!(opts.volume.as_deref(), Some("vol"));
	}

	#[test]
	fn missing_argument_is_rejected() {
		assert!(matches!(
			parse(argv(&["-m"])),
			Err(Error::InvalidArgument(_))
		));
		assert!(matches!(
			parse(argv(&["-x"])),
			Err(Error::InvalidArgument(_))
		));
		assert!(matches!(
			parse(argv(&["-l", "many"])),
			Err(Error::InvalidArgument(_))
		));
	}
}
