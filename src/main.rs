//! Main of all gateway binaries.
//!
//! One executable serves the three roles, dispatched on the name it was
//! invoked under: `syndicate-ug`, `syndicate-rg` or `syndicate-ag`. The
//! HTTP front end and the concrete MS transport link in from outside the
//! core; this binary wires the shared runtime underneath them.

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use std::env;
use std::fs;
use std::process::exit;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use syndicate::ag;
use syndicate::driver::Driver;
use syndicate::error::Result;
use syndicate::gateway::GatewayConfig;
use syndicate::gateway::GatewayContext;
use syndicate::gateway::GatewayKind;
use syndicate::gateway::Volume;
use syndicate::ms;
use syndicate::opts;
use syndicate::opts::Opts;
use syndicate::prompt::read_secret;
use syndicate::rg::RgState;
use syndicate::rpc::Transport;
use syndicate::ug::UgState;
use syndicate::util::TraceConfig;

/// Flipped by the signal handler; polled by the main loop.
static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_sig: i32) {
	RUNNING.store(false, Ordering::SeqCst);
}

fn fail(prog: &str, msg: &str) -> ! {
	eprintln!("{}: {}", prog, msg);
	exit(1);
}

/// Transport placeholder the HTTP client layer replaces at link time.
struct DisconnectedTransport;

impl Transport for DisconnectedTransport {
	fn exchange(&self, _dest: u64, _body: &[u8]) -> Result<Vec<u8>> {
		Err(syndicate::error::Error::NoData)
	}
}

/// Loads an ed25519 private key: 32 raw bytes or 64 hex characters.
fn load_signing_key(opts: &Opts) -> Result<SigningKey> {
	let Some(path) = &opts.gateway_key_path else {
		// anonymous gateways run on an ephemeral identity
		return Ok(SigningKey::generate(&mut OsRng));
	};
	let bytes = fs::read(path)?;
	let raw: [u8; 32] = if bytes.len() == 32 {
		bytes.as_slice().try_into().expect("length checked")
	} else {
		let text = String::from_utf8_lossy(&bytes);
		let text = text.trim().to_owned();
		if text.len() != 64 {
			return Err(syndicate::error::Error::InvalidArgument(format!(
				"{}: not an ed25519 private key",
				path.display()
			)));
		}
		let mut raw = [0u8; 32];
		for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
			let hex = std::str::from_utf8(chunk).unwrap_or("");
			raw[i] = u8::from_str_radix(hex, 16).map_err(|_| {
				syndicate::error::Error::InvalidArgument(format!(
					"{}: not an ed25519 private key",
					path.display()
				))
			})?;
		}
		raw
	};
	Ok(SigningKey::from_bytes(&raw))
}

fn numeric(prog: &str, what: &str, value: Option<&str>) -> u64 {
	let Some(value) = value else {
		fail(prog, &format!("missing {}", what));
	};
	value
		.parse()
		.unwrap_or_else(|_| fail(prog, &format!("{} must be numeric: {}", what, value)))
}

fn init_context(prog: &str, opts: &Opts, kind: GatewayKind) -> Arc<GatewayContext> {
	let volume_id = numeric(prog, "volume (-v)", opts.volume.as_deref());
	let gateway_id = numeric(prog, "gateway (-g)", opts.gateway.as_deref());

	let mut config = GatewayConfig {
		ms_url: opts.ms_url.clone().unwrap_or_else(|| "null:".to_owned()),
		debug_level: opts.debug_level,
		anonymous: opts.anonymous,
		..Default::default()
	};
	if let Some(root) = &opts.storage_root {
		config.storage_root = root.join("storage");
		config.metadata_root = root.join("metadata");
	}
	if let Some(soft) = opts.cache_soft_limit {
		config.cache_soft_limit = soft;
	}
	if let Some(hard) = opts.cache_hard_limit {
		config.cache_hard_limit = hard;
	}

	let signing_key =
		load_signing_key(opts).unwrap_or_else(|e| fail(prog, &format!("gateway key: {}", e)));
	let volume = Volume {
		id: volume_id,
		owner_id: 0,
		block_size: 65536,
		ms_public_key: None,
	};
	Arc::new(GatewayContext::new(
		gateway_id,
		kind,
		0,
		volume,
		config,
		signing_key,
	))
}

fn run_until_signalled(ctx: &GatewayContext) {
	let handler = handle_signal as extern "C" fn(i32);
	unsafe {
		libc::signal(libc::SIGINT, handler as libc::sighandler_t);
		libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
	}
	while RUNNING.load(Ordering::SeqCst) {
		thread::sleep(Duration::from_millis(200));
	}
	ctx.cancel.cancel();
}

fn gateway_main(prog: &str, kind: GatewayKind, args: impl Iterator<Item = String>) {
	let mut opts = opts::parse(args).unwrap_or_else(|e| fail(prog, &e.to_string()));
	if opts.password_prompt {
		let secret = read_secret("Password: ")
			.unwrap_or_else(|e| fail(prog, &format!("password entry: {}", e)));
		opts.password = Some(secret);
	}

	let trace = TraceConfig::from_env();
	env_logger::Builder::from_default_env()
		.filter_level(match opts.debug_level {
			0 => log::LevelFilter::Warn,
			1 => log::LevelFilter::Info,
			_ => log::LevelFilter::Debug,
		})
		.init();
	if trace.enabled {
		log::info!(
			"request tracing to {}:{}",
			trace.server_hostname.as_deref().unwrap_or("localhost"),
			trace.server_port.unwrap_or(0)
		);
	}

	let ctx = init_context(prog, &opts, kind);
	let ms = ms::connect(&ctx.config.ms_url)
		.unwrap_or_else(|e| fail(prog, &format!("metadata service: {}", e)));
	let ms: Arc<dyn ms::MsClient> = Arc::from(ms);
	match ms.cert_bundle(ctx.volume.id) {
		Ok(certs) => ctx.install_certs(certs),
		Err(e) => fail(prog, &format!("cert bundle: {}", e)),
	}

	let transport: Arc<dyn Transport> = Arc::new(DisconnectedTransport);
	let driver = Arc::new(Driver::disabled());

	match kind {
		GatewayKind::UG => {
			let state = UgState::new(Arc::clone(&ctx), ms, transport, driver)
				.unwrap_or_else(|e| fail(prog, &format!("init: {}", e)));
			run_until_signalled(&ctx);
			state.shutdown();
		}
		GatewayKind::RG => {
			let _state = RgState::new(Arc::clone(&ctx), driver)
				.unwrap_or_else(|e| fail(prog, &format!("init: {}", e)));
			run_until_signalled(&ctx);
		}
		GatewayKind::AG => {
			let state = ag::AgState::new(Arc::clone(&ctx), ms, driver);
			let crawler_state = Arc::clone(&state);
			let cancel = ctx.cancel.clone();
			let crawler = thread::Builder::new()
				.name("crawler".to_owned())
				.spawn(move || ag::crawl::run(crawler_state, cancel))
				.unwrap_or_else(|e| fail(prog, &format!("crawler: {}", e)));
			run_until_signalled(&ctx);
			let _ = crawler.join();
		}
	}
}

fn main() {
	let mut args = env::args();
	let bin = args
		.next()
		.map(|p| p.rsplit('/').next().unwrap_or("syndicate").to_owned())
		.unwrap_or_else(|| "syndicate".to_owned());
	match bin.as_str() {
		"syndicate-ug" => gateway_main(&bin, GatewayKind::UG, args),
		"syndicate-rg" => gateway_main(&bin, GatewayKind::RG, args),
		"syndicate-ag" => gateway_main(&bin, GatewayKind::AG, args),
		// the bare name defaults to a user gateway
		"syndicate" => gateway_main("syndicate", GatewayKind::UG, args),
		_ => {
			eprintln!("syndicate: invalid binary name {}", bin);
			exit(1);
		}
	}
}
