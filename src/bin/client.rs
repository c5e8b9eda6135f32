//! `meridian-client` — watches a directory tree and mirrors it to a backup
//! server (`start`), or pulls a previously backed-up tree back down
//! (`retrieve`). Grounded in `client::ProtocolManager`/`FileSystemWatcher`
//! and the `retrieveFiles(mac, all, destFolder)` call site (§4.6-§4.9, §6.5).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use tracing::{error, info, warn};

use meridian_backup::catalog::LocalCatalog;
use meridian_backup::client::ClientSession;
use meridian_backup::config::{self, ClientConfig};
use meridian_backup::entry::Entry;
use meridian_backup::error::SessionError;
use meridian_backup::log;
use meridian_backup::protocol::{ClientMessage, ErrCode, OkCode, ServerMessage, PROTOCOL_VERSION};
use meridian_backup::queue::BoundedQueue;
use meridian_backup::retry::ReconnectPolicy;
use meridian_backup::transport::FramedTransport;
use meridian_backup::watcher::{ChangeKind, Watcher};

fn cli() -> ArgMatches {
    Command::new("meridian-client")
        .about("Continuous backup client daemon")
        .version("0.1.0")
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to client.toml")
                .default_value("client.toml"),
        )
        .subcommand(
            Command::new("start")
                .about("Watch the configured directory and mirror changes to the server")
                .arg(Arg::new("server").long("server").required(true))
                .arg(Arg::new("user").long("user").required(true))
                .arg(Arg::new("password").long("password").required(true)),
        )
        .subcommand(
            Command::new("retrieve")
                .about("Download a previously backed-up tree")
                .arg(Arg::new("server").long("server").required(true))
                .arg(Arg::new("user").long("user").required(true))
                .arg(Arg::new("password").long("password").required(true))
                .arg(Arg::new("dir").long("dir").required(true))
                .arg(Arg::new("device").long("device").required(false))
                .arg(Arg::new("all").long("all").action(ArgAction::SetTrue)),
        )
        .get_matches()
}

fn main() {
    let app = cli();
    let config_path = PathBuf::from(app.get_one::<String>("config").unwrap());

    let cfg: ClientConfig = match config::load_or_init(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    log::init("info");

    match app.subcommand() {
        Some(("start", m)) => run_start(&cfg, m),
        Some(("retrieve", m)) => run_retrieve(&cfg, m),
        _ => {
            eprintln!("no subcommand given; try `meridian-client start` or --help");
            std::process::exit(1);
        }
    }
}

fn run_start(cfg: &ClientConfig, m: &ArgMatches) {
    let server = m.get_one::<String>("server").unwrap();
    let user = m.get_one::<String>("user").unwrap();
    let password = m.get_one::<String>("password").unwrap();

    let root = config::normalize_watch_path(&cfg.path_to_watch);
    let catalog = Arc::new(LocalCatalog::open(Path::new(&cfg.database_path)).expect("open local catalog"));
    let ca_file = PathBuf::from(&cfg.ca_file_path);

    let events: Arc<BoundedQueue<(Entry, ChangeKind)>> = Arc::new(BoundedQueue::new(cfg.event_queue_size));
    let stop = Arc::new(AtomicBool::new(false));

    let watcher_events = events.clone();
    let watcher_stop = stop.clone();
    let watcher_root = root.clone();
    let watcher_catalog = catalog.clone();
    let watcher_delay = Duration::from_millis(cfg.millis_filesystem_watcher);
    let watcher_handle = thread::spawn(move || {
        let mut watcher = Watcher::new(watcher_root, watcher_delay);
        watcher
            .recover_from_catalog(&watcher_catalog, |entry, kind| {
                watcher_events.push((entry.clone(), kind));
            })
            .expect("seed watcher from catalog");
        watcher.run(&watcher_stop, |entry, kind| watcher_events.try_push((entry.clone(), kind)));
    });

    let select_timeout = Duration::from_secs(cfg.select_timeout_seconds);
    let idle_timeout = Duration::from_secs(cfg.timeout_seconds);

    let mut session: Option<ClientSession> = None;
    let mut reconnect = ReconnectPolicy::new(
        Duration::from_secs(cfg.seconds_between_reconnections),
        cfg.max_connection_retries,
    );
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }

        info!("connecting to {server} as {user}, device identity derived from the local interface");
        let outcome: Result<(), SessionError> = if session.is_none() {
            ClientSession::connect_and_auth(
                server,
                server_name_from(server),
                &ca_file,
                root.clone(),
                catalog.clone(),
                user,
                password,
                cfg.max_response_waiting,
                cfg.max_data_chunk_size,
                cfg.max_server_error_retries,
                select_timeout,
            )
            .map(|s| session = Some(s))
        } else {
            session
                .as_mut()
                .expect("just checked is_some")
                .reconnect(server, server_name_from(server), &ca_file, user, password)
        };

        match outcome {
            Ok(()) => {
                reconnect.reset();
                info!("connected, mirroring changes");
                let active = session.as_mut().expect("session just (re)connected");
                match drive_session(active, &events, &stop, idle_timeout) {
                    Ok(()) => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        info!("idle with nothing in flight, disconnected until the next change");
                        if !events.wait_ready(&stop) {
                            break;
                        }
                    }
                    Err(e) => warn!("session ended: {e}, will reconnect"),
                }
            }
            Err(SessionError::FatalAuth) => {
                error!("authentication rejected by server, giving up");
                stop.store(true, Ordering::SeqCst);
                break;
            }
            Err(SessionError::FatalConfig(msg)) => {
                error!("fatal configuration error: {msg}, giving up");
                stop.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => warn!("connection attempt failed: {e}"),
        }

        if !reconnect.record_failure_and_retry() {
            error!("exceeded {} connection retries, giving up", cfg.max_connection_retries);
            stop.store(true, Ordering::SeqCst);
            break;
        }
    }

    watcher_handle.join().ok();
}

/// Drives one connected session: pipelines up to the window's capacity of
/// outstanding requests instead of the strict submit-then-block-on-response
/// lockstep, multiplexing the transport and the watcher's event queue on a
/// single readiness wait bounded by `T_select` (§4.7). Returns `Ok(())` on
/// cooperative shutdown or on an idle-disconnect (empty in-flight window,
/// no outbound traffic for `idle_timeout`) — the caller tells these apart
/// with the `stop` flag.
fn drive_session(
    session: &mut ClientSession,
    events: &BoundedQueue<(Entry, ChangeKind)>,
    stop: &AtomicBool,
    idle_timeout: Duration,
) -> Result<(), SessionError> {
    let mut last_submit = std::time::Instant::now();

    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut submitted = false;
        while session.can_send() {
            match events.try_pop() {
                Some((entry, kind)) => {
                    session.submit(&entry, kind)?;
                    submitted = true;
                    last_submit = std::time::Instant::now();
                }
                None => break,
            }
        }

        let mut drained = false;
        while !session.window_is_empty() {
            if session.try_drain()? {
                drained = true;
            } else {
                break;
            }
        }

        if !submitted && !drained && session.window_is_empty() {
            if last_submit.elapsed() >= idle_timeout {
                info!("idle for {idle_timeout:?} with an empty in-flight window, disconnecting");
                session.close();
                return Ok(());
            }
            if !events.wait_ready(stop) {
                return Ok(());
            }
        }
    }
}

fn server_name_from(addr: &str) -> &str {
    addr.split(':').next().unwrap_or(addr)
}

fn run_retrieve(cfg: &ClientConfig, m: &ArgMatches) {
    let server = m.get_one::<String>("server").unwrap();
    let user = m.get_one::<String>("user").unwrap();
    let password = m.get_one::<String>("password").unwrap();
    let dest = PathBuf::from(m.get_one::<String>("dir").unwrap());
    let all = m.get_flag("all");
    let target_device = m.get_one::<String>("device").cloned().unwrap_or_default();

    let ca_file = PathBuf::from(&cfg.ca_file_path);
    let mut transport =
        FramedTransport::connect(server, server_name_from(server), &ca_file).expect("connect to server");

    // AUTH always identifies this machine, never the `--device` override
    // (§4.1 `peer_mac`); `--device` only selects which backed-up device's
    // files `RETR` pulls, matching the original's `client_socket.getMAC()`
    // for authentication vs. `inputArgs.getMac()` for retrieval.
    let this_device = transport.peer_mac().expect("determine device identity");

    // Retrieving with neither `--device` nor `--all` falls back to this
    // machine's own backup, mirroring the original's `thisSocketMac` default.
    let device = if all {
        String::new()
    } else if target_device.is_empty() {
        this_device.clone()
    } else {
        target_device
    };

    send(&mut transport, &ClientMessage::Auth {
        version: PROTOCOL_VERSION,
        username: user.clone(),
        device: this_device,
        password: password.clone(),
    });
    match recv(&mut transport) {
        ServerMessage::Ok { code: OkCode::Authenticated, .. } => {}
        ServerMessage::Err { code: ErrCode::Auth, .. } => {
            eprintln!("authentication rejected");
            std::process::exit(1);
        }
        other => {
            eprintln!("unexpected response to authentication: {other:?}");
            std::process::exit(1);
        }
    }

    send(&mut transport, &ClientMessage::Retr { version: PROTOCOL_VERSION, device, all });

    std::fs::create_dir_all(&dest).expect("create destination directory");
    loop {
        match recv(&mut transport) {
            ServerMessage::Ok { code: OkCode::RetrievalDone, .. } => break,
            ServerMessage::Mkd { path, mtime, .. } => {
                let abs = dest.join(&path);
                std::fs::create_dir_all(&abs).expect("create retrieved directory");
                Entry::apply_mtime(&abs, &mtime).ok();
            }
            ServerMessage::Stor { path, filesize, mtime, hash, .. } => {
                let abs = dest.join(&path);
                if let Some(parent) = abs.parent() {
                    std::fs::create_dir_all(parent).expect("create parent directory");
                }
                let tmp_path = dest.join(format!("{}.tmp", random_hex(8)));
                {
                    let mut file = std::fs::File::create(&tmp_path).expect("create staging file");
                    loop {
                        match recv(&mut transport) {
                            ServerMessage::Data { data, last, .. } => {
                                use std::io::Write;
                                file.write_all(&data).expect("write staging file");
                                if last {
                                    break;
                                }
                            }
                            other => {
                                eprintln!("unexpected response while retrieving {path:?}: {other:?}");
                                std::process::exit(1);
                            }
                        }
                    }
                }

                Entry::apply_mtime(&tmp_path, &mtime).ok();
                let written = Entry::scan(&dest, &tmp_path).expect("scan staged file");
                if written.size != filesize || written.content_hash != hash || written.mtime != mtime {
                    std::fs::remove_file(&tmp_path).ok();
                    eprintln!("retrieved file {path:?} does not match the announced size/hash/mtime, retrieval failed");
                    std::process::exit(1);
                }
                std::fs::rename(&tmp_path, &abs).expect("commit retrieved file");
            }
            other => {
                eprintln!("unexpected response during retrieval: {other:?}");
                std::process::exit(1);
            }
        }
    }

    println!("retrieval complete, files written to {}", dest.display());
}

fn random_hex(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..len).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
}

fn send(transport: &mut FramedTransport, msg: &ClientMessage) {
    let bytes = bincode::serialize(msg).expect("client message always serializes");
    transport.send_frame(&bytes).expect("send frame");
}

fn recv(transport: &mut FramedTransport) -> ServerMessage {
    let bytes = transport.recv_frame().expect("recv frame");
    bincode::deserialize(&bytes).expect("decode server message")
}
