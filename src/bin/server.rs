//! `meridian-server` — the backup daemon's admin CLI and listener (§4.10,
//! §6.5). Admin subcommands touch the credential store and catalog directly;
//! `start` runs the accept loop and worker pool.

use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::{Arg, ArgMatches, Command};
use tracing::{error, info, warn};

use meridian_backup::catalog::ServerCatalog;
use meridian_backup::config::{self, ServerConfig, DEFAULT_PORT};
use meridian_backup::credentials::CredentialStore;
use meridian_backup::log;
use meridian_backup::queue::BoundedQueue;
use meridian_backup::server::ServerSession;

fn cli() -> ArgMatches {
    Command::new("meridian-server")
        .about("Continuous backup server daemon")
        .version("0.1.0")
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to server.toml")
                .default_value("server.toml"),
        )
        .subcommand(Command::new("start").about("Start accepting connections"))
        .subcommand(
            Command::new("add-user")
                .about("Create a new user")
                .arg(Arg::new("username").required(true))
                .arg(Arg::new("password").required(true)),
        )
        .subcommand(
            Command::new("update-user")
                .about("Change a user's password")
                .arg(Arg::new("username").required(true))
                .arg(Arg::new("password").required(true)),
        )
        .subcommand(
            Command::new("remove-user")
                .about("Delete a user and every device's backup")
                .arg(Arg::new("username").required(true)),
        )
        .subcommand(Command::new("view-users").about("List every registered username"))
        .subcommand(
            Command::new("delete-user")
                .about("Delete a user's backup, or one device's, without removing the login")
                .arg(Arg::new("username").required(true))
                .arg(Arg::new("device").long("device").help("Limit to one device's mac")),
        )
        .get_matches()
}

fn main() {
    let app = cli();
    let config_path = PathBuf::from(app.get_one::<String>("config").unwrap());

    let cfg: ServerConfig = match config::load_or_init(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    log::init("info");

    let credentials = match CredentialStore::open(Path::new(&cfg.password_database_path)) {
        Ok(c) => c,
        Err(e) => {
            error!("cannot open credential store: {e}");
            std::process::exit(1);
        }
    };
    let catalog = match ServerCatalog::open(Path::new(&cfg.server_database_path)) {
        Ok(c) => c,
        Err(e) => {
            error!("cannot open server catalog: {e}");
            std::process::exit(1);
        }
    };

    match app.subcommand() {
        Some(("add-user", m)) => {
            let user = m.get_one::<String>("username").unwrap();
            let password = m.get_one::<String>("password").unwrap();
            credentials.add(user, password).expect("add user");
            println!("user {user:?} created");
        }
        Some(("update-user", m)) => {
            let user = m.get_one::<String>("username").unwrap();
            let password = m.get_one::<String>("password").unwrap();
            credentials.update(user, password).expect("update user");
            println!("password updated for {user:?}");
        }
        Some(("remove-user", m)) => {
            let user = m.get_one::<String>("username").unwrap();
            credentials.remove(user).expect("remove user");
            catalog.remove_all_devices(user).expect("remove backups");
            println!("user {user:?} and all of their backups removed");
        }
        Some(("view-users", _)) => {
            credentials.enumerate(|u| println!("{u}")).expect("enumerate users");
        }
        Some(("delete-user", m)) => {
            let user = m.get_one::<String>("username").unwrap();
            match m.get_one::<String>("device") {
                Some(device) => {
                    catalog.remove_all(user, device).expect("remove device backup");
                    println!("backup for {user:?} device {device:?} removed");
                }
                None => {
                    catalog.remove_all_devices(user).expect("remove backups");
                    println!("every backup for {user:?} removed");
                }
            }
        }
        Some(("start", _)) => run_server(cfg, credentials, catalog),
        _ => {
            eprintln!("no subcommand given; try `meridian-server start` or --help");
            std::process::exit(1);
        }
    }
}

fn run_server(cfg: ServerConfig, credentials: CredentialStore, catalog: ServerCatalog) {
    let credentials = Arc::new(credentials);
    let catalog = Arc::new(catalog);
    let base_path = PathBuf::from(&cfg.server_base_path);
    let temp_path = PathBuf::from(&cfg.temp_path);
    let cert_path = PathBuf::from(&cfg.certificate_path);
    let key_path = PathBuf::from(&cfg.private_key_path);

    std::fs::create_dir_all(&base_path).expect("create server_base_path");
    std::fs::create_dir_all(&temp_path).expect("create temp_path");

    let listener = TcpListener::bind(("0.0.0.0", DEFAULT_PORT)).expect("bind listen socket");
    let local_port = listener.local_addr().map(|a| a.port()).unwrap_or(DEFAULT_PORT);
    info!("listening on port {DEFAULT_PORT} with {} worker threads", cfg.n_threads);

    let queue: Arc<BoundedQueue<TcpStream>> = Arc::new(BoundedQueue::new(cfg.socket_queue_size));
    let stop = Arc::new(AtomicBool::new(false));

    // No signal-handling crate is in the dependency set (§ design notes),
    // so shutdown is triggered cooperatively: a line on stdin (or stdin
    // closing) sets `stop` and wakes the accept thread with a loopback
    // connect, per §5's "accept thread is woken by a local loopback
    // connect during shutdown".
    let stdin_stop = stop.clone();
    thread::spawn(move || {
        let mut line = String::new();
        loop {
            line.clear();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) => break,
                Ok(_) if line.trim().eq_ignore_ascii_case("quit") => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        info!("shutdown requested, draining connections");
        stdin_stop.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(("127.0.0.1", local_port));
    });

    let mut workers = Vec::new();
    for id in 0..cfg.n_threads {
        let queue = queue.clone();
        let credentials = credentials.clone();
        let catalog = catalog.clone();
        let base_path = base_path.clone();
        let temp_path = temp_path.clone();
        let cert_path = cert_path.clone();
        let key_path = key_path.clone();
        let tmp_name_len = cfg.tmp_file_name_size;
        let stop = stop.clone();

        workers.push(thread::spawn(move || loop {
            let Some(tcp) = queue.pop_cancellable(&stop) else { break };
            let peer = tcp.peer_addr().ok();
            match meridian_backup::transport::FramedTransport::accept(tcp, &cert_path, &key_path) {
                Ok(transport) => {
                    let session = ServerSession::authenticate(
                        transport,
                        &credentials,
                        catalog.clone(),
                        &base_path,
                        temp_path.clone(),
                        tmp_name_len,
                    );
                    match session {
                        Ok(mut session) => {
                            if let Err(e) = session.serve(&stop) {
                                warn!("worker {id} session for {peer:?} ended: {e}");
                            }
                        }
                        Err(e) => warn!("worker {id} authentication for {peer:?} failed: {e}"),
                    }
                }
                Err(e) => warn!("worker {id} tls handshake for {peer:?} failed: {e}"),
            }
        }));
    }

    for incoming in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match incoming {
            Ok(tcp) => queue.push(tcp),
            Err(e) => warn!("accept failed: {e}"),
        }
    }

    for worker in workers {
        let _ = worker.join();
    }
}
