//! Thin binary: argument parsing, logging/config init, and a minimal
//! interactive console exercising `meshwave_core::{Hub, Peer}`.
//!
//! Mode wiring (`--server NAME` / `--client ADDR` / neither) mirrors
//! `examples/original_source/src/main.cpp`'s startup switch; the HTTP
//! dashboard and browser launch it also does are out of scope here.

use std::io::{self, BufRead, Write as _};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use meshwave_core::discovery::{Scanner, DISC_PORT};
use meshwave_core::hub::DATA_PORT;
use meshwave_core::{ChatEvent, Hub, Peer, TracingLogger};

#[derive(Parser, Debug)]
#[command(name = "meshwave", about = "LAN peer-to-peer chat and file transfer")]
struct Args {
    /// Start directly as a hub, announcing under NAME.
    #[arg(long, value_name = "NAME")]
    server: Option<String>,

    /// Start directly as a peer, connecting to hub ADDR (ip or ip:port).
    #[arg(long, value_name = "ADDR")]
    client: Option<String>,

    /// Username presented to the hub in client mode.
    #[arg(long, default_value = "User")]
    name: String,
}

fn env_port(var: &str, default: u16) -> u16 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_save_dir() -> PathBuf {
    std::env::var("MESHWAVE_SAVE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./received"))
}

fn resolve_client_addr(input: &str, data_port: u16) -> Result<SocketAddr> {
    if input.contains(':') {
        return input.parse().context("invalid --client address");
    }
    format!("{input}:{data_port}").parse().context("invalid --client address")
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshwave=debug,meshwave_core=info".into()),
        )
        .init();

    let args = Args::parse();
    let data_port = env_port("MESHWAVE_DATA_PORT", DATA_PORT);
    let disc_port = env_port("MESHWAVE_DISC_PORT", DISC_PORT);
    if data_port != DATA_PORT || disc_port != DISC_PORT {
        info!(data_port, disc_port, "config: port overrides in effect");
    }
    let save_dir = env_save_dir();
    std::fs::create_dir_all(&save_dir)
        .with_context(|| format!("cannot create save directory {}", save_dir.display()))?;

    let hub = Arc::new(Hub::new());
    let peer = Peer::with_logger(save_dir.clone(), Arc::new(TracingLogger));
    let mut scanner: Option<Scanner> = None;

    if let Some(server_name) = &args.server {
        hub.start(server_name, data_port, disc_port).context("failed to start hub")?;
        println!("MeshWave hub '{server_name}' listening on port {data_port}.");
    } else if let Some(client_target) = &args.client {
        scanner = Some(Scanner::start(disc_port).context("failed to start discovery scan")?);
        let addr = resolve_client_addr(client_target, data_port)?;
        peer.connect(addr, &args.name).context("failed to connect to hub")?;
        println!("Connected to {addr} as '{}'.", args.name);
    } else {
        scanner = Some(Scanner::start(disc_port).context("failed to start discovery scan")?);
        println!("Scanning for hubs on the LAN. Use `servers` to list them found so far.");
    }

    let console_running = Arc::new(AtomicBool::new(true));
    spawn_event_printer(peer.clone(), console_running.clone());

    println!("Commands: chat <to> <text> | send <path> <to> | pause <id> | resume <id> | peers | servers | quit");
    run_console(&hub, &peer, scanner.as_ref(), &console_running)?;

    console_running.store(false, Ordering::SeqCst);
    peer.disconnect();
    hub.stop();
    if let Some(s) = scanner {
        s.stop();
    }
    println!("Goodbye.");
    Ok(())
}

/// Background thread draining `Peer`'s event queue to stdout, since the
/// console loop itself is blocked reading stdin between commands.
fn spawn_event_printer(peer: Arc<Peer>, running: Arc<AtomicBool>) {
    thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            while let Some(event) = peer.poll_event() {
                print_event(&event);
            }
            thread::sleep(Duration::from_millis(200));
        }
    });
}

fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::Chat { from, text, .. } => println!("\n[{from}] {text}"),
        ChatEvent::FileProgress { xfer_id, done, total } => {
            println!("\n[xfer {xfer_id}] {done}/{total} chunks")
        }
        ChatEvent::FileComplete { xfer_id, filename } => {
            println!("\n[xfer {xfer_id}] complete: {filename}")
        }
        ChatEvent::FileError { xfer_id, message } => {
            println!("\n[xfer {xfer_id}] error: {message}")
        }
    }
    print!("> ");
    let _ = io::stdout().flush();
}

fn run_console(
    hub: &Arc<Hub>,
    peer: &Arc<Peer>,
    scanner: Option<&Scanner>,
    running: &Arc<AtomicBool>,
) -> Result<()> {
    let stdin = io::stdin();
    print!("> ");
    io::stdout().flush().ok();
    for line in stdin.lock().lines() {
        let line = line.context("stdin read error")?;
        let line = line.trim();
        if !line.is_empty() {
            if handle_command(line, hub, peer, scanner) {
                break;
            }
        }
        if !running.load(Ordering::SeqCst) {
            break;
        }
        print!("> ");
        io::stdout().flush().ok();
    }
    Ok(())
}

/// Dispatch one console line. Returns `true` on `quit`.
fn handle_command(line: &str, hub: &Arc<Hub>, peer: &Arc<Peer>, scanner: Option<&Scanner>) -> bool {
    let mut parts = line.splitn(2, ' ');
    let cmd = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    match cmd {
        "quit" | "exit" => return true,
        "peers" => {
            let peers = hub.get_peers(meshwave_core::hub::MAX_PEERS);
            if peers.is_empty() {
                println!("(no connected peers; this console is only a hub's table)");
            }
            for p in peers {
                println!("  {} ({}:{})", p.name, p.addr, p.port);
            }
        }
        "servers" => match scanner {
            Some(s) => {
                let found = s.seen.get_all();
                if found.is_empty() {
                    println!("(no hubs discovered yet)");
                }
                for srv in found {
                    println!("  {} at {}:{}", srv.name, srv.ip, srv.port);
                }
            }
            None => println!("discovery scan is not running in hub mode"),
        },
        "chat" => {
            let mut it = rest.splitn(2, ' ');
            let (Some(to), Some(text)) = (it.next(), it.next()) else {
                println!("usage: chat <to> <text>");
                return false;
            };
            if let Err(e) = peer.send_chat(to, text) {
                println!("chat failed: {e}");
            }
        }
        "send" => {
            let mut it = rest.splitn(2, ' ');
            let (Some(path), Some(to)) = (it.next(), it.next()) else {
                println!("usage: send <path> <to>");
                return false;
            };
            match peer.send_file(path, to) {
                Ok(xfer_id) => println!("transfer {xfer_id} started"),
                Err(e) => println!("send failed: {e}"),
            }
        }
        "pause" => match rest.parse::<u32>() {
            Ok(id) => {
                if let Err(e) = peer.pause_transfer(id) {
                    println!("pause failed: {e}");
                }
            }
            Err(_) => println!("usage: pause <id>"),
        },
        "resume" => match rest.parse::<u32>() {
            Ok(id) => {
                if let Err(e) = peer.resume_transfer(id) {
                    println!("resume failed: {e}");
                }
            }
            Err(_) => println!("usage: resume <id>"),
        },
        other => println!("unknown command: {other}"),
    }
    false
}
