//! regio echo server
//!
//! Every accepted connection is served by a handler that receives into
//! the slot's registered receive buffer, copies into its send buffer and
//! sends the same bytes back, until the peer closes.
//!
//! Usage:
//!     cargo build --release -p regio-echo
//!     ./target/release/regio-echo [port] [connections]
//!
//! All `REGIO_*` variables of `EngineConfig::from_env` apply; the
//! arguments override `REGIO_LISTEN`'s port and `REGIO_CONNECTIONS`.
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q1 localhost 9999 & done

use regio_core::kprint;
use regio_engine::{Connection, EngineConfig, Server, StatsSnapshot};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn on_signal(_: nix::libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn install_signal_handlers() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

async fn echo(mut conn: Connection) {
    loop {
        let n = match conn.receive().await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        {
            let (rx, tx) = conn.buffers();
            let n = n.min(tx.len());
            tx[..n].copy_from_slice(&rx[..n]);
        }
        let n = n.min(conn.send_capacity());
        let sent = match conn.send(n) {
            Ok(fut) => fut.await,
            Err(_) => break,
        };
        if sent.is_err() {
            break;
        }
    }
}

fn print_stats(s: &StatsSnapshot, elapsed: Duration) {
    eprintln!("[{:.1}s] {}", elapsed.as_secs_f64(), s);
}

fn main() {
    kprint::init();

    let args: Vec<String> = std::env::args().collect();
    let mut config = EngineConfig::from_env();
    if let Some(port) = args.get(1).and_then(|s| s.parse::<u16>().ok()) {
        config.listen_addr.set_port(port);
    }
    if let Some(n) = args.get(2).and_then(|s| s.parse::<usize>().ok()) {
        config.connection_backlog = n;
    }

    if let Err(e) = install_signal_handlers() {
        eprintln!("regio-echo: cannot install signal handlers: {}", e);
    }

    eprintln!(
        "regio-echo: starting on {} ({} connections, {} workers)",
        config.listen_addr,
        config.connection_backlog,
        config.effective_workers()
    );

    let server = match Server::start(config, echo) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("regio-echo: failed to start: {}", e);
            std::process::exit(1);
        }
    };
    eprintln!("regio-echo: listening on {}", server.local_addr());

    let start = Instant::now();
    let mut last_print = Instant::now();
    while RUNNING.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        if last_print.elapsed() >= Duration::from_secs(5) {
            print_stats(&server.stats(), start.elapsed());
            last_print = Instant::now();
        }
    }

    eprintln!("\nregio-echo: shutting down...");
    let elapsed = start.elapsed();
    let stats = server.stats();
    server.shutdown();
    print_stats(&stats, elapsed);
    eprintln!("regio-echo: done.");
}
