//! Command line entry point for adbg

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Arg, Command};
use debugger_core::{process, Process, Session};

pub mod client;
pub mod disassemble;
pub mod display;

use client::Client;

fn main() {
    env_logger::init();

    let matches = Command::new("adbg")
        .version("v0.1")
        .about("A non-invasive breakpoint debugger for ARM64 Android processes")
        .arg(
            Arg::new("package")
                .value_name("package")
                .help("Package or process name of the running target")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::new("library")
                .short('l')
                .long("lib")
                .value_name("library")
                .help("Library that bare offsets refer to")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::new("break")
                .short('b')
                .long("break")
                .value_name("address")
                .help("Breakpoint to set before the first resume, repeatable")
                .takes_value(true)
                .multiple_occurrences(true),
        )
        .arg(
            Arg::new("hw")
                .long("hw")
                .help("Back stepping breakpoints with the debug registers where safe")
                .takes_value(false),
        )
        .get_matches();

    let package = matches.value_of("package").unwrap();
    let library = matches.value_of("library").unwrap();
    let breakpoints: Vec<&str> = matches.values_of("break").unwrap_or_default().collect();

    if let Err(e) = run(package, library, &breakpoints, matches.is_present("hw")) {
        eprintln!("adbg: {:#}", e);
        std::process::exit(1);
    }
}

fn run(package: &str, library: &str, breakpoints: &[&str], enable_hw: bool) -> anyhow::Result<()> {
    // Both of these are fatal before any probe is placed
    process::exec_dir().context("startup")?;
    let process = Arc::new(Process::attach(package).context("startup")?);
    println!(
        "Attached to {} (pid {})",
        process.package,
        process.work_pid()
    );

    let default_library = process.libraries.lock().unwrap().intern(library);
    let session = Session::new(Arc::clone(&process), enable_hw);

    install_sigint_handler(Arc::clone(&session));

    let mut client = Client::new(Arc::clone(&session), default_library);
    spawn_display_worker(&client);

    for token in breakpoints {
        client.execute(&format!("break {}", token));
    }

    client.repl();
    Ok(())
}

/// Print the configured panes whenever the coordinator publishes a stop
fn spawn_display_worker(client: &Client) {
    let session = Arc::clone(&client.session);
    let config = Arc::clone(&client.config);
    std::thread::Builder::new()
        .name("display".to_string())
        .spawn(move || {
            let incoming = session.incoming().clone();
            for stop in incoming.iter() {
                display::print_stop(&session.process, &config, &stop);
            }
        })
        .expect("failed to spawn display worker");
}

static SIGINT_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

/// Only async-signal-safe work happens here, the actual teardown runs on the
/// cleanup worker
extern "C" fn on_sigint(_: libc::c_int) {
    let fd = SIGINT_PIPE_WR.load(Ordering::SeqCst);
    if fd >= 0 {
        unsafe { libc::write(fd, b"x".as_ptr() as *const libc::c_void, 1) };
    }
}

/// Ctrl-c tears the installation down, releases the target and exits,
/// whatever the session was doing
fn install_sigint_handler(session: Arc<Session>) {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        log::warn!("pipe failed, ctrl-c will not detach cleanly");
        return;
    }
    SIGINT_PIPE_WR.store(fds[1], Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t) };

    let read_fd = fds[0];
    std::thread::Builder::new()
        .name("sigint".to_string())
        .spawn(move || {
            let mut buf = [0u8; 1];
            loop {
                let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
                if n <= 0 {
                    break;
                }
                println!();
                session.request_cleanup();
            }
        })
        .expect("failed to spawn sigint worker");
}
