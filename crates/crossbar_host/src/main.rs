use anyhow::{Context, Result};
use clap::CommandFactory as _;
use daemon_response::{DaemonResponse, DaemonResponseReceiver};
use opts::ActionWithServer;
use paths::CrossbarPaths;
use std::{os::unix::net, path::Path, time::Duration};

use crate::server::ForkResult;

mod actions;
mod app;
mod application_lifecycle;
mod cache;
mod client;
mod config;
mod daemon_response;
mod data_source;
mod error;
mod error_handling_ctx;
mod ipc_server;
mod opts;
mod paths;
mod render;
mod sandbox;
mod scheduler;
mod server;
mod util;

fn main() {
    let binary_name = std::env::args().next().unwrap_or_else(|| "crossbar-host".to_string());
    let opts: opts::Opt = opts::Opt::from_env();

    let log_level_filter = if opts.log_debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::init_timed();
    } else {
        pretty_env_logger::formatted_timed_builder()
            .filter(Some("crossbar_host"), log_level_filter)
            .filter(Some("crossbar_protocol"), log_level_filter)
            .init();
    }

    if let opts::Action::ShellCompletions { shell } = opts.action {
        clap_complete::generate(shell, &mut opts::RawOpt::command(), "crossbar-host", &mut std::io::stdout());
        return;
    }

    if let Err(err) = run(opts, binary_name) {
        error_handling_ctx::print_error(err);
        std::process::exit(1);
    }
}

fn run(opts: opts::Opt, binary_name: String) -> Result<()> {
    let paths = opts
        .config_path
        .map(CrossbarPaths::from_config_dir)
        .unwrap_or_else(CrossbarPaths::default)
        .context("Failed to initialize crossbar paths")?;

    let should_restart = match &opts.action {
        opts::Action::ShellCompletions { .. } => unreachable!(),
        opts::Action::Daemon => opts.restart,
        opts::Action::WithServer(action) => opts.restart && action.can_start_daemon(),
        opts::Action::ClientOnly(_) => false,
    };
    if should_restart {
        let response = handle_server_command(&paths, &ActionWithServer::KillServer, 1);
        if let Ok(Some(response)) = response {
            handle_daemon_response(response);
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    match opts.action {
        opts::Action::ShellCompletions { .. } => unreachable!(),
        opts::Action::ClientOnly(action) => {
            client::handle_client_only_action(&paths, action)?;
        }

        // make sure that there isn't already a daemon running.
        opts::Action::Daemon if check_server_running(paths.get_ipc_socket_file()) => {
            eprintln!("crossbar-host daemon already running.");
        }
        opts::Action::Daemon => {
            log::info!("Initializing crossbar-host daemon. ({})", paths.get_ipc_socket_file().display());
            let _ = std::fs::remove_file(paths.get_ipc_socket_file());

            if !opts.no_daemonize {
                println!("Run `{} logs` to see what your plugins are doing.", binary_name);
            }
            server::initialize_server(paths.clone(), None, !opts.no_daemonize)?;
        }

        opts::Action::WithServer(ActionWithServer::KillServer) => {
            if let Some(response) = handle_server_command(&paths, &ActionWithServer::KillServer, 1)? {
                handle_daemon_response(response);
            }
        }

        // a running daemon is necessary for this command
        opts::Action::WithServer(action) => {
            // attempt to just send the command to a running daemon
            match handle_server_command(&paths, &action, 5) {
                Ok(Some(response)) => handle_daemon_response(response),
                Ok(None) => {}

                Err(err) if action.can_start_daemon() && !opts.no_daemonize => {
                    // connecting to the daemon failed. Thus, start the daemon here!
                    log::warn!("Failed to connect to daemon: {}", err);
                    log::info!("Initializing crossbar-host daemon. ({})", paths.get_ipc_socket_file().display());
                    let _ = std::fs::remove_file(paths.get_ipc_socket_file());
                    println!("Run `{} logs` to see what your plugins are doing.", binary_name);

                    let (command, response_recv) = action.into_daemon_command();
                    // start the daemon and give it the command
                    let fork_result = server::initialize_server(paths.clone(), Some(command), true)?;
                    if let (Some(recv), ForkResult::Parent) = (response_recv, fork_result) {
                        listen_for_daemon_response(recv)?;
                    }
                }
                Err(err) => Err(err)?,
            }
        }
    }
    Ok(())
}

fn listen_for_daemon_response(mut recv: DaemonResponseReceiver) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .thread_name("listen-for-daemon-response")
        .enable_all()
        .build()
        .context("Failed to initialize tokio runtime")?;
    rt.block_on(async {
        if let Ok(Some(response)) = tokio::time::timeout(Duration::from_millis(100), recv.recv()).await {
            println!("{}", response);
        }
    });
    Ok(())
}

/// attempt to send a command to the daemon and send it the given action repeatedly.
fn handle_server_command(paths: &CrossbarPaths, action: &ActionWithServer, connect_attempts: usize) -> Result<Option<DaemonResponse>> {
    log::debug!("Trying to find server process at socket {}", paths.get_ipc_socket_file().display());
    let mut stream = attempt_connect(paths.get_ipc_socket_file(), connect_attempts).context("Failed to connect to daemon")?;
    log::debug!("Connected to crossbar-host daemon ({}).", &paths.get_ipc_socket_file().display());
    client::do_server_call(&mut stream, action).context("Error while forwarding command to server")
}

fn handle_daemon_response(res: DaemonResponse) {
    match res {
        DaemonResponse::Success(x) => println!("{}", x),
        DaemonResponse::Failure(x) => {
            eprintln!("{}", x);
            std::process::exit(1);
        }
    }
}

fn attempt_connect(socket_path: impl AsRef<Path>, attempts: usize) -> Option<net::UnixStream> {
    for _ in 0..attempts {
        if let Ok(mut con) = net::UnixStream::connect(&socket_path) {
            if client::do_server_call(&mut con, &opts::ActionWithServer::Ping).is_ok() {
                return net::UnixStream::connect(&socket_path).ok();
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    None
}

/// Check if a daemon is currently running by trying to send a ping message to it.
fn check_server_running(socket_path: impl AsRef<Path>) -> bool {
    let response = net::UnixStream::connect(socket_path)
        .ok()
        .and_then(|mut stream| client::do_server_call(&mut stream, &opts::ActionWithServer::Ping).ok());
    response.is_some()
}
