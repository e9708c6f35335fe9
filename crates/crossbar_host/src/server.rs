use crate::{
    app::{self, DaemonCommand},
    application_lifecycle::{self, ExitReason},
    config::HostConfig,
    daemon_response, error_handling_ctx, ipc_server,
    paths::CrossbarPaths,
    sandbox::Sandbox,
};
use anyhow::{Context, Result};
use std::{
    os::unix::{fs::PermissionsExt, io::AsRawFd},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc::*;

/// Only one reload is triggered per this period, no matter how many files change.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

pub fn initialize_server(paths: CrossbarPaths, action: Option<DaemonCommand>, should_daemonize: bool) -> Result<ForkResult> {
    std::env::set_current_dir(paths.get_config_dir())
        .with_context(|| format!("Failed to change working directory to {}", paths.get_config_dir().display()))?;

    log::info!("Loading paths: {}", &paths);

    let config = match HostConfig::read_from_file(paths.get_config_file()) {
        Ok(config) => config,
        Err(err) => {
            error_handling_ctx::print_error(err.into());
            HostConfig::default()
        }
    };

    if should_daemonize {
        let fork_result = do_detach(paths.get_log_file())?;

        if fork_result == ForkResult::Parent {
            return Ok(ForkResult::Parent);
        }
    }

    println!(
        r#"
┏━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┓
┃Initializing crossbar daemon ┃
┗━━━━━━━━━━━━━━━━━━━━━━━━━━━━━┛
    "#
    );

    simple_signal::set_handler(&[simple_signal::Signal::Int, simple_signal::Signal::Term], move |_| {
        log::info!("Shutting down crossbar daemon...");
        if let Err(e) = application_lifecycle::send_exit(ExitReason::Signal) {
            log::error!("Failed to send application shutdown event to workers: {:?}", e);
            std::process::exit(1);
        }
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("crossbar-host")
        .enable_all()
        .build()
        .context("Failed to initialize tokio runtime")?;
    rt.block_on(run_daemon(paths, config, action))?;
    log::info!("main application loop finished");

    Ok(ForkResult::Child)
}

async fn run_daemon(paths: CrossbarPaths, config: HostConfig, action: Option<DaemonCommand>) -> Result<()> {
    let (ui_send, mut ui_recv) = unbounded_channel();

    let runner = Arc::new(Sandbox::new(app::sandbox_limits(&config)));
    let mut app = app::App::new(config, paths, runner, ui_send.clone());

    log::debug!("Loading plugins");
    app.load_plugins()?;

    // initialize all the handlers and tasks running asyncronously
    init_async_part(app.paths.clone(), app.paths.get_plugin_dir(&app.config.plugin_dir), ui_send);

    // if an action was given to the daemon initially, execute it first.
    if let Some(action) = action {
        app.handle_command(action);
    }

    while !app.is_exiting() {
        match ui_recv.recv().await {
            Some(event) => app.handle_command(event),
            None => break,
        }
    }

    // stops the IPC server and the file watcher, unless they are already gone because of a signal
    let _ = application_lifecycle::send_exit(ExitReason::KillCommand);
    let _ = std::fs::remove_file(app.paths.get_ipc_socket_file());
    Ok(())
}

fn init_async_part(paths: CrossbarPaths, plugin_dir: PathBuf, ui_send: UnboundedSender<DaemonCommand>) {
    {
        let ui_send = ui_send.clone();
        let config_file = paths.get_config_file();
        tokio::spawn(async move {
            let result = run_filewatch(config_file, plugin_dir, ui_send).await;
            crate::print_result_err!("while watching the plugin directory", result);
        });
    }

    {
        let ui_send = ui_send.clone();
        let socket_file = paths.get_ipc_socket_file().to_path_buf();
        tokio::spawn(async move {
            let result = ipc_server::run_server(ui_send, socket_file).await;
            crate::print_result_err!("in the IPC server", result);
        });
    }

    tokio::spawn(async move {
        // a signal has to reach the app as well, so it stops its plugins
        if let Ok(ExitReason::Signal) = application_lifecycle::recv_exit().await {
            log::debug!("Forwarding signal to the app");
            let _ = ui_send.send(DaemonCommand::KillServer);
        }
    });
}

/// Whether a changed path should cause the plugin set to be reloaded.
/// Plugins live in the plugin directory or one level below it. Files that plugins keep their own state in
/// are not executable, and are ignored so a plugin run never triggers a reload.
fn is_relevant_change(path: &Path, config_file: &Path, plugin_dir: &Path) -> bool {
    if path == config_file {
        return true;
    }
    let hidden = path.file_name().map_or(true, |name| name.to_string_lossy().starts_with('.'));
    let parent = path.parent();
    let in_plugin_dir = parent == Some(plugin_dir) || parent.and_then(Path::parent) == Some(plugin_dir);
    let could_be_plugin = match std::fs::metadata(path) {
        Ok(metadata) => metadata.is_dir() || metadata.permissions().mode() & 0o111 != 0,
        // removed
        Err(_) => true,
    };
    !hidden && in_plugin_dir && could_be_plugin
}

/// Watch the plugin directory and the configuration file, sending reload events to the app when they change.
async fn run_filewatch(config_file: PathBuf, plugin_dir: PathBuf, evt_send: UnboundedSender<DaemonCommand>) -> Result<()> {
    use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

    let (tx, mut rx) = unbounded_channel();
    let watched_plugin_dir = plugin_dir.clone();
    let watched_config_file = config_file.clone();
    let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
        Ok(notify::Event { kind: EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_), paths, .. }) => {
            if paths.iter().any(|path| is_relevant_change(path, &watched_config_file, &watched_plugin_dir)) {
                if let Err(err) = tx.send(()) {
                    log::warn!("Error forwarding file update event: {:?}", err);
                }
            }
        }
        Ok(_) => {}
        Err(e) => log::error!("Encountered Error While Watching Files: {}", e),
    })?;
    watcher.watch(&plugin_dir, RecursiveMode::Recursive)?;
    if let Some(config_dir) = config_file.parent() {
        watcher.watch(config_dir, RecursiveMode::NonRecursive)?;
    }

    crate::loop_select_exiting! {
        Some(()) = rx.recv() => {
            // give editors and package managers a moment to finish writing, then fold everything that changed meanwhile into one reload
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            while rx.try_recv().is_ok() {}

            let (daemon_resp_sender, mut daemon_resp_response) = daemon_response::create_pair();
            evt_send.send(DaemonCommand::ReloadPlugins(daemon_resp_sender))?;
            tokio::spawn(async move {
                match daemon_resp_response.recv().await {
                    Some(daemon_response::DaemonResponse::Success(msg)) => log::info!("Reloaded plugins: {}", msg),
                    Some(daemon_response::DaemonResponse::Failure(e)) => eprintln!("{}", e),
                    None => log::error!("No response to plugin reload request"),
                }
            });
        },
        else => break
    };
    Ok(())
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ForkResult {
    Parent,
    Child,
}

/// detach the process from the terminal, also redirecting stdout and stderr to LOG_FILE
fn do_detach(log_file_path: impl AsRef<Path>) -> Result<ForkResult> {
    let log_file_path = log_file_path.as_ref();
    // detach from terminal
    match unsafe { nix::unistd::fork()? } {
        nix::unistd::ForkResult::Child => {
            nix::unistd::setsid()?;
            match unsafe { nix::unistd::fork()? } {
                nix::unistd::ForkResult::Parent { .. } => std::process::exit(0),
                nix::unistd::ForkResult::Child => {}
            }
        }
        nix::unistd::ForkResult::Parent { .. } => {
            return Ok(ForkResult::Parent);
        }
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)
        .with_context(|| format!("Error opening log file ({}) for writing", log_file_path.display()))?;
    let fd = file.as_raw_fd();

    if nix::unistd::isatty(1)? {
        nix::unistd::dup2(fd, std::io::stdout().as_raw_fd())?;
    }
    if nix::unistd::isatty(2)? {
        nix::unistd::dup2(fd, std::io::stderr().as_raw_fd())?;
    }

    Ok(ForkResult::Child)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::plugin_descriptor::test::write_script;

    #[test]
    fn test_relevant_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("crossbar.json");
        let plugin_dir = dir.path().join("plugins");
        std::fs::create_dir_all(plugin_dir.join("clock")).unwrap();
        let top_level = write_script(&plugin_dir, "cpu.10s.sh", "echo cpu");
        let nested = write_script(&plugin_dir.join("clock"), "clock.1s.sh", "date");
        std::fs::write(plugin_dir.join("clock").join("state.json"), "{}").unwrap();
        std::fs::create_dir_all(plugin_dir.join("clock").join("lib")).unwrap();
        let too_deep = write_script(&plugin_dir.join("clock").join("lib"), "helper.sh", "true");

        assert!(is_relevant_change(&config_file, &config_file, &plugin_dir));
        assert!(is_relevant_change(&top_level, &config_file, &plugin_dir));
        assert!(is_relevant_change(&nested, &config_file, &plugin_dir));
        assert!(is_relevant_change(&plugin_dir.join("clock"), &config_file, &plugin_dir));
        assert!(is_relevant_change(&plugin_dir.join("removed.1m.sh"), &config_file, &plugin_dir));

        assert!(!is_relevant_change(&plugin_dir.join("clock").join("state.json"), &config_file, &plugin_dir));
        assert!(!is_relevant_change(&plugin_dir.join(".cpu.10s.sh.swp"), &config_file, &plugin_dir));
        assert!(!is_relevant_change(&dir.path().join("widget.json.tmp"), &config_file, &plugin_dir));
        assert!(!is_relevant_change(&too_deep, &config_file, &plugin_dir));
    }
}
