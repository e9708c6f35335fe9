use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::{
    app,
    daemon_response::{self, DaemonResponse, DaemonResponseReceiver, DaemonResponseSender},
    data_source::Stat,
};

/// Struct that gets generated from `RawOpt`.
#[derive(Debug, PartialEq)]
pub struct Opt {
    pub log_debug: bool,
    pub config_path: Option<std::path::PathBuf>,
    pub action: Action,
    pub no_daemonize: bool,
    pub restart: bool,
}

#[derive(Parser, Debug, PartialEq)]
#[clap(author = "crossbar contributors")]
#[clap(version, about)]
pub(super) struct RawOpt {
    /// Write out debug logs. (To read the logs, run `crossbar-host logs`).
    #[arg(long = "debug", global = true)]
    log_debug: bool,

    /// Override the path to the configuration directory (the directory containing crossbar.json and the plugins).
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Don't fork the daemon into the background.
    #[arg(long = "no-daemonize", global = true)]
    no_daemonize: bool,

    /// Restart the daemon completely before running the command.
    #[arg(long = "restart", global = true)]
    restart: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Action {
    /// Generate a shell completion script
    ShellCompletions {
        #[arg(short, long)]
        shell: clap_complete::Shell,
    },

    /// Start the crossbar daemon.
    #[command(name = "daemon", alias = "d")]
    Daemon,

    #[command(flatten)]
    ClientOnly(ActionClientOnly),

    #[command(flatten)]
    WithServer(ActionWithServer),
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ActionClientOnly {
    /// Print and watch the daemon logs
    #[command(name = "logs")]
    Logs,

    /// Print a system statistic, the same way plugins get it
    #[command(name = "stat")]
    Stat {
        #[arg(value_enum)]
        kind: Stat,
    },

    /// Run every plugin once, without a daemon, and print the result
    #[command(name = "once")]
    Once {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionWithServer {
    /// Ping the daemon, checking if it is reachable.
    #[command(name = "ping")]
    Ping,

    /// Run a plugin right now, outside of its schedule
    #[command(name = "refresh")]
    Refresh {
        /// Identifier (`cpu.10s.sh`) or name (`cpu`) of the plugin
        plugin: String,
    },

    /// Activate a menu item of a plugin, as if it was clicked
    #[command(name = "activate", alias = "a")]
    Activate {
        /// Identifier (`cpu.10s.sh`) or name (`cpu`) of the plugin
        plugin: String,

        /// Position of the item in the plugins menu, as listed by `crossbar-host state`
        item: usize,
    },

    /// Print the current status display
    #[command(name = "render")]
    Render {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the status and schedule of every plugin
    #[command(name = "state")]
    ShowState,

    /// List all loaded plugins
    #[command(name = "plugins")]
    ListPlugins,

    /// Reload the configuration and the plugin directory
    #[command(name = "reload", alias = "r")]
    Reload,

    /// Kill the crossbar daemon
    #[command(name = "kill", alias = "k")]
    KillServer,
}

impl Opt {
    pub fn from_env() -> Self {
        let raw: RawOpt = RawOpt::parse();
        raw.into()
    }
}

impl From<RawOpt> for Opt {
    fn from(other: RawOpt) -> Self {
        let RawOpt { log_debug, config, action, no_daemonize, restart } = other;
        Opt { log_debug, config_path: config, action, no_daemonize, restart }
    }
}

impl ActionWithServer {
    /// Whether running this command should start a daemon if none is running yet.
    pub fn can_start_daemon(&self) -> bool {
        matches!(self, ActionWithServer::Refresh { .. } | ActionWithServer::Reload)
    }

    pub fn into_daemon_command(self) -> (app::DaemonCommand, Option<DaemonResponseReceiver>) {
        let command = match self {
            ActionWithServer::Ping => {
                let (send, recv) = tokio::sync::mpsc::unbounded_channel();
                let _ = send.send(DaemonResponse::Success("pong".to_owned()));
                return (app::DaemonCommand::NoOp, Some(recv));
            }
            ActionWithServer::Refresh { plugin } => {
                return with_response_channel(|sender| app::DaemonCommand::Refresh { plugin, sender });
            }
            ActionWithServer::Activate { plugin, item } => {
                return with_response_channel(|sender| app::DaemonCommand::Activate { plugin, item, sender });
            }
            ActionWithServer::Render { json } => {
                return with_response_channel(|sender| app::DaemonCommand::Render { json, sender });
            }
            ActionWithServer::ShowState => return with_response_channel(app::DaemonCommand::PrintState),
            ActionWithServer::ListPlugins => return with_response_channel(app::DaemonCommand::ListPlugins),
            ActionWithServer::Reload => return with_response_channel(app::DaemonCommand::ReloadPlugins),
            ActionWithServer::KillServer => app::DaemonCommand::KillServer,
        };
        (command, None)
    }
}

fn with_response_channel<O, F>(f: F) -> (O, Option<DaemonResponseReceiver>)
where
    F: FnOnce(DaemonResponseSender) -> O,
{
    let (sender, recv) = daemon_response::create_pair();
    (f(sender), Some(recv))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Opt {
        RawOpt::try_parse_from(std::iter::once("crossbar-host").chain(args.iter().copied())).unwrap().into()
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(Action::Daemon, parse(&["daemon"]).action);
        assert_eq!(Action::ClientOnly(ActionClientOnly::Stat { kind: Stat::Battery }), parse(&["stat", "battery"]).action);
        assert_eq!(
            Action::WithServer(ActionWithServer::Activate { plugin: "cpu".to_string(), item: 3 }),
            parse(&["activate", "cpu", "3"]).action
        );
        assert_eq!(Action::WithServer(ActionWithServer::Render { json: true }), parse(&["render", "--json"]).action);
    }

    #[test]
    fn test_global_flags() {
        let opt = parse(&["state", "--debug", "--config", "/tmp/crossbar", "--no-daemonize"]);
        assert!(opt.log_debug);
        assert!(opt.no_daemonize);
        assert!(!opt.restart);
        assert_eq!(Some(std::path::PathBuf::from("/tmp/crossbar")), opt.config_path);
    }

    #[tokio::test]
    async fn test_ping_answers_immediately() {
        let (command, recv) = ActionWithServer::Ping.into_daemon_command();
        assert!(matches!(command, app::DaemonCommand::NoOp));
        assert_eq!(Some(DaemonResponse::Success("pong".to_string())), recv.unwrap().recv().await);
    }
}
