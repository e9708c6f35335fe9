use std::{path::Path, sync::Arc};

use anyhow::{anyhow, bail, Context, Result};
use crossbar_shared_util::PluginId;
use itertools::Itertools;
use tokio::{sync::mpsc::UnboundedSender, time::Instant};

use crate::{
    actions::{self, ActionOptions},
    cache::ResultCache,
    config::{self, HostConfig, OutputFormat, PluginDescriptor},
    daemon_response::DaemonResponseSender,
    error_handling_ctx,
    paths::CrossbarPaths,
    render::{self, DisplayPayload, RenderOptions},
    sandbox::{self, PluginRunner, SandboxLimits},
    scheduler::{RefreshOutcome, Scheduler, SchedulerOptions},
    util,
};

#[derive(Debug)]
pub enum DaemonCommand {
    NoOp,
    /// A plugin finished a run and its cache entry changed.
    PluginUpdated(PluginId),
    /// The commands started by activating a menu item exited, and the plugin asked to be run again.
    RefreshAfterAction(PluginId),
    Refresh {
        plugin: String,
        sender: DaemonResponseSender,
    },
    Activate {
        plugin: String,
        item: usize,
        sender: DaemonResponseSender,
    },
    Render {
        json: bool,
        sender: DaemonResponseSender,
    },
    PrintState(DaemonResponseSender),
    ListPlugins(DaemonResponseSender),
    ReloadPlugins(DaemonResponseSender),
    KillServer,
}

pub struct App {
    pub config: HostConfig,
    pub paths: CrossbarPaths,
    /// All loaded plugins, in load order. This is also the display order.
    pub plugins: Vec<Arc<PluginDescriptor>>,
    pub cache: ResultCache,
    pub scheduler: Scheduler,
    pub app_evt_send: UnboundedSender<DaemonCommand>,
    /// The payload that was last printed or exported, to avoid emitting the same thing twice.
    last_payload: Option<DisplayPayload>,
    exiting: bool,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").field("config", &self.config).field("paths", &self.paths).field("plugins", &self.plugins).finish()
    }
}

impl App {
    pub fn new(config: HostConfig, paths: CrossbarPaths, runner: Arc<dyn PluginRunner>, app_evt_send: UnboundedSender<DaemonCommand>) -> Self {
        let cache = ResultCache::new();
        let scheduler = Scheduler::new(runner, cache.clone(), app_evt_send.clone(), scheduler_options(&config));
        App { config, paths, plugins: Vec::new(), cache, scheduler, app_evt_send, last_payload: None, exiting: false }
    }

    /// Whether the app received a kill command.
    pub fn is_exiting(&self) -> bool {
        self.exiting
    }

    /// Handle a DaemonCommand event.
    pub fn handle_command(&mut self, event: DaemonCommand) {
        log::debug!("Handling event: {:?}", &event);
        if let Err(err) = self.try_handle_command(event) {
            error_handling_ctx::print_error(err);
        }
    }

    fn try_handle_command(&mut self, event: DaemonCommand) -> Result<()> {
        match event {
            DaemonCommand::NoOp => {}
            DaemonCommand::PluginUpdated(plugin) => {
                log::trace!("Plugin {} updated", plugin);
                self.emit_output()?;
            }
            DaemonCommand::RefreshAfterAction(plugin) => {
                if self.scheduler.refresh(&plugin) != RefreshOutcome::Triggered {
                    log::debug!("Not refreshing {} after its action, it is running or gone", plugin);
                }
            }
            DaemonCommand::Refresh { plugin, sender } => {
                let result = self.find_plugin(&plugin).map(|descriptor| descriptor.id.clone()).and_then(|id| {
                    match self.scheduler.refresh(&id) {
                        RefreshOutcome::Triggered => Ok(format!("Refreshing {}", id)),
                        RefreshOutcome::AlreadyRunning => Ok(format!("{} is already running", id)),
                        RefreshOutcome::Unknown => Err(anyhow!("{} is not scheduled", id)),
                    }
                });
                sender.respond_with_result(result)?;
            }
            DaemonCommand::Activate { plugin, item, sender } => {
                let result = self.activate(&plugin, item);
                sender.respond_with_result(result)?;
            }
            DaemonCommand::Render { json, sender } => {
                let payload = self.render();
                let output = if json { render::to_json(&payload)? } else { render::to_text(&payload, &self.render_options()) };
                sender.send_success(output)?;
            }
            DaemonCommand::PrintState(sender) => {
                sender.send_success(self.print_state())?;
            }
            DaemonCommand::ListPlugins(sender) => {
                let output = self
                    .plugins
                    .iter()
                    .map(|plugin| {
                        format!(
                            "{}\t{}\t{}",
                            plugin.id,
                            crossbar_protocol::filename::format_interval(plugin.interval),
                            plugin.path.display()
                        )
                    })
                    .join("\n");
                sender.send_success(output)?;
            }
            DaemonCommand::ReloadPlugins(sender) => {
                let result = self.reload();
                sender.respond_with_result(result)?;
            }
            DaemonCommand::KillServer => {
                log::info!("Received kill command, stopping server!");
                self.stop_application();
            }
        }
        Ok(())
    }

    fn stop_application(&mut self) {
        self.scheduler.stop_all();
        self.exiting = true;
    }

    /// Read the configuration again and reload the plugin directory.
    fn reload(&mut self) -> Result<String> {
        let config = HostConfig::read_from_file(self.paths.get_config_file())?;
        self.scheduler.set_options(scheduler_options(&config));
        self.config = config;
        self.load_plugins()?;
        Ok(format!("Loaded {} plugins", self.plugins.len()))
    }

    /// Load the plugin directory, scheduling new plugins and stopping the ones that are gone.
    /// Plugins whose descriptor didn't change keep running undisturbed.
    pub fn load_plugins(&mut self) -> Result<()> {
        let plugin_dir = self.paths.get_plugin_dir(&self.config.plugin_dir);
        let plugins = config::load_plugins(&plugin_dir, &self.config)?;

        let (removed, added) = util::list_difference(&self.plugins, &plugins);
        for plugin in removed {
            self.scheduler.stop(&plugin.id);
        }
        for plugin in added {
            log::info!("Starting plugin {}", plugin.id);
            self.scheduler.start(plugin.clone());
        }

        self.cache.retain(&plugins.iter().map(|plugin| plugin.id.clone()).collect::<Vec<_>>());
        self.plugins = plugins;
        Ok(())
    }

    fn plugin_order(&self) -> Vec<PluginId> {
        self.plugins.iter().map(|plugin| plugin.id.clone()).collect()
    }

    fn render_options(&self) -> RenderOptions {
        RenderOptions::from(&self.config)
    }

    pub fn render(&self) -> DisplayPayload {
        render::render(&self.cache.snapshot(&self.plugin_order()), &self.render_options())
    }

    /// Print the rendered payload and update the widget snapshot, if anything changed since last time.
    fn emit_output(&mut self) -> Result<()> {
        let payload = self.render();
        if self.last_payload.as_ref() == Some(&payload) {
            return Ok(());
        }

        match self.config.output {
            OutputFormat::None => {}
            OutputFormat::Text => println!("{}\n", render::to_text(&payload, &self.render_options())),
            OutputFormat::Json => println!("{}", serde_json::to_string(&payload)?),
        }
        if let Some(path) = &self.config.widget_export {
            write_widget_snapshot(&self.paths.get_config_dir().join(path), &payload)?;
        }
        self.last_payload = Some(payload);
        Ok(())
    }

    /// Look up a plugin by its identifier, or by its name if that is unambiguous.
    fn find_plugin(&self, query: &str) -> Result<&Arc<PluginDescriptor>> {
        if let Some(plugin) = self.plugins.iter().find(|plugin| plugin.id.as_str() == query) {
            return Ok(plugin);
        }
        let by_name: Vec<_> = self.plugins.iter().filter(|plugin| plugin.name == query).collect();
        match by_name.as_slice() {
            [plugin] => Ok(plugin),
            [] => {
                let candidates = self.plugins.iter().map(|plugin| plugin.id.as_str());
                match did_you_mean(query, candidates) {
                    Some(suggestion) => bail!("No plugin named '{}'. Did you mean '{}'?", query, suggestion),
                    None => bail!("No plugin named '{}'", query),
                }
            }
            _ => bail!("'{}' is ambiguous, use one of: {}", query, by_name.iter().map(|plugin| &plugin.id).join(", ")),
        }
    }

    fn activate(&self, plugin: &str, item: usize) -> Result<String> {
        let descriptor = self.find_plugin(plugin)?;
        let model = self
            .cache
            .get(&descriptor.id)
            .and_then(|entry| entry.model)
            .with_context(|| format!("{} has not produced any output yet", descriptor.id))?;
        let line = model.item(item).with_context(|| format!("{} has no menu item {}", descriptor.id, item))?;

        let plan = actions::plan(line, &self.action_options());
        if plan.is_empty() {
            bail!("Menu item {} of {} ('{}') does nothing when activated", item, descriptor.id, line.text);
        }
        let mut running = Vec::new();
        for command in &plan.commands {
            running.push(actions::spawn_detached(command, &descriptor.working_dir)?);
        }
        if plan.refresh && running.is_empty() {
            self.scheduler.refresh(&descriptor.id);
        } else if plan.refresh {
            // the plugin usually reads back what its action just wrote, so only run it once the action is done
            let evt_send = self.app_evt_send.clone();
            let id = descriptor.id.clone();
            tokio::spawn(async move {
                futures::future::join_all(running).await;
                let _ = evt_send.send(DaemonCommand::RefreshAfterAction(id));
            });
        }
        Ok(format!("Activated '{}' of {}", line.text, descriptor.id))
    }

    fn action_options(&self) -> ActionOptions {
        ActionOptions { terminal: self.config.terminal.clone(), opener: actions::PLATFORM_OPENER.to_string() }
    }

    /// Human readable overview of every plugin: how it's doing and which of its items can be activated.
    fn print_state(&self) -> String {
        let now = Instant::now();
        let mut output = Vec::new();
        for plugin in &self.plugins {
            let status = match self.cache.get(&plugin.id) {
                Some(entry) if entry.is_pending() => "pending".to_string(),
                Some(entry) => entry.status.to_string(),
                None => "unknown".to_string(),
            };
            let schedule = match self.scheduler.entry(&plugin.id) {
                Some(entry) => format!(
                    "{}runs: {}, dropped ticks: {}, next run in {}",
                    if entry.running { "running, " } else { "" },
                    entry.runs,
                    entry.dropped_ticks,
                    util::format_duration_short(entry.next_fire_time.saturating_duration_since(now)),
                ),
                None => "not scheduled".to_string(),
            };
            output.push(format!("{} [{}] {}", plugin.id, status, schedule));

            let Some(entry) = self.cache.get(&plugin.id) else { continue };
            if let Some(failure) = &entry.failure {
                output.push(format!("  {} (failed {} times in a row)", failure, entry.consecutive_failures));
            }
            if let Some(model) = &entry.model {
                for (idx, line) in model.actionable_items() {
                    output.push(format!("  [{}] {}", idx, line.text));
                }
            }
        }
        output.join("\n")
    }
}

fn scheduler_options(config: &HostConfig) -> SchedulerOptions {
    SchedulerOptions { run_on_start: config.run_on_start, partial_output: config.partial_output }
}

pub fn sandbox_limits(config: &HostConfig) -> SandboxLimits {
    SandboxLimits { max_output_bytes: config.max_output_bytes }
}

/// Write the widget snapshot next to its final location first, so readers never see a half written file.
fn write_widget_snapshot(path: &Path, payload: &DisplayPayload) -> Result<()> {
    let snapshot = serde_json::to_string_pretty(&render::widget_snapshot(payload))?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, snapshot).with_context(|| format!("Failed to write widget snapshot to {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path).with_context(|| format!("Failed to move widget snapshot to {}", path.display()))?;
    Ok(())
}

/// The candidate closest to `query`, if any is close enough to plausibly be a typo.
fn did_you_mean<'a>(query: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    candidates
        .into_iter()
        .map(|candidate| (strsim::jaro_winkler(query, candidate), candidate))
        .filter(|(similarity, _)| *similarity > 0.7)
        .max_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, candidate)| candidate)
}

/// Load all plugins, run each of them once at the same time, and render the result.
pub async fn render_once(config: &HostConfig, paths: &CrossbarPaths) -> Result<DisplayPayload> {
    let plugins = config::load_plugins(&paths.get_plugin_dir(&config.plugin_dir), config)?;
    let limits = sandbox_limits(config);
    let results = futures::future::join_all(plugins.iter().map(|plugin| sandbox::run(plugin, limits))).await;

    let cache = ResultCache::new();
    for (plugin, result) in plugins.iter().zip(results) {
        cache.register(&plugin.id, plugin.interval);
        cache.record(&result, config.partial_output);
    }
    let order: Vec<PluginId> = plugins.iter().map(|plugin| plugin.id.clone()).collect();
    Ok(render::render(&cache.snapshot(&order), &RenderOptions::from(config)))
}
