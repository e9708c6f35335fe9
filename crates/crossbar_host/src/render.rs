//! Turning cached plugin results into what is shown to the user.
//!
//! Everything in here is pure: the same snapshot always renders to the same payload, and nothing is run or opened.

use crossbar_protocol::{MenuItem, MenuLine, Status};
use crossbar_shared_util::PluginId;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    cache::{CacheEntry, CacheSnapshot},
    config::{BarMode, HostConfig},
};

/// Prefixed to the title of a plugin whose latest run failed.
pub const FAILURE_MARKER: &str = "⚠";
/// Shown for plugins that have not finished their first run yet.
pub const PENDING_PLACEHOLDER: &str = "…";
/// Icon used in widget snapshots for titles that don't start with one.
pub const DEFAULT_WIDGET_ICON: &str = "📊";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub bar_mode: BarMode,
    pub separator: String,
    pub failure_color: String,
}

impl From<&HostConfig> for RenderOptions {
    fn from(config: &HostConfig) -> Self {
        RenderOptions {
            bar_mode: config.bar.mode.clone(),
            separator: config.bar.separator.clone(),
            failure_color: config.failure_color.clone(),
        }
    }
}

/// The expanded view of a single plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginMenu {
    pub plugin: PluginId,
    pub title: MenuLine,
    pub status: Status,
    pub items: Vec<MenuItem>,
    /// Why the latest run failed, if it did.
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayPayload {
    /// The collapsed status line.
    pub bar: String,
    pub menus: Vec<PluginMenu>,
}

pub fn render(snapshot: &CacheSnapshot, options: &RenderOptions) -> DisplayPayload {
    let menus: Vec<PluginMenu> = snapshot.entries.iter().map(|(id, entry)| plugin_menu(id, entry, options)).collect();

    let primary = match &options.bar_mode {
        BarMode::Primary(primary) => menus.iter().find(|menu| menu.plugin.as_str() == primary),
        BarMode::All => None,
    };
    let bar = match primary {
        Some(menu) => menu.title.text.clone(),
        // an unknown primary plugin shows everything rather than nothing
        None => menus.iter().map(|menu| menu.title.text.as_str()).filter(|text| !text.is_empty()).join(&options.separator),
    };

    DisplayPayload { bar, menus }
}

fn plugin_menu(id: &PluginId, entry: &CacheEntry, options: &RenderOptions) -> PluginMenu {
    let failed = matches!(entry.status, Status::Failed | Status::Stale);
    let title = match (&entry.model, &entry.failure) {
        (Some(model), _) if failed => failure_title(&model.title.text, &model.title, options),
        (Some(model), _) => model.title.clone(),
        (None, Some(failure)) => failure_title(failure.placeholder(), &MenuLine::default(), options),
        (None, None) => MenuLine::plain(PENDING_PLACEHOLDER),
    };
    PluginMenu {
        plugin: id.clone(),
        title,
        status: entry.status,
        items: entry.model.as_ref().map(|model| model.menu_items.clone()).unwrap_or_default(),
        diagnostic: entry.failure.as_ref().map(|failure| format!("{}: {}", failure.placeholder(), failure.message)),
    }
}

/// Keep the attributes of the original title, but mark it as failed.
fn failure_title(text: &str, original: &MenuLine, options: &RenderOptions) -> MenuLine {
    let mut line = original.clone();
    line.text = if text.is_empty() { FAILURE_MARKER.to_string() } else { format!("{} {}", FAILURE_MARKER, text) };
    line.attrs.color = Some(options.failure_color.clone());
    line
}

/// Render the payload in the plugin protocol itself: the bar line, then one submenu per plugin.
pub fn to_text(payload: &DisplayPayload, options: &RenderOptions) -> String {
    let mut lines = vec![payload.bar.clone(), "---".to_string()];
    for menu in &payload.menus {
        lines.push(menu.title.to_string());
        for item in &menu.items {
            match item {
                MenuItem::Separator => lines.push("-----".to_string()),
                MenuItem::Line(line) => lines.push(format!("--{}", line)),
            }
        }
        if let Some(diagnostic) = &menu.diagnostic {
            let mut line = MenuLine::plain(format!("{} {}", FAILURE_MARKER, diagnostic));
            line.attrs.color = Some(options.failure_color.clone());
            lines.push(format!("--{}", line));
        }
    }
    lines.join("\n")
}

pub fn to_json(payload: &DisplayPayload) -> serde_json::Result<String> {
    serde_json::to_string_pretty(payload)
}

/// Snapshot in the format home screen widgets read: a `plugin_ids` list plus one `plugin_<id>` record per plugin.
pub fn widget_snapshot(payload: &DisplayPayload) -> serde_json::Value {
    let mut snapshot = serde_json::Map::new();
    let ids: Vec<&str> = payload.menus.iter().map(|menu| menu.plugin.as_str()).collect();
    snapshot.insert("plugin_ids".to_string(), serde_json::json!(ids));
    for menu in &payload.menus {
        let (icon, text) = split_icon(&menu.title.text);
        let tooltip = menu.diagnostic.clone().or_else(|| menu.items.iter().find_map(MenuItem::as_line).map(|line| line.text.clone()));
        snapshot.insert(
            format!("plugin_{}", menu.plugin),
            serde_json::json!({
                "pluginId": menu.plugin.as_str(),
                "icon": icon,
                "text": text,
                "color": menu.title.attrs.color,
                "tooltip": tooltip,
            }),
        );
    }
    serde_json::Value::Object(snapshot)
}

/// `"🔋 85%"` → `("🔋", "85%")`. Titles that don't start with a symbol get the default icon.
fn split_icon(title: &str) -> (&str, &str) {
    match title.split_once(' ') {
        Some((icon, text)) if !icon.is_empty() && !icon.chars().any(char::is_alphanumeric) => (icon, text.trim_start()),
        _ => (DEFAULT_WIDGET_ICON, title),
    }
}
