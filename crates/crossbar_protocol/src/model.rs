use crossbar_shared_util::AttrName;
use serde::{Deserialize, Serialize};

/// Attribute keys the host knows the meaning of. Everything else ends up in [`Attributes::extra`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum KnownAttr {
    Color,
    Href,
    Bash,
    Terminal,
    Refresh,
}

/// The `key=value` pairs following the ` | ` of a menu line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub color: Option<String>,
    pub href: Option<String>,
    pub bash: Option<String>,
    pub terminal: Option<bool>,
    pub refresh: Option<bool>,
    /// Unrecognized attributes, in the order the plugin emitted them.
    pub extra: Vec<(AttrName, String)>,
}

impl Attributes {
    pub fn is_empty(&self) -> bool {
        self.color.is_none()
            && self.href.is_none()
            && self.bash.is_none()
            && self.terminal.is_none()
            && self.refresh.is_none()
            && self.extra.is_empty()
    }

    /// Whether activating a line with these attributes does anything besides refreshing.
    pub fn is_actionable(&self) -> bool {
        self.href.is_some() || self.bash.is_some()
    }

    pub fn wants_refresh(&self) -> bool {
        self.refresh == Some(true)
    }

    /// `bash` commands open a terminal unless the plugin explicitly says `terminal=false`.
    pub fn opens_terminal(&self) -> bool {
        self.terminal.unwrap_or(true)
    }

    /// Look up an unrecognized attribute. If a key was given multiple times, the last value wins.
    pub fn get_extra(&self, key: &str) -> Option<&str> {
        self.extra.iter().rev().find(|(name, _)| name.as_str() == key).map(|(_, value)| value.as_str())
    }

    /// The `param1`..`paramN` arguments for the `bash` command, in numeric order.
    /// Numbering stops at the first missing index.
    pub fn params(&self) -> Vec<&str> {
        (1..).map_while(|idx| self.get_extra(&format!("param{}", idx))).collect()
    }

    /// Set an attribute from its raw textual form.
    /// Boolean attributes with non-boolean values are kept as unrecognized attributes, so nothing the plugin emitted gets lost.
    pub(crate) fn set(&mut self, key: &str, value: String) {
        match key.parse::<KnownAttr>() {
            Ok(KnownAttr::Color) => self.color = Some(value),
            Ok(KnownAttr::Href) => self.href = Some(value),
            Ok(KnownAttr::Bash) => self.bash = Some(value),
            Ok(KnownAttr::Terminal) => match parse_bool(&value) {
                Some(b) => self.terminal = Some(b),
                None => self.extra.push((AttrName::from(key), value)),
            },
            Ok(KnownAttr::Refresh) => match parse_bool(&value) {
                Some(b) => self.refresh = Some(b),
                None => self.extra.push((AttrName::from(key), value)),
            },
            Err(_) => self.extra.push((AttrName::from(key), value)),
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    if s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// A single line of plugin output: its text and the attributes attached to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuLine {
    pub text: String,
    pub attrs: Attributes,
}

impl MenuLine {
    pub fn plain(text: impl Into<String>) -> Self {
        MenuLine { text: text.into(), attrs: Attributes::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MenuItem {
    /// Marks the boundary between two `---` delimited sections.
    Separator,
    Line(MenuLine),
}

impl MenuItem {
    pub fn as_line(&self) -> Option<&MenuLine> {
        match self {
            MenuItem::Line(line) => Some(line),
            MenuItem::Separator => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Status {
    #[default]
    Fresh,
    Stale,
    Failed,
}

/// Structured form of everything a plugin printed during one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderModel {
    pub title: MenuLine,
    pub menu_items: Vec<MenuItem>,
    pub status: Status,
}

impl RenderModel {
    /// Get the menu line at the given position of `menu_items`. Separators are not lines.
    pub fn item(&self, index: usize) -> Option<&MenuLine> {
        self.menu_items.get(index).and_then(MenuItem::as_line)
    }

    /// All lines that do something when activated, together with their index in `menu_items`.
    pub fn actionable_items(&self) -> impl Iterator<Item = (usize, &MenuLine)> {
        self.menu_items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| item.as_line().map(|line| (idx, line)))
            .filter(|(_, line)| line.attrs.is_actionable() || line.attrs.wants_refresh())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_known_and_unknown() {
        let mut attrs = Attributes::default();
        attrs.set("color", "red".to_string());
        attrs.set("refresh", "TRUE".to_string());
        attrs.set("terminal", "maybe".to_string());
        attrs.set("font", "Menlo".to_string());
        assert_eq!(Some("red".to_string()), attrs.color);
        assert_eq!(Some(true), attrs.refresh);
        assert_eq!(None, attrs.terminal);
        assert_eq!(Some("maybe"), attrs.get_extra("terminal"));
        assert_eq!(Some("Menlo"), attrs.get_extra("font"));
    }

    #[test]
    fn test_params_stop_at_gap() {
        let mut attrs = Attributes::default();
        attrs.set("param2", "b".to_string());
        attrs.set("param1", "a".to_string());
        attrs.set("param4", "d".to_string());
        assert_eq!(vec!["a", "b"], attrs.params());
    }

    #[test]
    fn test_terminal_defaults_to_true() {
        let mut attrs = Attributes::default();
        assert!(attrs.opens_terminal());
        attrs.set("terminal", "false".to_string());
        assert!(!attrs.opens_terminal());
    }
}
