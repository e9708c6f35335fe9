//! Serialization of render models back into the plugin protocol.
//! Attributes are written in a normalized order, so output is structurally, not byte-wise, identical to what a plugin printed.

use std::fmt;

use crate::{
    model::{Attributes, KnownAttr, MenuItem, MenuLine, RenderModel},
    parser::{ATTR_DELIMITER, SECTION_SEPARATOR},
};

impl fmt::Display for RenderModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.title)?;
        if !self.menu_items.is_empty() {
            write!(f, "\n{}", SECTION_SEPARATOR)?;
        }
        for item in &self.menu_items {
            match item {
                MenuItem::Separator => write!(f, "\n{}", SECTION_SEPARATOR)?,
                MenuItem::Line(line) => write!(f, "\n{}", line)?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for MenuLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.attrs.is_empty() {
            write!(f, "{}", self.text)
        } else {
            write!(f, "{}{}{}", self.text, ATTR_DELIMITER, self.attrs)
        }
    }
}

impl fmt::Display for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known = [
            (KnownAttr::Color, self.color.clone()),
            (KnownAttr::Href, self.href.clone()),
            (KnownAttr::Bash, self.bash.clone()),
            (KnownAttr::Terminal, self.terminal.map(|b| b.to_string())),
            (KnownAttr::Refresh, self.refresh.map(|b| b.to_string())),
        ];
        let known = known.into_iter().filter_map(|(key, value)| Some((key.as_ref().to_string(), value?)));
        let extra = self.extra.iter().map(|(key, value)| (key.to_string(), value.clone()));

        for (idx, (key, value)) in known.chain(extra).enumerate() {
            if idx > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}={}", key, quote_value(&value))?;
        }
        Ok(())
    }
}

/// Quote an attribute value if it would otherwise not be read back as a single value.
pub fn quote_value(value: &str) -> String {
    let needs_quotes = value.is_empty() || value.starts_with(['\'', '"']) || value.contains(char::is_whitespace);
    if !needs_quotes {
        value.to_string()
    } else if !value.contains('\'') {
        format!("'{}'", value)
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}
