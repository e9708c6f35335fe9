use crate::{
    error::ParseError,
    model::{MenuItem, MenuLine, RenderModel, Status},
};

pub(crate) mod attributes;

/// A line consisting of exactly this text starts a new menu section.
pub const SECTION_SEPARATOR: &str = "---";

/// Delimits the text of a line from its attributes.
pub const ATTR_DELIMITER: &str = " | ";

/// Parse the raw stdout of a plugin. Fails only if the output is not valid UTF-8.
pub fn parse(stdout: &[u8]) -> Result<RenderModel, ParseError> {
    let text = std::str::from_utf8(stdout).map_err(|e| ParseError::InvalidUtf8 { valid_up_to: e.valid_up_to() })?;
    Ok(parse_str(text))
}

/// Parse plugin output. This never fails: anything that doesn't follow the protocol is shown as plain text.
pub fn parse_str(text: &str) -> RenderModel {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut lines: Vec<&str> = text.lines().collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }

    let mut blocks = lines.split(|line| *line == SECTION_SEPARATOR);
    // Everything after the first line of the title block is ignored.
    let title = blocks.next().and_then(|title_block| title_block.first()).map(|line| parse_line(line)).unwrap_or_default();

    let mut menu_items = Vec::new();
    for (idx, section) in blocks.enumerate() {
        if idx > 0 {
            menu_items.push(MenuItem::Separator);
        }
        menu_items.extend(section.iter().map(|line| MenuItem::Line(parse_line(line))));
    }

    RenderModel { title, menu_items, status: Status::Fresh }
}

/// Parse a single line into its text and attributes.
///
/// Every occurrence of ` | ` is tried from left to right, and the first one that is followed by nothing but
/// well-formed `key=value` pairs separates the text from the attributes. If there is none, the whole line is text.
pub fn parse_line(line: &str) -> MenuLine {
    for (idx, _) in line.match_indices(ATTR_DELIMITER) {
        if let Some(attrs) = attributes::parse_attributes(&line[idx + ATTR_DELIMITER.len()..]) {
            return MenuLine { text: line[..idx].to_string(), attrs };
        }
    }
    MenuLine::plain(line)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::Attributes;
    use pretty_assertions::assert_eq;

    fn line(text: &str) -> MenuItem {
        MenuItem::Line(MenuLine::plain(text))
    }

    #[test]
    fn test_battery_output() {
        let model = parse_str("🔋 85% | color=green\n---\nBattery: 85%\n---\nRefresh | refresh=true");
        assert_eq!("🔋 85%", model.title.text);
        assert_eq!(Some("green".to_string()), model.title.attrs.color);
        assert_eq!(
            vec![
                line("Battery: 85%"),
                MenuItem::Separator,
                MenuItem::Line(MenuLine {
                    text: "Refresh".to_string(),
                    attrs: Attributes { refresh: Some(true), ..Attributes::default() }
                }),
            ],
            model.menu_items
        );
        let actionable: Vec<_> = model.actionable_items().map(|(idx, line)| (idx, line.text.as_str())).collect();
        assert_eq!(vec![(2, "Refresh")], actionable);
    }

    #[test]
    fn test_empty_output() {
        let model = parse(b"").unwrap();
        assert_eq!("", model.title.text);
        assert!(model.title.attrs.is_empty());
        assert!(model.menu_items.is_empty());
        assert_eq!(Status::Fresh, model.status);
    }

    #[test]
    fn test_invalid_utf8() {
        assert_eq!(Err(ParseError::InvalidUtf8 { valid_up_to: 2 }), parse(b"ok\xff\xfe"));
    }

    #[test]
    fn test_extra_title_lines_are_ignored() {
        let model = parse_str("title\nsecond title line\n---\nitem");
        assert_eq!("title", model.title.text);
        assert_eq!(vec![line("item")], model.menu_items);
    }

    #[test]
    fn test_output_without_separator() {
        let model = parse_str("just a title\n");
        assert_eq!("just a title", model.title.text);
        assert!(model.menu_items.is_empty());
    }

    #[test]
    fn test_output_starting_with_separator() {
        let model = parse_str("---\nitem");
        assert_eq!("", model.title.text);
        assert_eq!(vec![line("item")], model.menu_items);
    }

    #[test]
    fn test_empty_sections_keep_their_separators() {
        let model = parse_str("t\n---\na\n---\n---\nb\n\n\n");
        assert_eq!(vec![line("a"), MenuItem::Separator, MenuItem::Separator, line("b")], model.menu_items);
    }

    #[test]
    fn test_crlf_line_endings() {
        let model = parse_str("t | color=red\r\n---\r\nitem\r\n");
        assert_eq!("t", model.title.text);
        assert_eq!(Some("red".to_string()), model.title.attrs.color);
        assert_eq!(vec![line("item")], model.menu_items);
    }

    #[test]
    fn test_separator_must_match_exactly() {
        let model = parse_str("t\n---\n----\n --- ");
        assert_eq!(vec![line("----"), line(" --- ")], model.menu_items);
    }

    #[test]
    fn test_pipe_in_text_without_attributes() {
        let parsed = parse_line("Total: 3 | Pending: 2 | Done: 1");
        assert_eq!(MenuLine::plain("Total: 3 | Pending: 2 | Done: 1"), parsed);
    }

    #[test]
    fn test_pipe_in_text_with_attributes() {
        let parsed = parse_line("Total: 3 | Pending: 2 | color=gray");
        assert_eq!("Total: 3 | Pending: 2", parsed.text);
        assert_eq!(Some("gray".to_string()), parsed.attrs.color);
    }

    #[test]
    fn test_bash_action_with_quoted_command() {
        let parsed = parse_line(r#"Open Activity Monitor | bash='open -a "Activity Monitor"' terminal=false"#);
        assert_eq!("Open Activity Monitor", parsed.text);
        assert_eq!(Some(r#"open -a "Activity Monitor""#.to_string()), parsed.attrs.bash);
        assert_eq!(Some(false), parsed.attrs.terminal);
        assert!(parsed.attrs.is_actionable());
    }

    #[test]
    fn test_unknown_attributes_are_preserved() {
        let parsed = parse_line("Hi | font=Menlo size=12 color=blue");
        assert_eq!(Some("blue".to_string()), parsed.attrs.color);
        assert_eq!(Some("Menlo"), parsed.attrs.get_extra("font"));
        assert_eq!(Some("12"), parsed.attrs.get_extra("size"));
    }

    #[test]
    fn test_malformed_attributes_stay_literal() {
        assert_eq!(MenuLine::plain("x | color='red"), parse_line("x | color='red"));
        assert_eq!(MenuLine::plain("x | "), parse_line("x | "));
        assert_eq!(MenuLine::plain("x |color=red"), parse_line("x |color=red"));
    }

    #[test]
    fn test_href_item() {
        let model = parse_str("🔔 3\n---\nOpen GitHub Notifications | href=https://github.com/notifications");
        let item = model.item(0).unwrap();
        assert_eq!(Some("https://github.com/notifications".to_string()), item.attrs.href);
        assert_eq!(None, model.item(1));
    }
}
