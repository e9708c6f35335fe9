use crate::error::{ConfigError, LoadError};

pub fn print_error(err: anyhow::Error) {
    match hint_for(&err) {
        Some(hint) => log::error!("{:?}\n\nhint: {}", err, hint),
        None => log::error!("{:?}", err),
    }
}

/// Format an error together with its chain of causes, the way it is reported to IPC clients.
pub fn format_error(err: &anyhow::Error) -> String {
    match hint_for(err) {
        Some(hint) => format!("{:#}\nhint: {}", err, hint),
        None => format!("{:#}", err),
    }
}

fn hint_for(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(err) = err.downcast_ref::<LoadError>() {
        Some(match err {
            LoadError::Missing(_) => "create the directory, or point `plugin_dir` in crossbar.json somewhere else",
            LoadError::NotADirectory(_) => "`plugin_dir` must point to a directory containing plugin executables",
            LoadError::Unreadable { .. } => "check the permissions of the plugin directory",
        })
    } else if let Some(ConfigError::Invalid { .. }) = err.downcast_ref::<ConfigError>() {
        Some("unknown keys are rejected, and durations are written like \"10s\" or \"500ms\"")
    } else {
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_format_error_includes_hint() {
        let err = anyhow::Error::new(LoadError::Missing(PathBuf::from("/nope")));
        let formatted = format_error(&err);
        assert!(formatted.starts_with("Plugin directory /nope does not exist"));
        assert!(formatted.contains("hint: create the directory"));
    }

    #[test]
    fn test_format_error_without_hint() {
        let err = anyhow::anyhow!("boom");
        assert_eq!("boom", format_error(&err));
    }
}
