/// A directive that replaces normal execution of a cell.
#[derive(Debug, PartialEq)]
pub enum CellDirective {
    /// `%%html`: the rest of the cell is rendered as markup.
    Html(String),

    /// `!pip ...` or `%pip ...`
    Pip(PipCommand),
}

#[derive(Debug, PartialEq)]
pub enum PipCommand {
    /// `install pkg...`, flags dropped.
    Install(Vec<String>),

    /// `install` with no package names.
    Usage,

    /// Any other sub-command.
    Unsupported,
}

pub const PIP_USAGE: &str = "Usage: !pip install <package_name>\n";
pub const PIP_UNSUPPORTED: &str = "Only 'pip install' is currently supported.\n";

/// Try to parse a cell as a directive.
/// Returns None if the cell is ordinary code.
pub fn parse_directive(source: &str) -> Option<CellDirective> {
    let trimmed = source.trim();

    if let Some(markup) = trimmed.strip_prefix("%%html") {
        return Some(CellDirective::Html(markup.to_string()));
    }

    let rest = trimmed
        .strip_prefix("!pip")
        .or_else(|| trimmed.strip_prefix("%pip"))?;
    // `!pipx`, `%pip3` and friends are not ours.
    if rest.chars().next().is_some_and(|c| !c.is_whitespace()) {
        return None;
    }

    let parts: Vec<&str> = rest.split_whitespace().collect();
    let command = match parts.first() {
        Some(&"install") => {
            let packages: Vec<String> = parts[1..]
                .iter()
                .filter(|p| !p.starts_with('-'))
                .map(|p| p.to_string())
                .collect();
            if packages.is_empty() {
                PipCommand::Usage
            } else {
                PipCommand::Install(packages)
            }
        }
        _ => PipCommand::Unsupported,
    };
    Some(CellDirective::Pip(command))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_html() {
        assert_eq!(
            parse_directive("  %%html\n<b>hi</b>\n"),
            Some(CellDirective::Html("\n<b>hi</b>".into()))
        );
        assert_eq!(parse_directive("%%html"), Some(CellDirective::Html(String::new())));
    }

    #[test]
    fn test_parse_pip_install() {
        assert_eq!(
            parse_directive("!pip install pandas numpy"),
            Some(CellDirective::Pip(PipCommand::Install(vec![
                "pandas".into(),
                "numpy".into()
            ])))
        );
        assert_eq!(
            parse_directive("%pip install -q --upgrade seaborn"),
            Some(CellDirective::Pip(PipCommand::Install(vec!["seaborn".into()])))
        );
    }

    #[test]
    fn test_parse_pip_usage() {
        assert_eq!(
            parse_directive("!pip install"),
            Some(CellDirective::Pip(PipCommand::Usage))
        );
        assert_eq!(
            parse_directive("!pip install --quiet"),
            Some(CellDirective::Pip(PipCommand::Usage))
        );
    }

    #[test]
    fn test_parse_pip_unsupported() {
        assert_eq!(
            parse_directive("!pip uninstall pandas"),
            Some(CellDirective::Pip(PipCommand::Unsupported))
        );
        assert_eq!(parse_directive("%pip"), Some(CellDirective::Pip(PipCommand::Unsupported)));
    }

    #[test]
    fn test_non_directive_returns_none() {
        assert_eq!(parse_directive("print('hello')"), None);
        assert_eq!(parse_directive("!pipx install black"), None);
        assert_eq!(parse_directive("x = '%%html'"), None);
    }
}
