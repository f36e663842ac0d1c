//! Helpers for building remote shell command lines.

/// Quote a value for a POSIX shell using single quotes.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | '='))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Prefix `command` with a directory change when a working directory is given.
pub fn in_directory(command: &str, working_directory: Option<&str>) -> String {
    match working_directory.map(str::trim).filter(|dir| !dir.is_empty()) {
        Some(dir) => format!("cd {} && {}", quote(dir), command),
        None => command.to_string(),
    }
}
