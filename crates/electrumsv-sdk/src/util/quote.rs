//! Command line quoting for shells and terminal launchers

use crate::error::SupervisionError;

/// POSIX-shell quoted command line
pub fn shell_join<'a>(words: impl IntoIterator<Item = &'a str>) -> Result<String, SupervisionError> {
    shlex::try_join(words).map_err(|e| SupervisionError::Payload(e.to_string()))
}

/// Escape `s` for use inside an AppleScript string literal
pub fn applescript_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// `tell application "Terminal" to do script "<command>"`
pub fn terminal_do_script(command: &str) -> String {
    format!(
        "tell application \"Terminal\" to do script \"{}\"",
        applescript_escape(command)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_join_quotes_spaces() {
        let joined = shell_join(["/opt/sdk runner", "inline", "--command", "abc"]).unwrap();
        assert_eq!(joined, "'/opt/sdk runner' inline --command abc");
    }

    #[test]
    fn test_applescript_escape() {
        assert_eq!(applescript_escape(r#"say "hi" \ bye"#), r#"say \"hi\" \\ bye"#);
        let script = terminal_do_script("'/a b' inline");
        assert_eq!(script, "tell application \"Terminal\" to do script \"'/a b' inline\"");
    }
}
