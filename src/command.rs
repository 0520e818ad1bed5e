//! A single program invocation and its captured result.

/// Captured result of an executed [`Command`].
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Immutable description of a program invocation. Outputs are write-once:
/// a command that already carries a result must not be executed again; build
/// a new one instead.
#[derive(Debug, Clone)]
pub struct Command {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    output: Option<CommandOutput>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            output: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    pub fn stdin_payload(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Shell-quoted `program arg1 arg2 ...` line, for transports that execute
    /// through a remote shell.
    pub fn full_command(&self) -> String {
        let mut line = sh_quote(&self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&sh_quote(arg));
        }
        line
    }

    /// Record the execution result. Panics if a result was already recorded:
    /// re-executing a finished command is a contract violation.
    pub fn record(&mut self, status: i32, stdout: String, stderr: String) {
        if self.output.is_some() {
            panic!(
                "command '{}' was executed twice; construct a new Command instead",
                self.program
            );
        }
        self.output = Some(CommandOutput {
            status,
            stdout,
            stderr,
        });
    }

    pub fn is_finished(&self) -> bool {
        self.output.is_some()
    }

    pub fn status(&self) -> Option<i32> {
        self.output.as_ref().map(|o| o.status)
    }

    pub fn succeeded(&self) -> bool {
        self.status() == Some(0)
    }

    pub fn stdout(&self) -> &str {
        self.output.as_ref().map(|o| o.stdout.as_str()).unwrap_or("")
    }

    pub fn stderr(&self) -> &str {
        self.output.as_ref().map(|o| o.stderr.as_str()).unwrap_or("")
    }
}

/// Quote a string for POSIX shells. Plain words pass through unchanged.
pub fn sh_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':' | b'=' | b'@' | b'+' | b',')
        });
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_command_quotes_arguments() {
        let cmd = Command::new("tar")
            .args(["-cjp", "-f"])
            .arg("/archive/7-my site_2024.tar.bz2");
        assert_eq!(
            cmd.full_command(),
            "tar -cjp -f '/archive/7-my site_2024.tar.bz2'"
        );
    }

    #[test]
    fn test_sh_quote_escapes_single_quotes() {
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("/var/www"), "/var/www");
    }

    #[test]
    fn test_outputs_are_write_once() {
        let mut cmd = Command::new("true");
        assert!(!cmd.is_finished());
        cmd.record(0, String::new(), String::new());
        assert!(cmd.succeeded());
    }

    #[test]
    #[should_panic(expected = "executed twice")]
    fn test_recording_twice_panics() {
        let mut cmd = Command::new("true");
        cmd.record(0, String::new(), String::new());
        cmd.record(0, String::new(), String::new());
    }

    #[test]
    fn test_nonzero_status_is_data() {
        let mut cmd = Command::new("false");
        cmd.record(1, String::new(), String::new());
        assert_eq!(cmd.status(), Some(1));
        assert!(!cmd.succeeded());
    }
}
