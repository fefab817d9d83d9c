//! Command description handed to the process launcher

use std::env;
use std::ffi::{OsStr, OsString};

/// Terminal type advertised to the child
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Program, arguments and environment overrides for the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Build from command-line arguments (without the relay's own name).
    ///
    /// The first argument is the program; with no arguments the user's
    /// shell is used. `TERM` is set to [`DEFAULT_TERM`].
    pub fn from_args<I>(args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        let mut args = args.into_iter().map(Into::into);
        let program = args.next().unwrap_or_else(default_shell);
        Self::new(program).args(args).env("TERM", DEFAULT_TERM)
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Override one environment variable, replacing an earlier override
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        let key = key.into();
        self.env.retain(|(k, _)| !same_key(k, &key));
        self.env.push((key, value.into()));
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn env_overrides(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    /// The child's full environment: the parent's, with overrides applied
    pub fn environment(&self) -> Vec<(OsString, OsString)> {
        let mut vars: Vec<(OsString, OsString)> = env::vars_os()
            .filter(|(k, _)| !self.env.iter().any(|(o, _)| same_key(k, o)))
            .collect();
        vars.extend(self.env.iter().cloned());
        vars
    }

    /// Effective value of one variable in the child's environment
    pub fn env_value(&self, key: &str) -> Option<OsString> {
        let key = OsStr::new(key);
        self.env
            .iter()
            .find(|(k, _)| same_key(k, key))
            .map(|(_, v)| v.clone())
            .or_else(|| env::var_os(key))
    }

    /// Program and arguments joined into a Windows command line, quoted the
    /// way the MSVC runtime splits it back into `argv`.
    pub fn command_line(&self) -> String {
        let mut line = String::new();
        quote_arg(&self.program.to_string_lossy(), &mut line);
        for arg in &self.args {
            line.push(' ');
            quote_arg(&arg.to_string_lossy(), &mut line);
        }
        line
    }
}

/// How the child and the backend agent are tied together
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnFlags {
    /// Shut the backend agent down as soon as the child's exit is recorded
    pub auto_shutdown: bool,
    /// Hang up on a still-running child when the session is torn down
    pub exit_after_shutdown: bool,
}

impl Default for SpawnFlags {
    fn default() -> Self {
        Self {
            auto_shutdown: true,
            exit_after_shutdown: true,
        }
    }
}

/// The user's shell
pub fn default_shell() -> OsString {
    #[cfg(windows)]
    let (var, fallback) = ("COMSPEC", "cmd.exe");
    #[cfg(not(windows))]
    let (var, fallback) = ("SHELL", "/bin/sh");

    env::var_os(var)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| OsString::from(fallback))
}

fn same_key(a: &OsStr, b: &OsStr) -> bool {
    if cfg!(windows) {
        a.to_string_lossy().eq_ignore_ascii_case(&b.to_string_lossy())
    } else {
        a == b
    }
}

fn quote_arg(arg: &str, out: &mut String) {
    let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '\n', '\x0b', '"']);
    if !needs_quotes {
        out.push_str(arg);
        return;
    }

    out.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
}
