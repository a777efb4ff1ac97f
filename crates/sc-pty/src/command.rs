use std::path::PathBuf;

use portable_pty::CommandBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{PtyError, Result};

/// What to run inside a pseudo-terminal.
///
/// The child inherits the server's environment; `env` entries are layered
/// on top and `term` (when set) becomes `TERM`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PtyCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub term: Option<String>,
}

impl PtyCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.term = Some(term.into());
        self
    }

    /// Locate the executable, honouring a `PATH` override in `env`.
    ///
    /// Fails with [`PtyError::Spawn`] before any pty is allocated, so a typo
    /// in the configured shell never leaves a half-built terminal behind.
    pub fn resolve_program(&self) -> Result<PathBuf> {
        if self.program.is_empty() {
            return Err(PtyError::Spawn("empty program name".into()));
        }
        let cwd = self
            .cwd
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));
        let search_path = self
            .env
            .iter()
            .rev()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone())
            .or_else(|| std::env::var("PATH").ok());

        which::which_in(&self.program, search_path, cwd)
            .map_err(|e| PtyError::Spawn(format!("{}: {e}", self.program)))
    }

    pub(crate) fn to_builder(&self) -> Result<CommandBuilder> {
        let program = self.resolve_program()?;
        let mut builder = CommandBuilder::new(program);
        builder.args(&self.args);
        for (k, v) in &self.env {
            builder.env(k, v);
        }
        if let Some(term) = &self.term {
            builder.env("TERM", term);
        }
        if let Some(cwd) = &self.cwd {
            builder.cwd(cwd);
        }
        Ok(builder)
    }
}
