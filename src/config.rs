//! Configuration for the presence server, the sandbox pipeline and terminals.

use std::path::PathBuf;
use std::time::Duration;

/// Default presence service port.
pub const DEFAULT_PORT: u16 = 3001;

/// Interval between sweeps for connections whose socket task has gone away.
pub const REAP_INTERVAL_SECS: u64 = 60;

/// Presence server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub reap_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            reap_interval: Duration::from_secs(REAP_INTERVAL_SECS),
        }
    }
}

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a whitespace-separated command line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// What the pipeline does when the install step exits non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallPolicy {
    /// Report an install warning and still start the serve command.
    #[default]
    Continue,
    /// Fail the instance without starting the serve command.
    Halt,
}

/// Install/serve pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub install: CommandSpec,
    pub serve: CommandSpec,
    pub install_policy: InstallPolicy,
    pub ready_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            install: CommandSpec::new("npm", ["install"]),
            serve: CommandSpec::new("npm", ["run", "dev"]),
            install_policy: InstallPolicy::Continue,
            ready_timeout: Duration::from_secs(120),
        }
    }
}

/// Rows/columns hint for an interactive shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TermSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Terminal multiplexer settings.
#[derive(Debug, Clone)]
pub struct TerminalConfig {
    pub shell: CommandSpec,
    pub size: TermSize,
    /// Bytes of output kept per terminal for late-attaching displays.
    pub scrollback_bytes: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: CommandSpec::new("jsh", Vec::<String>::new()),
            size: TermSize::default(),
            scrollback_bytes: 200_000,
        }
    }
}

/// Per-client workspace settings.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceConfig {
    pub pipeline: PipelineConfig,
    pub terminal: TerminalConfig,
}

/// Resource limits applied to every process of the local engine.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Address space in KB, 0 for unlimited.
    pub mem_kb: u64,
    /// Largest writable file in KB, 0 for unlimited.
    pub fsize_kb: u64,
    pub nofile: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            mem_kb: 0,
            fsize_kb: 1_048_576,
            nofile: 4096,
        }
    }
}

/// Host-process engine settings.
#[derive(Debug, Clone)]
pub struct LocalEngineConfig {
    /// Directory under which each instance gets its own root.
    pub base_dir: PathBuf,
    /// Host name used in preview URLs.
    pub preview_host: String,
    pub limits: ResourceLimits,
    /// Time between SIGTERM and SIGKILL when terminating a process.
    pub kill_grace: Duration,
}

impl Default for LocalEngineConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir().join("devroom"),
            preview_host: "localhost".to_string(),
            limits: ResourceLimits::default(),
            kill_grace: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_lines() {
        let spec = CommandSpec::parse("npm run  dev").unwrap();
        assert_eq!(spec, CommandSpec::new("npm", ["run", "dev"]));
        assert_eq!(spec.display(), "npm run dev");
        assert!(CommandSpec::parse("   ").is_none());
    }
}
