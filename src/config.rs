use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default wait between SIGTERM and SIGKILL when tearing a session down.
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;

const DEFAULT_TERM: &str = "xterm-256color";

/// Daemon configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Unix socket to listen on. Defaults to [`crate::server::default_socket_path`].
    pub socket_path: Option<PathBuf>,
    /// Command spawned for every session.
    #[serde(default)]
    pub shell: ShellConfig,
    /// Seconds a session's process gets to exit after SIGTERM.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

/// The command spawned on the slave side of each session's pty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Program to run. Falls back to `$SHELL`, then `/bin/sh`.
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Value of `TERM` in the child's environment.
    #[serde(default = "default_term")]
    pub term: String,
}

fn default_grace_period_secs() -> u64 {
    DEFAULT_GRACE_PERIOD_SECS
}

fn default_term() -> String {
    DEFAULT_TERM.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: None,
            shell: ShellConfig::default(),
            grace_period_secs: DEFAULT_GRACE_PERIOD_SECS,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: Vec::new(),
            term: default_term(),
        }
    }
}

impl ShellConfig {
    /// A shell config that runs `program` with `args`.
    pub fn command(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: Some(program.into()),
            args: args.iter().map(|a| a.to_string()).collect(),
            term: default_term(),
        }
    }

    /// Resolve the program to spawn.
    pub fn program(&self) -> String {
        self.program.clone().unwrap_or_else(|| {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
        })
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        check_config_permissions(path);

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(crate::server::default_socket_path)
    }
}

/// `<config dir>/ish/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ish").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Warn if the config file is writable by other users.
///
/// The file names the program every session runs, so anyone who can
/// edit it controls what the daemon spawns.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_writable(mode) {
        tracing::warn!(
            "config file {} is world-writable (mode {:o}); consider restricting it to 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-writable bit set.
pub fn is_world_writable(mode: u32) -> bool {
    mode & 0o002 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.socket_path.is_none());
        assert!(config.shell.program.is_none());
        assert!(config.shell.args.is_empty());
        assert_eq!(config.shell.term, "xterm-256color");
        assert_eq!(config.grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            socket_path = "/run/user/1000/ish.sock"
            grace_period_secs = 2

            [shell]
            program = "/bin/bash"
            args = ["--noprofile", "--norc"]
            term = "vt100"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.socket_path(), PathBuf::from("/run/user/1000/ish.sock"));
        assert_eq!(config.grace_period(), Duration::from_secs(2));
        assert_eq!(config.shell.program(), "/bin/bash");
        assert_eq!(config.shell.args, vec!["--noprofile", "--norc"]);
        assert_eq!(config.shell.term, "vt100");
    }

    #[test]
    fn shell_command_helper() {
        let shell = ShellConfig::command("/bin/sh", &["-c", "exit 0"]);
        assert_eq!(shell.program(), "/bin/sh");
        assert_eq!(shell.args, vec!["-c", "exit 0"]);
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "grace_period_secs = \"soon\"").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn load_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "grace_period_secs = 1\n").unwrap();

        let config = Config::load(&path).unwrap().unwrap();
        assert_eq!(config.grace_period_secs, 1);
    }

    #[test]
    fn world_writable_modes() {
        assert!(is_world_writable(0o666));
        assert!(is_world_writable(0o777));
        assert!(!is_world_writable(0o644));
        assert!(!is_world_writable(0o600));
    }
}
