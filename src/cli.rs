use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: String,
    pub args: Vec<String>,
    pub workspace: PathBuf,
    pub query: Option<String>,
    pub timeout: Duration,
    pub attempts: usize,
}

#[derive(Parser, Debug)]
#[command(name = "lsp-session")]
#[command(about = "Run the LSP handshake against a language server and shut it down", long_about = None)]
pub struct Cli {
    /// Server executable, e.g. rust-analyzer
    pub server: String,

    /// Arguments passed to the server
    #[arg(last = true)]
    pub args: Vec<String>,

    /// Workspace root (defaults to the current directory)
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Run a workspace/symbol query after initialization
    #[arg(short, long)]
    pub query: Option<String>,

    /// Per-request timeout in seconds
    #[arg(short, long, default_value_t = 30)]
    pub timeout: u64,

    /// How often to retry the symbol query while the server is still indexing
    #[arg(long, default_value_t = 10)]
    pub attempts: usize,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Tracing filter for the requested verbosity.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }

    pub fn into_config(self) -> Config {
        let workspace = self.workspace.unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        });
        Config {
            server: self.server,
            args: self.args,
            workspace,
            query: self.query,
            timeout: Duration::from_secs(self.timeout),
            attempts: self.attempts.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_and_trailing_args() {
        let cli = Cli::parse_from([
            "lsp-session",
            "-q",
            "main",
            "-vv",
            "rust-analyzer",
            "--",
            "--log-file",
            "ra.log",
        ]);
        assert_eq!(cli.log_filter(), "debug");

        let config = cli.into_config();
        assert_eq!(config.server, "rust-analyzer");
        assert_eq!(config.args, vec!["--log-file", "ra.log"]);
        assert_eq!(config.query.as_deref(), Some("main"));
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_explicit_workspace_and_timeout() {
        let cli = Cli::parse_from(["lsp-session", "-w", "/tmp/ws", "-t", "5", "pylsp"]);
        assert_eq!(cli.log_filter(), "warn");
        let config = cli.into_config();
        assert_eq!(config.workspace, PathBuf::from("/tmp/ws"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert!(config.args.is_empty());
    }
}
