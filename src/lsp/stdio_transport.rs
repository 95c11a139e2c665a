//! Runs a language server as a child process and talks to it over stdio.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

use crate::lsp::session::{Session, SessionBuilder};

/// A spawned server whose stdin and stdout have not been handed out yet.
pub struct StdioServer {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl StdioServer {
    /// Spawn `program` with piped stdin/stdout. The server's stderr is inherited.
    ///
    /// The process is killed if the returned value, or the `Child` obtained
    /// from [`StdioServer::connect`], is dropped.
    pub fn spawn<I, S>(program: impl AsRef<OsStr>, args: I, cwd: Option<&Path>) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program.as_ref());
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        debug!(program = ?program.as_ref(), pid = ?child.id(), "spawned server");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "failed to take child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "failed to take child stdout"))?;

        Ok(StdioServer {
            child,
            stdin,
            stdout,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Start a session over the server's stdio.
    pub fn connect(self, builder: SessionBuilder) -> (Session, Child) {
        let session = builder.connect(self.stdout, self.stdin);
        (session, self.child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::lifecycle::SessionPhase;
    use crate::lsp::registry::MethodRegistry;

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = StdioServer::spawn("lsp-session-no-such-server", ["--stdio"], None);
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_closes_server_stdin() {
        let server = StdioServer::spawn("cat", std::iter::empty::<&str>(), None).unwrap();
        let (session, mut child) = server.connect(SessionBuilder::new(MethodRegistry::lsp()));

        session.exit().await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Exited);

        // `cat` only exits once its stdin is closed.
        let status = tokio::time::timeout(std::time::Duration::from_secs(10), child.wait()).await;
        assert!(matches!(status, Ok(Ok(_))));
    }
}
