use crate::error::KeelResult;
use crate::protocol::KeelProtocolWrite;
use crate::quote::sq_quote;
use crate::repo::KEEL_OBJECT_DIRECTORY_ENV;
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

pub const DEFAULT_TCP_PORT: u16 = 9418;
/// overrides the remote-shell runner, default `ssh`
pub const SSH_ENV: &str = "KEEL_SSH";
/// names a proxy filter program for tcp connections
pub const PROXY_ENV: &str = "KEEL_PROXY_COMMAND";

/// where a location string says the peer lives
#[derive(Debug, Clone, PartialEq)]
pub enum Location {
    /// bare path: spawn the peer program locally
    Local { path: String },
    /// `host:path` or `ssh://host/path`: via the remote shell
    RemoteShell { host: String, path: String },
    /// `tcp://host[:port]/path`
    Tcp { host: String, port: u16, path: String },
}

impl Location {
    /// parses `scheme://host[:port]/path`, `host:path` (implicit remote
    /// shell), or a bare path (local)
    pub fn parse(url: &str) -> KeelResult<Location> {
        if let Some((scheme, rest)) = url.split_once("://") {
            let (host, path) = match rest.find('/') {
                Some(idx) => (&rest[..idx], &rest[idx..]),
                None => bail!("no path specified in `{}`", url),
            };
            ensure!(!host.is_empty(), "no host specified in `{}`", url);
            ensure!(!path.is_empty(), "no path specified in `{}`", url);
            return match scheme {
                "ssh" => Ok(Location::RemoteShell {
                    host: host.to_owned(),
                    path: path.to_owned(),
                }),
                "tcp" | "keel" => {
                    let (host, port) = match host.rsplit_once(':') {
                        Some((host, port)) => (host, port.parse()?),
                        None => (host, DEFAULT_TCP_PORT),
                    };
                    Ok(Location::Tcp {
                        host: host.to_owned(),
                        port,
                        path: path.to_owned(),
                    })
                }
                _ => bail!("unhandled protocol `{}`", scheme),
            };
        }

        // `host:path` is an implicit remote shell unless the colon is part of
        // a path that exists locally
        if let Some((host, path)) = url.split_once(':') {
            if !host.is_empty() && !std::path::Path::new(url).exists() {
                return Ok(Location::RemoteShell { host: host.to_owned(), path: path.to_owned() });
            }
        }

        ensure!(!url.is_empty(), "no path specified");
        Ok(Location::Local { path: url.to_owned() })
    }
}

pin_project! {
    /// duplex byte channel over a child process's piped stdio
    pub struct ChildStream {
        #[pin]
        stdin: ChildStdin,
        #[pin]
        stdout: ChildStdout,
    }
}

impl AsyncRead for ChildStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stdout.poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().stdin.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stdin.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stdin.poll_shutdown(cx)
    }
}

pin_project! {
    #[project = StreamProj]
    enum Stream {
        Child { #[pin] stream: ChildStream },
        Tcp { #[pin] stream: TcpStream },
    }
}

pin_project! {
    /// an established duplex channel to a peer plus the handle to await its
    /// termination; tcp peers have no local process to reap
    pub struct Connection {
        #[pin]
        stream: Stream,
        child: Option<Child>,
    }
}

impl Connection {
    fn from_child(mut child: Child) -> KeelResult<Self> {
        let stdin = child.stdin.take().expect("child stdin must be piped");
        let stdout = child.stdout.take().expect("child stdout must be piped");
        Ok(Self { stream: Stream::Child { stream: ChildStream { stdin, stdout } }, child: Some(child) })
    }

    /// waits for the subprocess peer to terminate; interrupted waits are
    /// retried by the runtime. the stream is closed first so a peer blocked on
    /// its stdin sees EOF.
    pub async fn finish(self) -> KeelResult<()> {
        let Self { stream, child } = self;
        drop(stream);
        if let Some(mut child) = child {
            let status = child.wait().await?;
            ensure!(status.success(), "peer exited with status {}", status);
        }
        Ok(())
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project().stream.project() {
            StreamProj::Child { stream } => stream.poll_read(cx, buf),
            StreamProj::Tcp { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project().stream.project() {
            StreamProj::Child { stream } => stream.poll_write(cx, buf),
            StreamProj::Tcp { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project().stream.project() {
            StreamProj::Child { stream } => stream.poll_flush(cx),
            StreamProj::Tcp { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project().stream.project() {
            StreamProj::Child { stream } => stream.poll_shutdown(cx),
            StreamProj::Tcp { stream } => stream.poll_shutdown(cx),
        }
    }
}

fn spawn_piped(command: &mut Command) -> KeelResult<Child> {
    // the object-directory override propagates to the child
    if let Ok(objdir) = std::env::var(KEEL_OBJECT_DIRECTORY_ENV) {
        command.env(KEEL_OBJECT_DIRECTORY_ENV, objdir);
    }
    Ok(command.stdin(Stdio::piped()).stdout(Stdio::piped()).spawn()?)
}

/// establishes a duplex byte channel to the peer named by `location`,
/// speaking to `prog` on the other side
pub async fn connect(location: &str, prog: &str) -> KeelResult<Connection> {
    match Location::parse(location)? {
        Location::Local { path } => {
            debug!("connect: spawning local peer `{} {}`", prog, path);
            Connection::from_child(spawn_piped(Command::new(prog).arg(&path))?)
        }
        Location::RemoteShell { host, path } => {
            let ssh = std::env::var(SSH_ENV).unwrap_or_else(|_| "ssh".to_owned());
            // the remote end gets a single shell word, so the path is quoted
            let command = format!("{} {}", prog, sq_quote(&path));
            debug!("connect: spawning `{} {} {}`", ssh, host, command);
            Connection::from_child(spawn_piped(Command::new(&ssh).arg(&host).arg(&command))?)
        }
        Location::Tcp { host, port, path } => {
            let mut conn = match std::env::var(PROXY_ENV) {
                Ok(proxy) => {
                    // the proxy program inherits the connected pipes and is
                    // handed `host port` to do its own dialing
                    debug!("connect: via proxy `{} {} {}`", proxy, host, port);
                    Connection::from_child(spawn_piped(
                        Command::new(&proxy).arg(&host).arg(port.to_string()),
                    )?)?
                }
                Err(..) => {
                    debug!("connect: tcp {}:{}", host, port);
                    let stream = TcpStream::connect((host.as_str(), port)).await?;
                    Connection { stream: Stream::Tcp { stream }, child: None }
                }
            };
            // one framed greeting tells the peer which program to run and where
            conn.write_packet(format!("{} {}\n", prog, path).as_bytes()).await?;
            Ok(conn)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeelResult;
    use crate::protocol::KeelProtocolRead;

    #[test]
    fn parse_locations() -> KeelResult<()> {
        assert_eq!(
            Location::parse("/some/local/path")?,
            Location::Local { path: "/some/local/path".to_owned() }
        );
        assert_eq!(
            Location::parse("example.com:/srv/repo")?,
            Location::RemoteShell { host: "example.com".to_owned(), path: "/srv/repo".to_owned() }
        );
        assert_eq!(
            Location::parse("ssh://example.com/srv/repo")?,
            Location::RemoteShell { host: "example.com".to_owned(), path: "/srv/repo".to_owned() }
        );
        assert_eq!(
            Location::parse("tcp://example.com/srv/repo")?,
            Location::Tcp {
                host: "example.com".to_owned(),
                port: DEFAULT_TCP_PORT,
                path: "/srv/repo".to_owned()
            }
        );
        assert_eq!(
            Location::parse("tcp://example.com:1234/srv/repo")?,
            Location::Tcp {
                host: "example.com".to_owned(),
                port: 1234,
                path: "/srv/repo".to_owned()
            }
        );
        Ok(())
    }

    #[test]
    fn parse_rejects_pathless_urls() {
        assert!(Location::parse("tcp://example.com").is_err());
        assert!(Location::parse("").is_err());
    }

    // `cat -` echoes stdin, standing in for a peer on piped stdio
    #[tokio::test]
    async fn local_transport_round_trips_through_a_subprocess() -> KeelResult<()> {
        let mut conn = connect("-", "cat").await?;
        conn.write_packet(b"ping\n").await?;
        conn.write_flush_packet().await?;
        assert_eq!(conn.recv_packet().await?, b"ping\n");
        assert_eq!(conn.recv_packet().await?, b"");
        // dropping the stream closes the peer's stdin so it can exit
        conn.finish().await
    }
}
