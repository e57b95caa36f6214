//! Minimal client for the dispatch protocol.
//!
//! Answers keep-alive pings automatically (unless told not to) and records
//! the server's GoAway notice.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::config::ListenAddress;
use crate::net::Connection;
use crate::rpc::frame::{Frame, FrameError};
use crate::rpc::handler::Reply;

pub struct RpcClient<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    next_id: u32,
    auto_pong: bool,
    goaway: Option<u32>,
}

impl RpcClient<TcpStream> {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

#[cfg(unix)]
impl RpcClient<tokio::net::UnixStream> {
    pub async fn connect_unix(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Self::new(stream))
    }
}

impl RpcClient<Connection> {
    /// Connect to an address in any form the server accepts, including a
    /// bare socket path.
    pub async fn connect_address(address: &ListenAddress) -> io::Result<Self> {
        match address {
            ListenAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Self::new(Connection::new(stream, addr.as_str())))
            }
            #[cfg(unix)]
            ListenAddress::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Self::new(Connection::new(stream, "unix")))
            }
            #[cfg(not(unix))]
            ListenAddress::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }
}

impl<S> RpcClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(reader),
            writer,
            next_id: 0,
            auto_pong: true,
            goaway: None,
        }
    }

    /// Stop answering keep-alive pings.
    pub fn set_auto_pong(&mut self, enabled: bool) {
        self.auto_pong = enabled;
    }

    /// Last call id the server promised to serve, once it has sent GoAway.
    pub fn goaway(&self) -> Option<u32> {
        self.goaway
    }

    /// Send a call without waiting for its reply. Returns the call id.
    pub async fn send_call(&mut self, method: &str, body: impl Into<Vec<u8>>) -> Result<u32, FrameError> {
        self.next_id = self.next_id.wrapping_add(1);
        let frame = Frame::Call {
            id: self.next_id,
            method: method.to_string(),
            body: body.into(),
        };
        frame.write_to(&mut self.writer).await?;
        Ok(self.next_id)
    }

    /// Next frame other than a ping. GoAway frames are recorded and returned.
    pub async fn recv(&mut self) -> Result<Frame, FrameError> {
        loop {
            match Frame::read_from(&mut self.reader).await? {
                Frame::Ping { nonce } => {
                    if self.auto_pong {
                        Frame::Pong { nonce }.write_to(&mut self.writer).await?;
                    }
                }
                Frame::GoAway { last_id } => {
                    self.goaway = Some(last_id);
                    return Ok(Frame::GoAway { last_id });
                }
                frame => return Ok(frame),
            }
        }
    }

    /// Wait for the reply to call `id`, skipping unrelated frames.
    pub async fn wait_reply(&mut self, id: u32) -> Result<Reply, FrameError> {
        loop {
            if let Frame::Reply {
                id: reply_id,
                status,
                body,
            } = self.recv().await?
            {
                if reply_id == id {
                    return Ok(Reply { status, body });
                }
            }
        }
    }

    /// Send a call and wait for its reply.
    pub async fn call(&mut self, method: &str, body: impl Into<Vec<u8>>) -> Result<Reply, FrameError> {
        let id = self.send_call(method, body).await?;
        self.wait_reply(id).await
    }

    /// Read until the server closes the connection.
    pub async fn wait_closed(&mut self) -> Result<(), FrameError> {
        loop {
            match self.recv().await {
                Ok(_) => continue,
                Err(FrameError::Closed) => return Ok(()),
                Err(FrameError::Io(e))
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::BrokenPipe
                            | io::ErrorKind::UnexpectedEof
                    ) =>
                {
                    return Ok(())
                }
                Err(e) => return Err(e),
            }
        }
    }
}
