/// TCP shard transport and a minimal shard server speaking the frame protocol
use super::codec::{FrameCodec, Reply, Request};
use super::store::ShardStore;
use super::{FindReply, FindRequest, InsertRequest, ShardConnector, ShardLink, WriteStatus};
use crate::core::ShardInfo;
use async_trait::async_trait;
use bytes::BytesMut;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Opens TCP links to shard endpoints
#[derive(Debug, Clone)]
pub struct TcpShardConnector {
    keepalive: Duration,
}

impl TcpShardConnector {
    pub fn new(keepalive: Duration) -> Self {
        Self { keepalive }
    }

    /// Configure a shard stream for request/response traffic
    fn configure_stream(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        let keepalive = TcpKeepalive::new().with_time(self.keepalive);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        Ok(())
    }
}

impl Default for TcpShardConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl ShardConnector for TcpShardConnector {
    async fn connect(&self, shard: &ShardInfo) -> io::Result<Box<dyn ShardLink>> {
        debug!("Connecting to shard {} at {}", shard.id, shard.endpoint);
        let stream = TcpStream::connect(shard.endpoint.as_str()).await?;

        if let Err(e) = self.configure_stream(&stream) {
            warn!("Failed to configure stream to shard {}: {}", shard.id, e);
        }

        Ok(Box::new(TcpLink {
            stream,
            buf: BytesMut::with_capacity(8192),
        }))
    }
}

/// One TCP connection to a shard
pub struct TcpLink {
    stream: TcpStream,
    buf: BytesMut,
}

impl TcpLink {
    async fn round_trip(&mut self, request: &Request) -> io::Result<Reply> {
        FrameCodec::write_message(&mut self.stream, request).await?;
        match FrameCodec::read_message(&mut self.stream, &mut self.buf).await? {
            Some(reply) => Ok(reply),
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "shard closed connection",
            )),
        }
    }
}

fn unexpected(reply: Reply) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected reply from shard: {:?}", reply),
    )
}

#[async_trait]
impl ShardLink for TcpLink {
    async fn find(&mut self, request: &FindRequest) -> io::Result<FindReply> {
        match self.round_trip(&Request::Find(request.clone())).await? {
            Reply::Find(reply) => Ok(reply),
            Reply::Error { message } => Ok(FindReply::Error { message }),
            other => Err(unexpected(other)),
        }
    }

    async fn insert(&mut self, request: &InsertRequest) -> io::Result<()> {
        FrameCodec::write_message(&mut self.stream, &Request::Insert(request.clone())).await
    }

    async fn last_write_status(&mut self) -> io::Result<WriteStatus> {
        match self.round_trip(&Request::LastWrite).await? {
            Reply::WriteStatus(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }
}

/// Serves a `ShardStore` over the frame protocol
pub struct ShardServer {
    store: Arc<ShardStore>,
}

impl ShardServer {
    pub fn new(store: Arc<ShardStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<ShardStore> {
        Arc::clone(&self.store)
    }

    /// Create a TCP listener on the specified address
    pub async fn bind(&self, listen_addr: &str) -> io::Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Shard listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections until the future is dropped.
    ///
    /// Connection tasks are owned by this future; dropping it closes every
    /// client connection, which is how tests simulate a shard going down.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    let _ = stream.set_nodelay(true);
                    debug!("Accepted router connection from {}", addr);
                    connections.spawn(handle_connection(stream, addr, Arc::clone(&self.store)));
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        warn!("Shard connection task failed: {}", e);
                    }
                }
            }
        }
    }
}

/// Serve one router connection. The last-write record is scoped to it.
async fn handle_connection(mut stream: TcpStream, addr: SocketAddr, store: Arc<ShardStore>) {
    let mut buf = BytesMut::with_capacity(8192);
    let mut last_write = WriteStatus::NoWrite;

    loop {
        let request: Request = match FrameCodec::read_message(&mut stream, &mut buf).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                debug!("Connection from {} ended: {}", addr, e);
                if e.kind() == io::ErrorKind::InvalidData {
                    let reply = Reply::Error {
                        message: e.to_string(),
                    };
                    let _ = FrameCodec::write_message(&mut stream, &reply).await;
                }
                break;
            }
        };

        let reply = match request {
            Request::Find(find) => Reply::Find(store.find(&find).await),
            Request::Insert(insert) => {
                last_write = store.insert(&insert).await;
                continue;
            }
            Request::LastWrite => Reply::WriteStatus(last_write.clone()),
        };

        if let Err(e) = FrameCodec::write_message(&mut stream, &reply).await {
            debug!("Failed to reply to {}: {}", addr, e);
            break;
        }
    }

    debug!("Closed router connection from {}", addr);
}
