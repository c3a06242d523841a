//! Client API communication stub implementation.

use std::net::SocketAddr;

use crate::utils::{ViewstampError, safe_tcp_read, tcp_write_obj};
use crate::server::{ApiRequest, ApiReply};
use crate::client::ClientId;

use bytes::BytesMut;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::io::AsyncWriteExt;

/// Client API connection stub to one server.
pub struct ClientApiStub {
    /// My client ID.
    id: ClientId,

    /// Address of the server connected to.
    addr: SocketAddr,

    /// Read-half split of the TCP connection stream.
    conn_read: OwnedReadHalf,

    /// Write-half split of the TCP connection stream.
    conn_write: OwnedWriteHalf,

    /// Buffer for partially read replies.
    read_buf: BytesMut,
}

impl ClientApiStub {
    /// Connects to the given server address and introduces myself with my
    /// client ID.
    pub async fn connect(
        id: ClientId,
        addr: SocketAddr,
    ) -> Result<Self, ViewstampError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_u64(id).await?; // send my client ID

        let (conn_read, conn_write) = stream.into_split();
        Ok(ClientApiStub {
            id,
            addr,
            conn_read,
            conn_write,
            read_buf: BytesMut::with_capacity(8 + 1024),
        })
    }

    #[inline]
    pub fn id(&self) -> ClientId {
        self.id
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends a request to the established server connection.
    pub async fn send_req(
        &mut self,
        req: &ApiRequest,
    ) -> Result<(), ViewstampError> {
        tcp_write_obj(req, &mut self.conn_write).await
    }

    /// Receives a reply from the established server connection. Safe to use
    /// as a `tokio::select!` branch.
    pub async fn recv_reply(&mut self) -> Result<ApiReply, ViewstampError> {
        safe_tcp_read(&mut self.read_buf, &mut self.conn_read).await
    }
}
