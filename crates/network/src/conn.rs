//! Connection and listener wrappers.
//!
//! A [`Conn`] is a raw backend stream plus the identity information parsed
//! from its endpoint addresses. Reads, writes and shutdown pass straight
//! through; nothing here is a protocol layer.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use corelib::{Addr, NetworkType, PublicKey};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::backend::{RawConn, RawListener};
use crate::error::{NetworkError, Result};

/// A connection between two nodes.
pub struct Conn {
    inner: Box<dyn RawConn>,
    local: Addr,
    remote: Addr,
    network: NetworkType,
}

impl Conn {
    /// Wraps a raw connection, parsing both of its endpoint addresses.
    ///
    /// On error the raw connection is dropped, which closes it.
    pub fn wrap(inner: Box<dyn RawConn>, network: NetworkType) -> Result<Self> {
        let local = Addr::parse(&inner.local_addr())?;
        let remote = Addr::parse(&inner.remote_addr())?;
        Ok(Self {
            inner,
            local,
            remote,
            network,
        })
    }

    pub fn local_pk(&self) -> PublicKey {
        self.local.pk
    }

    pub fn remote_pk(&self) -> PublicKey {
        self.remote.pk
    }

    pub fn local_port(&self) -> u16 {
        self.local.port
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port
    }

    pub fn local_addr(&self) -> Addr {
        self.local
    }

    pub fn remote_addr(&self) -> Addr {
        self.remote
    }

    /// Backend type the connection was made through.
    pub fn network(&self) -> NetworkType {
        self.network
    }

    /// Unwraps the raw backend stream.
    pub fn into_inner(self) -> Box<dyn RawConn> {
        self.inner
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("network", &self.network)
            .field("local", &self.local.to_string())
            .field("remote", &self.remote.to_string())
            .finish()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A listener bound to a local port on one backend.
pub struct Listener {
    inner: Box<dyn RawListener>,
    local: Addr,
    network: NetworkType,
}

impl Listener {
    /// Wraps a raw listener, parsing its local address.
    pub fn wrap(inner: Box<dyn RawListener>, network: NetworkType) -> Result<Self> {
        let local = Addr::parse(&inner.addr())?;
        Ok(Self {
            inner,
            local,
            network,
        })
    }

    pub fn local_pk(&self) -> PublicKey {
        self.local.pk
    }

    pub fn local_port(&self) -> u16 {
        self.local.port
    }

    pub fn local_addr(&self) -> Addr {
        self.local
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    /// Waits for the next inbound connection and wraps it.
    pub async fn accept_conn(&self) -> Result<Conn> {
        let raw = self
            .inner
            .accept()
            .await
            .map_err(|source| NetworkError::Accept {
                network: self.network,
                source,
            })?;
        Conn::wrap(raw, self.network)
    }

    /// Stops accepting connections.
    pub async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|source| NetworkError::Close {
                network: self.network,
                source,
            })
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("network", &self.network)
            .field("local", &self.local.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::KeyPair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct Fixed {
        stream: DuplexStream,
        local: String,
        remote: String,
    }

    impl AsyncRead for Fixed {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for Fixed {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().stream).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
        }
    }

    impl RawConn for Fixed {
        fn local_addr(&self) -> String {
            self.local.clone()
        }

        fn remote_addr(&self) -> String {
            self.remote.clone()
        }
    }

    fn fixed(stream: DuplexStream, local: String, remote: String) -> Box<dyn RawConn> {
        Box::new(Fixed {
            stream,
            local,
            remote,
        })
    }

    #[tokio::test]
    async fn test_wrap_parses_both_ends() {
        let a = KeyPair::generate().public_key();
        let b = KeyPair::generate().public_key();
        let (left, mut right) = tokio::io::duplex(64);

        let mut conn = Conn::wrap(
            fixed(left, format!("{}:50000", a), format!("{}:10", b)),
            NetworkType::Mesh,
        )
        .unwrap();
        assert_eq!(conn.local_pk(), a);
        assert_eq!(conn.local_port(), 50000);
        assert_eq!(conn.remote_pk(), b);
        assert_eq!(conn.remote_port(), 10);
        assert_eq!(conn.network(), NetworkType::Mesh);

        conn.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn test_wrap_failure_closes_raw_conn() {
        let a = KeyPair::generate().public_key();
        let (left, mut right) = tokio::io::duplex(64);

        let res = Conn::wrap(
            fixed(left, format!("{}:1", a), "garbage".to_string()),
            NetworkType::Direct,
        );
        assert!(matches!(res, Err(NetworkError::Addr(_))));

        // The other half sees EOF once the raw connection is gone.
        let mut buf = Vec::new();
        assert_eq!(right.read_to_end(&mut buf).await.unwrap(), 0);
    }
}
