// Copyright 2025 New Vector Ltd.
//
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Element-Commercial
// Please see LICENSE files in the repository root for full details.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream which replays some bytes already read from the underlying stream
/// before reading from it again.
///
/// Writes always go to the underlying stream.
#[derive(Debug)]
pub struct Rewind<T> {
    pre: Option<Bytes>,
    inner: T,
}

impl<T> Rewind<T> {
    #[must_use]
    pub const fn new(inner: T) -> Self {
        Self { pre: None, inner }
    }

    #[must_use]
    pub fn new_buffered(inner: T, pre: Bytes) -> Self {
        let pre = (!pre.is_empty()).then_some(pre);
        Self { pre, inner }
    }

    /// Push some bytes back in front of the ones not yet read
    pub fn rewind(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }

        self.pre = Some(match self.pre.take() {
            Some(rest) => {
                let mut buf = BytesMut::with_capacity(bytes.len() + rest.len());
                buf.extend_from_slice(&bytes);
                buf.extend_from_slice(&rest);
                buf.freeze()
            }
            None => bytes,
        });
    }

    /// The bytes which will be replayed before reading from the underlying
    /// stream
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        self.pre.as_deref().unwrap_or_default()
    }

    /// Get back the underlying stream, along with the bytes not replayed yet
    #[must_use]
    pub fn into_inner(self) -> (T, Bytes) {
        (self.inner, self.pre.unwrap_or_default())
    }
}

impl<T> AsyncRead for Rewind<T>
where
    T: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(mut pre) = self.pre.take() {
            // A zero-sized read would give the impression of an EOF
            if buf.remaining() == 0 {
                self.pre = Some(pre);
                return Poll::Ready(Ok(()));
            }

            let len = std::cmp::min(pre.len(), buf.remaining());
            buf.put_slice(&pre[..len]);
            pre.advance(len);
            if !pre.is_empty() {
                self.pre = Some(pre);
            }

            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T> AsyncWrite for Rewind<T>
where
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn replays_prefix_before_inner_stream() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut stream = Rewind::new_buffered(server, Bytes::from_static(b"hello "));

        client.write_all(b"world").await.unwrap();
        drop(client);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn partial_reads_keep_the_rest_of_the_prefix() {
        let (_client, server) = tokio::io::duplex(64);
        let mut stream = Rewind::new(server);
        stream.rewind(Bytes::from_static(b"cdef"));
        stream.rewind(Bytes::from_static(b"ab"));
        assert_eq!(stream.buffered(), b"abcdef");

        let mut buf = [0; 4];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        assert_eq!(stream.buffered(), b"ef");

        let (_inner, rest) = stream.into_inner();
        assert_eq!(&rest[..], b"ef");
    }

    #[tokio::test]
    async fn writes_go_to_the_inner_stream() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut stream = Rewind::new_buffered(server, Bytes::from_static(b"unread"));
        stream.write_all(b"pong").await.unwrap();

        let mut buf = [0; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(stream.buffered(), b"unread");
    }
}
