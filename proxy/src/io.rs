use bytes::Bytes;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Any duplex byte stream a tunnel can run over.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

pub type BoxedIo = Box<dyn TunnelIo>;

pin_project! {
    /// A duplex stream with bytes handed back in front of it. Head parsing
    /// over-reads from the socket; the surplus comes in as `rewound` and is
    /// drained first, so readers see the stream exactly as if parsing had
    /// stopped at the header terminator. Writes are never buffered.
    pub struct RewindStream<S> {
        #[pin]
        inner: S,
        rewound: Bytes,
    }
}

impl<S> RewindStream<S> {
    pub fn new(inner: S, rewound: Bytes) -> Self {
        Self { inner, rewound }
    }
}

impl<S: TunnelIo + 'static> RewindStream<S> {
    pub fn boxed(self) -> BoxedIo {
        Box::new(self)
    }
}

impl<S: AsyncRead> AsyncRead for RewindStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        dst: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.rewound.is_empty() {
            let take = this.rewound.len().min(dst.remaining());
            let chunk = this.rewound.split_to(take);
            dst.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, dst)
    }
}

impl<S: AsyncWrite> AsyncWrite for RewindStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn replays_buffer_before_inner() {
        let (mut near, far) = tokio::io::duplex(64);
        near.write_all(b" world").await.unwrap();

        let mut stream = RewindStream::new(far, Bytes::from_static(b"hello"));
        let mut out = vec![0u8; 11];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[tokio::test]
    async fn partial_reads_drain_the_rewound_bytes() {
        let (_near, far) = tokio::io::duplex(64);
        let mut stream = RewindStream::new(far, Bytes::from_static(b"abcdef"));

        let mut first = [0u8; 4];
        stream.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"abcd");

        let mut second = [0u8; 2];
        stream.read_exact(&mut second).await.unwrap();
        assert_eq!(&second, b"ef");
    }

    #[tokio::test]
    async fn writes_bypass_buffer() {
        let (mut near, far) = tokio::io::duplex(64);
        let mut stream = RewindStream::new(far, Bytes::from_static(b"unread"));
        stream.write_all(b"ping").await.unwrap();

        let mut out = vec![0u8; 4];
        near.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");
    }
}
