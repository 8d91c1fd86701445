//! Reader and writer idle detection.
//!
//! `IdleStream` sits between the transport (plain or TLS) and the HTTP codec
//! and stamps every successful read and write. A watcher task compares the
//! stamps with the configured timeouts:
//!
//! - reader idle: no inbound bytes for the period → the connection is closed
//! - writer idle: no outbound bytes for the period → a heartbeat payload is
//!   queued, provided the channel is currently writable
//!
//! Queued heartbeats are written by the connection task itself, ahead of any
//! later codec output, so bytes are never interleaved.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures_util::task::AtomicWaker;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::IdleConfig;

/// Activity stamps shared by a stream and its watcher.
#[derive(Debug)]
pub struct IdleState {
    epoch: Instant,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    writable: AtomicBool,
    heartbeat: Mutex<Option<Bytes>>,
    read_waker: AtomicWaker,
}

impl IdleState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            writable: AtomicBool::new(true),
            heartbeat: Mutex::new(None),
            read_waker: AtomicWaker::new(),
        })
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch_read(&self) {
        self.last_read_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn touch_write(&self) {
        self.last_write_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    fn last_read(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_read_ms.load(Ordering::Relaxed))
    }

    fn last_write(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_write_ms.load(Ordering::Relaxed))
    }

    /// Whether the last write attempt was accepted by the transport.
    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Relaxed)
    }

    /// Queue a heartbeat and wake the connection task to write it.
    /// Returns `false` when the channel is not writable or one is already queued.
    pub fn queue_heartbeat(&self, payload: Bytes) -> bool {
        if payload.is_empty() || !self.is_writable() {
            return false;
        }
        {
            let mut slot = self.heartbeat.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(payload);
        }
        self.read_waker.wake();
        true
    }
}

/// Transport wrapper recording read/write activity.
#[derive(Debug)]
pub struct IdleStream<S> {
    inner: S,
    state: Arc<IdleState>,
}

impl<S> IdleStream<S> {
    pub fn new(inner: S, state: Arc<IdleState>) -> Self {
        Self { inner, state }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncWrite + Unpin> IdleStream<S> {
    /// Write out any queued heartbeat. `Ready(Ok)` once nothing is pending.
    fn poll_drain_heartbeat(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            let mut slot = self.state.heartbeat.lock();
            let Some(pending) = slot.as_mut() else {
                return Poll::Ready(Ok(()));
            };
            match Pin::new(&mut self.inner).poll_write(cx, pending) {
                Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                Poll::Ready(Ok(n)) => {
                    pending.advance(n);
                    if pending.is_empty() {
                        *slot = None;
                        drop(slot);
                        self.state.touch_write();
                        tracing::trace!("Heartbeat written");
                        return Pin::new(&mut self.inner).poll_flush(cx);
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {
                    self.state.writable.store(false, Ordering::Relaxed);
                    return Poll::Pending;
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for IdleStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.state.read_waker.register(cx.waker());

        // The connection task parks here between requests; that is where a
        // queued heartbeat gets written. A pending write re-wakes us.
        if let Poll::Ready(Err(e)) = this.poll_drain_heartbeat(cx) {
            return Poll::Ready(Err(e));
        }

        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            if buf.filled().len() > before {
                this.state.touch_read();
            }
        }
        result
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for IdleStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.poll_drain_heartbeat(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        match Pin::new(&mut this.inner).poll_write(cx, data) {
            Poll::Ready(Ok(n)) => {
                this.state.writable.store(true, Ordering::Relaxed);
                if n > 0 {
                    this.state.touch_write();
                }
                Poll::Ready(Ok(n))
            }
            Poll::Pending => {
                this.state.writable.store(false, Ordering::Relaxed);
                Poll::Pending
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Timeouts for one connection. `None` disables a side.
#[derive(Debug, Clone, Default)]
pub struct IdlePolicy {
    pub reader_idle: Option<Duration>,
    pub writer_idle: Option<Duration>,
    pub heartbeat: Bytes,
}

impl IdlePolicy {
    pub fn from_config(config: &IdleConfig) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            reader_idle: secs(config.reader_idle_secs),
            writer_idle: secs(config.writer_idle_secs),
            heartbeat: Bytes::from(config.heartbeat_payload.clone()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.reader_idle.is_some() || self.writer_idle.is_some()
    }
}

/// Watch one connection until it closes. Cancels `close` on reader idle.
pub async fn watch_idle(state: Arc<IdleState>, policy: IdlePolicy, close: CancellationToken) {
    if !policy.is_enabled() {
        return;
    }
    loop {
        let read_deadline = policy.reader_idle.map(|d| state.last_read() + d);
        let write_deadline = policy.writer_idle.map(|d| state.last_write() + d);
        let next = match (read_deadline, write_deadline) {
            (Some(r), Some(w)) => r.min(w),
            (Some(r), None) => r,
            (None, Some(w)) => w,
            (None, None) => return,
        };

        tokio::select! {
            _ = close.cancelled() => return,
            _ = tokio::time::sleep_until(next) => {}
        }

        let now = Instant::now();
        if let Some(idle) = policy.reader_idle {
            if now >= state.last_read() + idle {
                tracing::info!(idle_secs = idle.as_secs_f64(), "Reader idle, closing connection");
                close.cancel();
                return;
            }
        }
        if let Some(idle) = policy.writer_idle {
            if now >= state.last_write() + idle {
                let queued = state.queue_heartbeat(policy.heartbeat.clone());
                tracing::debug!(queued, "Writer idle, heartbeat");
                // restart the window either way so a blocked channel is not spun on
                state.touch_write();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn policy(reader_ms: Option<u64>, writer_ms: Option<u64>) -> IdlePolicy {
        IdlePolicy {
            reader_idle: reader_ms.map(Duration::from_millis),
            writer_idle: writer_ms.map(Duration::from_millis),
            heartbeat: Bytes::from_static(b"\r\n"),
        }
    }

    #[tokio::test]
    async fn reader_idle_cancels_connection() {
        let (_client, server) = tokio::io::duplex(64);
        let state = IdleState::new();
        let _stream = IdleStream::new(server, state.clone());
        let close = CancellationToken::new();

        tokio::spawn(watch_idle(state, policy(Some(50), None), close.clone()));
        tokio::time::timeout(Duration::from_secs(2), close.cancelled())
            .await
            .expect("reader idle should close the connection");
    }

    #[tokio::test]
    async fn inbound_bytes_postpone_reader_idle() {
        let (mut client, server) = tokio::io::duplex(64);
        let state = IdleState::new();
        let mut stream = IdleStream::new(server, state.clone());
        let close = CancellationToken::new();
        tokio::spawn(watch_idle(state, policy(Some(200), None), close.clone()));

        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            while stream.read(&mut buf).await.map(|n| n > 0).unwrap_or(false) {}
        });
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(80)).await;
            client.write_all(b"x").await.unwrap();
        }
        assert!(!close.is_cancelled());
    }

    #[tokio::test]
    async fn writer_idle_sends_heartbeat() {
        let (mut client, server) = tokio::io::duplex(64);
        let state = IdleState::new();
        let mut stream = IdleStream::new(server, state.clone());
        let close = CancellationToken::new();
        tokio::spawn(watch_idle(state, policy(None, Some(50)), close.clone()));

        // parked reader, as a codec waiting for the next request would be
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let _ = stream.read(&mut buf).await;
        });

        let mut beat = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut beat))
            .await
            .expect("heartbeat expected")
            .unwrap();
        assert_eq!(&beat, b"\r\n");
        close.cancel();
    }

    #[test]
    fn heartbeat_not_queued_twice() {
        let state = IdleState::new();
        assert!(state.queue_heartbeat(Bytes::from_static(b"\r\n")));
        assert!(!state.queue_heartbeat(Bytes::from_static(b"\r\n")));
        assert!(!IdleState::new().queue_heartbeat(Bytes::new()));
    }

    #[test]
    fn zero_seconds_disables() {
        let p = IdlePolicy::from_config(&IdleConfig {
            reader_idle_secs: 0,
            writer_idle_secs: 30,
            heartbeat_payload: "\r\n".into(),
        });
        assert!(p.reader_idle.is_none());
        assert_eq!(p.writer_idle, Some(Duration::from_secs(30)));
    }
}
