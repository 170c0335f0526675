use std::io::{self, Write};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::anyhow;
use bytes::Bytes;
use runpad_pipeline::ConsoleWriter;
use tokio::io::AsyncWrite;
use wasmtime_wasi::cli::{IsTerminal, StdoutStream};
use wasmtime_wasi::p2::{OutputStream, Pollable, StreamError, StreamResult};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{WasiCtxBuilder, async_trait};

/// Largest single write a program is offered.
const WRITE_PERMIT: usize = 64 * 1024;

/// Per-invocation WASI state.
///
/// A fresh `WasiState` is created for each run, so programs never see state
/// left behind by an earlier run.
///
/// Sandbox:
/// - No filesystem preopens
/// - No host environment variables
/// - stdout streamed into the run's console writer, up to a byte limit;
///   stderr discarded
pub struct WasiState {
    pub(crate) wasi: WasiP1Ctx,
    stdout: ConsoleStdout,
}

impl WasiState {
    pub fn new(program_name: &str, args: &[String], stdout: ConsoleStdout) -> Self {
        let mut builder = WasiCtxBuilder::new();
        builder.stdout(stdout.clone());
        builder.arg(program_name);
        for arg in args {
            builder.arg(arg);
        }
        Self {
            wasi: builder.build_p1(),
            stdout,
        }
    }

    /// True once the program tried to write past its stdout limit.
    pub fn stdout_exceeded(&self) -> bool {
        self.stdout.limit.exceeded.load(Ordering::Acquire)
    }
}

/// WASI stdout that writes straight through to a [`ConsoleWriter`].
///
/// Bytes reach the writer as soon as the program writes them, so output
/// survives a trap or a cancelled run. Writing past `capacity` bytes stores
/// what still fits and then traps the program.
#[derive(Clone)]
pub struct ConsoleStdout {
    writer: ConsoleWriter,
    limit: Arc<StdoutLimit>,
}

struct StdoutLimit {
    capacity: usize,
    written: AtomicUsize,
    exceeded: AtomicBool,
}

impl ConsoleStdout {
    pub fn new(writer: ConsoleWriter, capacity: usize) -> Self {
        Self {
            writer,
            limit: Arc::new(StdoutLimit {
                capacity,
                written: AtomicUsize::new(0),
                exceeded: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.limit.capacity
    }

    fn write_limited(&mut self, buf: &[u8]) -> Result<(), StdoutError> {
        let written = self.limit.written.load(Ordering::Acquire);
        let room = self.limit.capacity.saturating_sub(written);
        let accepted = buf.len().min(room);
        self.writer.write_all(&buf[..accepted])?;
        self.limit.written.fetch_add(accepted, Ordering::AcqRel);
        if accepted < buf.len() {
            self.limit.exceeded.store(true, Ordering::Release);
            return Err(StdoutError::Exceeded(self.limit.capacity));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum StdoutError {
    #[error("stdout exceeded {0} bytes")]
    Exceeded(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl IsTerminal for ConsoleStdout {
    fn is_terminal(&self) -> bool {
        false
    }
}

impl StdoutStream for ConsoleStdout {
    fn p2_stream(&self) -> Box<dyn OutputStream> {
        Box::new(self.clone())
    }

    fn async_stream(&self) -> Box<dyn AsyncWrite + Send + Sync> {
        Box::new(self.clone())
    }
}

#[async_trait]
impl OutputStream for ConsoleStdout {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.write_limited(&bytes).map_err(|e| match e {
            StdoutError::Exceeded(_) => StreamError::Trap(anyhow!(e)),
            StdoutError::Io(e) => StreamError::LastOperationFailed(e.into()),
        })
    }

    fn flush(&mut self) -> StreamResult<()> {
        self.writer
            .flush()
            .map_err(|e| StreamError::LastOperationFailed(e.into()))
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_PERMIT)
    }
}

#[async_trait]
impl Pollable for ConsoleStdout {
    async fn ready(&mut self) {}
}

impl AsyncWrite for ConsoleStdout {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = self.get_mut().write_limited(buf).map(|()| buf.len());
        Poll::Ready(result.map_err(|e| match e {
            StdoutError::Io(e) => e,
            other => io::Error::other(other),
        }))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.get_mut().writer.flush())
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runpad_pipeline::{CaptureBuffer, Console};

    #[tokio::test]
    async fn writes_pass_through_until_the_limit() {
        let console = Console::new(io::sink());
        let redirect = console.redirect().await;
        let mut stdout = ConsoleStdout::new(redirect.writer(), 5);

        OutputStream::write(&mut stdout, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(redirect.captured(), "abc");

        let err = OutputStream::write(&mut stdout, Bytes::from_static(b"defg")).unwrap_err();
        assert!(matches!(err, StreamError::Trap(_)));
        assert_eq!(redirect.captured(), "abcde");
        assert!(stdout.limit.exceeded.load(Ordering::Acquire));
    }

    #[test]
    fn exact_fit_is_not_an_overflow() {
        let buffer = CaptureBuffer::default();
        let console = Console::new(buffer.clone());
        let mut stdout = ConsoleStdout::new(console.writer(), 4);

        OutputStream::write(&mut stdout, Bytes::from_static(b"four")).unwrap();
        assert_eq!(stdout.check_write().unwrap(), WRITE_PERMIT);
        assert_eq!(buffer.contents(), "four");
        assert!(!stdout.limit.exceeded.load(Ordering::Acquire));
    }
}
