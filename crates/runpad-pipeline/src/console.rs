use std::io::{self, Write};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::OwnedMutexGuard;

type Sink = Box<dyn Write + Send>;

/// Standard output shared between the host and the programs it runs.
///
/// Host code writes through [`Console::writer`] and always reaches the host
/// sink. [`Console::redirect`] opens an exclusive capture scope for one run:
/// only writers handed out by that [`Redirect`] land in its buffer, and a
/// second redirect waits until the first is dropped.
#[derive(Clone)]
pub struct Console {
    inner: Arc<ConsoleInner>,
}

struct ConsoleInner {
    sink: Mutex<Sink>,
    redirect_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Console {
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(ConsoleInner {
                sink: Mutex::new(Box::new(sink)),
                redirect_lock: Arc::new(tokio::sync::Mutex::new(())),
            }),
        }
    }

    /// Console backed by the process's real stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    /// The console shared by every manager in this process.
    pub fn process() -> Self {
        static PROCESS: OnceLock<Console> = OnceLock::new();
        PROCESS.get_or_init(Console::stdout).clone()
    }

    /// Writer onto the host sink. Output written here never lands in a
    /// run's captured output, even while a redirect is alive.
    pub fn writer(&self) -> ConsoleWriter {
        ConsoleWriter {
            target: Target::Host(self.clone()),
        }
    }

    /// Open a capture scope that lasts until the returned guard is dropped.
    pub async fn redirect(&self) -> Redirect {
        let guard = Arc::clone(&self.inner.redirect_lock).lock_owned().await;
        tracing::trace!("stdout redirected");
        Redirect {
            buffer: CaptureBuffer::default(),
            _guard: guard,
        }
    }

    /// True while a [`Redirect`] is alive.
    pub fn is_redirected(&self) -> bool {
        self.inner.redirect_lock.try_lock().is_err()
    }

    fn sink(&self) -> MutexGuard<'_, Sink> {
        self.inner
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("redirected", &self.is_redirected())
            .finish()
    }
}

/// `io::Write` handle given to hosts and programs.
#[derive(Clone, Debug)]
pub struct ConsoleWriter {
    target: Target,
}

#[derive(Clone, Debug)]
enum Target {
    Host(Console),
    Capture(CaptureBuffer),
}

impl Write for ConsoleWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.target {
            Target::Host(console) => console.sink().write(buf),
            Target::Capture(buffer) => buffer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.target {
            Target::Host(console) => console.sink().flush(),
            Target::Capture(buffer) => buffer.flush(),
        }
    }
}

/// Shared in-memory sink.
#[derive(Clone, Default, Debug)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Exclusive capture scope for one run.
///
/// Dropping the guard releases the console for the next run, on every exit
/// path. Writers taken from a dropped guard keep writing into its detached
/// buffer and never reach the host.
pub struct Redirect {
    buffer: CaptureBuffer,
    _guard: OwnedMutexGuard<()>,
}

impl Redirect {
    /// Writer bound to this scope's capture buffer.
    pub fn writer(&self) -> ConsoleWriter {
        ConsoleWriter {
            target: Target::Capture(self.buffer.clone()),
        }
    }

    /// Everything written through [`Redirect::writer`] so far.
    pub fn captured(&self) -> String {
        self.buffer.contents()
    }
}

impl Drop for Redirect {
    fn drop(&mut self) {
        tracing::trace!("stdout redirect released");
    }
}
