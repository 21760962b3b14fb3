use parking_lot::Mutex;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
const DEFAULT_MAX_IDLE: usize = 1024;

/// Free list of fixed-size relay buffers.
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    free: Mutex<Vec<Box<[u8]>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self::with_max_idle(buffer_size, DEFAULT_MAX_IDLE)
    }

    pub fn with_max_idle(buffer_size: usize, max_idle: usize) -> Self {
        Self {
            buffer_size,
            max_idle,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    /// Checks a buffer out. It goes back to the pool when the guard drops.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size].into_boxed_slice());

        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut free = self.free.lock();
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }
}

pub struct PooledBuffer {
    buf: Box<[u8]>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.put(buf);
    }
}

/// Bytes moved by a finished tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_target: u64,
    pub target_to_client: u64,
}

/// Relays bytes between `client` and `target` until either direction ends.
///
/// Each direction runs in its own task with its own pooled buffer. The first
/// direction to finish (EOF or error) cancels the other; both tasks are joined
/// before the halves are dropped, which closes both connections.
pub async fn relay<C, T>(client: C, target: T, pool: &Arc<BufferPool>) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (target_read, target_write) = tokio::io::split(target);
    let done = CancellationToken::new();

    let upstream = tokio::spawn(pipe(
        client_read,
        target_write,
        pool.get(),
        done.clone(),
        "client->target",
    ));
    let downstream = tokio::spawn(pipe(
        target_read,
        client_write,
        pool.get(),
        done.clone(),
        "target->client",
    ));

    let (up, down) = tokio::join!(upstream, downstream);

    RelayStats {
        client_to_target: up.unwrap_or_default(),
        target_to_client: down.unwrap_or_default(),
    }
}

async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    mut buf: PooledBuffer,
    done: CancellationToken,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;

    tokio::select! {
        result = copy(&mut reader, &mut writer, &mut buf, &mut copied) => {
            if let Err(e) = result {
                if !is_expected_error(&e) {
                    debug!("Relay {} ended with error: {}", direction, e);
                }
            }
        }
        _ = done.cancelled() => {}
    }

    done.cancel();
    let _ = writer.shutdown().await;

    copied
}

async fn copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    copied: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let n = reader.read(buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *copied += n as u64;
    }
}

pub fn is_expected_error(e: &io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}
