//! PTY Channel (spec §4.1 / C1).
//!
//! Wraps one child process bound to a pseudo-terminal. Generalizes the
//! teacher's `ProcessManager`, which only ever spawned a login shell, into a
//! channel that spawns an arbitrary command (the Builder/Reviewer CLIs) and
//! exposes output as a broadcast stream instead of a Tauri event directly —
//! callers (the Prompt Matcher, the Tauri event bridge) subscribe
//! independently, so this module has no Tauri dependency at all.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, mpsc, watch, Notify};

#[cfg(unix)]
use libc;

use super::error::PtyError;

/// Stateful UTF-8 decoder that handles split multi-byte sequences.
///
/// When reading from a PTY in 4096-byte chunks, a multi-byte UTF-8 character
/// can be split across chunk boundaries. This buffers incomplete trailing
/// sequences and prepends them to the next chunk.
pub(crate) struct Utf8Decoder {
    incomplete: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self {
            incomplete: Vec::with_capacity(4),
        }
    }

    pub fn decode(&mut self, input: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.incomplete);
        data.extend_from_slice(input);

        let valid_up_to = Self::find_valid_boundary(&data);

        if valid_up_to < data.len() {
            self.incomplete = data[valid_up_to..].to_vec();
        }

        String::from_utf8(data[..valid_up_to].to_vec())
            .unwrap_or_else(|_| String::from_utf8_lossy(&data[..valid_up_to]).into_owned())
    }

    fn find_valid_boundary(data: &[u8]) -> usize {
        match std::str::from_utf8(data) {
            Ok(_) => data.len(),
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_none() {
                    valid
                } else {
                    valid + e.error_len().unwrap_or(1)
                }
            }
        }
    }
}

/// Options for spawning a PTY-backed child process.
#[derive(Debug, Clone, Default)]
pub struct PtySpawnOptions {
    pub cmd: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

/// Bounded capacity of the output broadcast channel. A slow/absent subscriber
/// only loses the oldest buffered chunks (`broadcast::error::RecvError::Lagged`);
/// it never blocks the reader thread.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

struct Inner {
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child_pid: i32,
    #[cfg(unix)]
    pgid: i32,
    shutdown: Arc<Notify>,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    output_tx: broadcast::Sender<Arc<[u8]>>,
    exit_tx: watch::Sender<Option<i32>>,
    closed: AtomicBool,
}

/// One PTY-backed child process. Cheaply `Clone`-able (an `Arc` wrapper), so
/// it can be shared between the owning `Session`, the Prompt Matcher's
/// subscription, and a Tauri event-forwarding task.
#[derive(Clone)]
pub struct PtyChannel {
    inner: Arc<Inner>,
}

impl PtyChannel {
    /// Spawns the child process inside a fresh PTY. Mirrors the teacher's
    /// `spawn_shell`: a dedicated OS thread blocks on `reader.read()` (PTY
    /// reads are not natively async) and forwards chunks into the broadcast
    /// channel; a second dedicated thread drains an FIFO write queue so
    /// `write()` itself never blocks the caller.
    pub fn start(opts: PtySpawnOptions) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::spawn_failed(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(&opts.cmd);
        cmd.args(&opts.args);
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }
        if let Some(ref dir) = opts.cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::spawn_failed(format!("failed to spawn {}: {e}", opts.cmd)))?;

        let child_pid = child
            .process_id()
            .map(|pid| pid as i32)
            .ok_or_else(|| PtyError::spawn_failed("could not obtain child pid"))?;

        #[cfg(unix)]
        let pgid = pair.master.process_group_leader().unwrap_or(child_pid);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::spawn_failed(format!("failed to take pty writer: {e}")))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::spawn_failed(format!("failed to clone pty reader: {e}")))?;

        let shutdown = Arc::new(Notify::new());
        let (output_tx, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, _) = watch::channel(None);

        // Writer thread: drains the FIFO queue so `write()` never blocks.
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let mut writer = writer;
        let writer_handle = std::thread::Builder::new()
            .name("pty-writer".to_string())
            .spawn(move || {
                while let Some(bytes) = writer_rx.blocking_recv() {
                    if let Err(e) = writer.write_all(&bytes).and_then(|_| writer.flush()) {
                        log::debug!("pty writer error: {e}");
                        break;
                    }
                }
            })
            .map_err(|e| PtyError::spawn_failed(format!("failed to spawn writer thread: {e}")))?;

        // Reader thread: dropping master/writer EOFs the fd, which is the
        // normal way this thread exits (see `kill`). Once the fd EOFs — for
        // any reason, a deliberate kill or the CLI exiting on its own — the
        // child is reaped right here on this already-blocking OS thread,
        // exactly as a waitpid-after-EOF reap would be done without portable-pty
        // in between, so `exit_tx` always carries the real wait status rather
        // than a value synthesized by whoever happened to call `kill()`.
        let reader_output_tx = output_tx.clone();
        let reader_exit_tx = exit_tx.clone();
        let shutdown_reader = shutdown.clone();
        let mut child = child;
        let reader_handle = std::thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk: Arc<[u8]> = Arc::from(&buf[..n]);
                            // No subscribers is a normal, non-fatal state.
                            let _ = reader_output_tx.send(chunk);
                        }
                        Err(e) => {
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            log::debug!("pty reader error: {e}");
                            break;
                        }
                    }
                }
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        log::warn!("failed to reap child: {e}");
                        -1
                    }
                };
                let _ = reader_exit_tx.send(Some(code));
                shutdown_reader.notify_one();
            })
            .map_err(|e| PtyError::spawn_failed(format!("failed to spawn reader thread: {e}")))?;

        drop(pair.slave);

        let inner = Arc::new(Inner {
            writer_tx,
            master: Mutex::new(pair.master),
            child_pid,
            #[cfg(unix)]
            pgid,
            shutdown,
            reader_handle: Mutex::new(Some(reader_handle)),
            writer_handle: Mutex::new(Some(writer_handle)),
            output_tx,
            exit_tx,
            closed: AtomicBool::new(false),
        });

        log::info!(
            "spawned pty channel (cmd={}, pid={child_pid})",
            opts.cmd
        );

        Ok(Self { inner })
    }

    /// Subscribes to raw output chunks. Multiple independent subscribers are
    /// supported (e.g. the Prompt Matcher and the Tauri event bridge).
    pub fn subscribe_output(&self) -> broadcast::Receiver<Arc<[u8]>> {
        self.inner.output_tx.subscribe()
    }

    /// Watches for the channel's exit. Resolves to `Some(code)` once, stays
    /// there for any later subscriber (a `watch` channel remembers its last
    /// value), matching "Emits: `exit(code)` once".
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<i32>> {
        self.inner.exit_tx.subscribe()
    }

    /// Writes bytes to the child's stdin. Never blocks: if the channel has
    /// already exited, the write is dropped and logged rather than erroring,
    /// matching "write after exit is discarded (logged)".
    pub fn write(&self, data: &[u8]) {
        if self.inner.closed.load(Ordering::Acquire) {
            log::debug!("write after close discarded ({} bytes)", data.len());
            return;
        }
        if self.inner.writer_tx.send(data.to_vec()).is_err() {
            log::debug!("write after writer thread exit discarded ({} bytes)", data.len());
        }
    }

    /// Resizes the PTY, propagating SIGWINCH to the child.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = self
            .inner
            .master
            .lock()
            .map_err(|e| PtyError::resize_failed(format!("master lock poisoned: {e}")))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::resize_failed(format!("resize failed: {e}")))
    }

    pub fn child_pid(&self) -> i32 {
        self.inner.child_pid
    }

    /// Terminates the channel: SIGTERM the process group, wait up to 3s,
    /// escalate to SIGKILL, then join both background threads.
    pub async fn kill(&self) -> Result<(), PtyError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(()); // already killed; idempotent
        }

        let pid = self.inner.child_pid;

        #[cfg(unix)]
        {
            let pgid = self.inner.pgid;
            let term_result = unsafe { libc::kill(-pgid, libc::SIGTERM) };
            if term_result != 0 {
                log::warn!(
                    "failed to SIGTERM pgid={pgid}: {}",
                    std::io::Error::last_os_error()
                );
            }

            let exited = tokio::time::timeout(std::time::Duration::from_secs(3), async {
                loop {
                    let result = unsafe { libc::kill(pid, 0) };
                    if result != 0 {
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            })
            .await;

            if exited.is_err() {
                let kill_result = unsafe { libc::kill(-pgid, libc::SIGKILL) };
                if kill_result != 0 {
                    log::warn!(
                        "failed to SIGKILL pgid={pgid}: {}",
                        std::io::Error::last_os_error()
                    );
                }
                log::warn!("pid={pid} pgid={pgid} required SIGKILL");
            }
        }

        #[cfg(windows)]
        {
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .output();
        }

        self.inner.shutdown.notify_one();

        let reader_handle = self
            .inner
            .reader_handle
            .lock()
            .map_err(|e| log::warn!("reader handle lock poisoned: {e}"))
            .ok()
            .and_then(|mut h| h.take());
        if let Some(handle) = reader_handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        // Dropping the writer sender closes the writer thread's recv loop.
        let writer_handle = self
            .inner
            .writer_handle
            .lock()
            .map_err(|e| log::warn!("writer handle lock poisoned: {e}"))
            .ok()
            .and_then(|mut h| h.take());
        if let Some(handle) = writer_handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        // The reader thread reaps the child and sends the real exit status
        // to `exit_tx` once its read loop EOFs above, so nothing further
        // needs to be sent here.
        log::info!("killed pty channel pid={pid}");
        Ok(())
    }
}
