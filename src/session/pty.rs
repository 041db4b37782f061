use std::io::{Read, Write};
use std::sync::Mutex;

use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use tokio::sync::{broadcast, watch};

pub const PTY_COLS: u16 = 120;
pub const PTY_ROWS: u16 = 40;

/// One agent process inside a PTY.
///
/// A single persistent reader task drains the master side into a broadcast
/// channel; every downstream consumer (rolling buffer, translator,
/// raw-terminal WebSockets) subscribes instead of cloning readers.
pub struct PtyHandle {
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    writer: Mutex<Box<dyn Write + Send>>,
    output_tx: broadcast::Sender<Vec<u8>>,
    exited_rx: watch::Receiver<bool>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Open a PTY and spawn `cmd` inside it. The reader task starts
    /// immediately; output produced before any subscriber attaches is
    /// dropped (the rolling buffer subscribes before the first byte can
    /// arrive in practice).
    pub fn spawn(cmd: CommandBuilder, cols: u16, rows: u16) -> anyhow::Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let child = pair.slave.spawn_command(cmd)?;
        let pid = child.process_id();
        drop(pair.slave);

        // Writer can only be taken once.
        let writer = pair.master.take_writer()?;
        let reader = pair.master.try_clone_reader()?;

        let (output_tx, _) = broadcast::channel::<Vec<u8>>(256);
        let (exited_tx, exited_rx) = watch::channel(false);

        let tx_for_reader = output_tx.clone();
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        // No subscribers is fine — bytes are dropped.
                        let _ = tx_for_reader.send(buf[..n].to_vec());
                    }
                    Err(_) => break,
                }
            }
            let _ = exited_tx.send(true);
        });

        Ok(Self {
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            writer: Mutex::new(writer),
            output_tx,
            exited_rx,
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output_tx.subscribe()
    }

    /// Resolves once the PTY closes (child exited and output drained).
    pub async fn wait_exit(&self) {
        let mut rx = self.exited_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn has_exited(&self) -> bool {
        *self.exited_rx.borrow()
    }

    pub fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.write_all(bytes)?;
        writer.flush()
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let master = self.master.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = master.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            tracing::debug!(error = %e, "PTY resize failed");
        }
    }

    /// Terminate the child. The reader task observes EOF and flips the
    /// exit watch, which drives session cleanup.
    pub fn kill(&self) {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = child.kill() {
            // Expected when the child already exited.
            tracing::trace!(error = %e, "PTY child kill");
        }
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        let child = self.child.get_mut().unwrap_or_else(|e| e.into_inner());
        let _ = child.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_command(script: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.arg("-c");
        cmd.arg(script);
        cmd
    }

    #[tokio::test]
    async fn output_reaches_subscribers_and_exit_is_observed() {
        let pty = PtyHandle::spawn(shell_command("echo pty-roundtrip"), 80, 24).unwrap();
        let mut rx = pty.subscribe();

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv()).await {
                Ok(Ok(chunk)) => {
                    collected.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&collected).contains("pty-roundtrip") {
                        break;
                    }
                }
                Ok(Err(_)) => break,
                Err(_) => {}
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("pty-roundtrip"));

        tokio::time::timeout(std::time::Duration::from_secs(5), pty.wait_exit())
            .await
            .unwrap();
        assert!(pty.has_exited());
    }

    #[tokio::test]
    async fn write_reaches_child_stdin() {
        let pty = PtyHandle::spawn(shell_command("read line; echo got:$line"), 80, 24).unwrap();
        let mut rx = pty.subscribe();
        pty.write(b"hello\n").unwrap();

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv()).await {
                Ok(Ok(chunk)) => {
                    collected.extend_from_slice(&chunk);
                    if String::from_utf8_lossy(&collected).contains("got:hello") {
                        break;
                    }
                }
                Ok(Err(_)) => break,
                Err(_) => {}
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("got:hello"));
    }

    #[tokio::test]
    async fn kill_forces_exit() {
        let pty = PtyHandle::spawn(shell_command("sleep 300"), 80, 24).unwrap();
        pty.kill();
        tokio::time::timeout(std::time::Duration::from_secs(5), pty.wait_exit())
            .await
            .unwrap();
    }
}
