// Child process supervisor: one thread per external command. Streams both
// output channels into the registry record, forwards termination requests
// drawn from the death level, and decodes the final exit status.

use anyhow::{Result, anyhow};
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use super::registry::{ChildStatus, Registry};
use crate::log_debug;

/// Pause between non-blocking IO drains. Also bounds how fast a raised
/// death level is observed (well inside the 200 ms contract).
const IO_TICK: Duration = Duration::from_millis(20);

/// Startup handshake poll interval.
const HANDSHAKE_POLL: Duration = Duration::from_micros(500);

/// Send a signal to one process.
pub fn send_signal(pid: u32, signal: i32) {
    unsafe {
        libc::kill(pid as i32, signal);
    }
}

/// True while `pid` still exists.
pub fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn set_nonblocking(fd: i32) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

/// Incremental line splitter over a non-blocking pipe.
struct LinePump<R: Read> {
    reader: R,
    pending: Vec<u8>,
    eof: bool,
}

impl<R: Read> LinePump<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            eof: false,
        }
    }

    /// Read whatever is available right now, handing complete lines to the
    /// sink. Returns once the pipe would block or hit EOF.
    fn drain(&mut self, sink: &mut impl FnMut(&str)) {
        if self.eof {
            return;
        }
        let mut buf = [0u8; 4096];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&buf[..n]);
                    while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = self.pending.drain(..=pos).collect();
                        let text = String::from_utf8_lossy(&line[..line.len() - 1]);
                        sink(text.trim_end_matches('\r'));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    self.eof = true;
                    break;
                }
            }
        }
    }

    /// Hand over a trailing line that never got its newline.
    fn flush_partial(&mut self, sink: &mut impl FnMut(&str)) {
        if !self.pending.is_empty() {
            let text = String::from_utf8_lossy(&self.pending).into_owned();
            sink(text.trim_end_matches('\r'));
            self.pending.clear();
        }
    }
}

/// Decoded exit of a child: `(exit_code, error_msg, final_status)`.
pub fn decode_exit(status: ExitStatus) -> (i32, String, ChildStatus) {
    if let Some(signal) = status.signal() {
        return (
            signal,
            format!("Killed by signal {signal}"),
            ChildStatus::Killed,
        );
    }
    let code = status.code().unwrap_or(-1);
    if code == 0 {
        (0, String::new(), ChildStatus::Finished)
    } else {
        (code, format!("Exited with error {code}"), ChildStatus::Killed)
    }
}

/// Launch `argv` under a supervisor thread and return the child's pid once
/// it is registered (in CREATED status). The caller completes the record and
/// flips it to RUNNING; supervision starts after that handshake.
pub fn spawn(registry: &Arc<Registry>, argv: Vec<String>, gid: u32) -> Result<u32> {
    if argv.is_empty() {
        return Err(anyhow!("empty argv"));
    }
    let registry = Arc::clone(registry);
    let (tx, rx) = mpsc::channel::<Result<u32, String>>();

    thread::spawn(move || {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = tx.send(Err(format!("failed to spawn {}: {e}", argv[0])));
                return;
            }
        };
        let pid = child.id();

        if let Err(e) = registry.add(pid, gid) {
            let _ = child.kill();
            let _ = child.wait();
            let _ = tx.send(Err(e));
            return;
        }
        registry.with_record(pid, |r| r.argv = argv.clone());
        let status_cell = registry
            .with_record(pid, |r| r.status_cell())
            .expect("record just added");
        let _ = tx.send(Ok(pid));

        // Startup handshake: the parent finishes the record (stage params,
        // progress path) before we start pumping. A raised death level
        // breaks the wait so the child can still be taken down.
        while status_cell.load(std::sync::atomic::Ordering::SeqCst)
            < ChildStatus::Running as u8
        {
            if registry.read_death() >= 1 {
                break;
            }
            thread::sleep(HANDSHAKE_POLL);
        }

        supervise(&registry, &mut child, pid, &status_cell);
    });

    rx.recv()
        .map_err(|_| anyhow!("supervisor thread died before registering"))?
        .map_err(|e| anyhow!(e))
}

fn supervise(
    registry: &Arc<Registry>,
    child: &mut Child,
    pid: u32,
    status_cell: &super::registry::StatusCell,
) {
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    set_nonblocking(stdout.as_raw_fd());
    set_nonblocking(stderr.as_raw_fd());
    let mut out_pump = LinePump::new(stdout);
    let mut err_pump = LinePump::new(stderr);

    let mut term_sent = false;
    let mut kill_sent = false;

    let status = loop {
        out_pump.drain(&mut |line| registry.append_stdout(pid, line));
        err_pump.drain(&mut |line| registry.append_stderr(pid, line));

        let death = registry.read_death();
        if death >= 1 && !term_sent {
            log_debug!("supervisor: death level {death}, sending TERM to {pid}");
            send_signal(pid, libc::SIGTERM);
            term_sent = true;
        }
        if death >= 4 && !kill_sent {
            log_debug!("supervisor: death level {death}, sending KILL to {pid}");
            send_signal(pid, libc::SIGKILL);
            kill_sent = true;
        }

        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(_) => {
                // The wait channel is gone; treat as signalled death.
                break ExitStatus::from_raw(libc::SIGKILL);
            }
        }
        thread::sleep(IO_TICK);
    };

    // Residual output written between the last drain and exit.
    out_pump.drain(&mut |line| registry.append_stdout(pid, line));
    out_pump.flush_partial(&mut |line| registry.append_stdout(pid, line));
    err_pump.drain(&mut |line| registry.append_stderr(pid, line));
    err_pump.flush_partial(&mut |line| registry.append_stderr(pid, line));

    let (exit_code, error_msg, final_status) = decode_exit(status);
    registry.with_record(pid, |r| {
        r.exit_code = exit_code;
        r.error_msg = error_msg;
    });
    // Lock-free transition: the exit path never blocks on the map lock.
    status_cell.store(final_status as u8, std::sync::atomic::Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit_status(raw: i32) -> ExitStatus {
        ExitStatus::from_raw(raw)
    }

    #[test]
    fn test_decode_clean_exit() {
        let (code, msg, status) = decode_exit(exit_status(0));
        assert_eq!(code, 0);
        assert!(msg.is_empty());
        assert_eq!(status, ChildStatus::Finished);
    }

    #[test]
    fn test_decode_error_exit() {
        // Raw wait status: exit code lives in the high byte.
        let (code, msg, status) = decode_exit(exit_status(3 << 8));
        assert_eq!(code, 3);
        assert_eq!(msg, "Exited with error 3");
        assert_eq!(status, ChildStatus::Killed);
    }

    #[test]
    fn test_decode_signalled_exit() {
        let (code, msg, status) = decode_exit(exit_status(libc::SIGTERM));
        assert_eq!(code, 15);
        assert_eq!(msg, "Killed by signal 15");
        assert_eq!(status, ChildStatus::Killed);
    }

    #[test]
    fn test_line_pump_splits_lines() {
        let mut pump = LinePump::new(std::io::Cursor::new(b"one\ntwo\r\npart".to_vec()));
        let mut lines = Vec::new();
        pump.drain(&mut |l| lines.push(l.to_string()));
        assert_eq!(lines, vec!["one", "two"]);
        pump.flush_partial(&mut |l| lines.push(l.to_string()));
        assert_eq!(lines, vec!["one", "two", "part"]);
    }
}
