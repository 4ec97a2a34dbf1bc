use std::io::{BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const MAX_LINE_CHARS: usize = 4096;
const MAX_KEPT_LINES: usize = 2000;

/// True if `pid` names a live process (including ones owned by another user).
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as i32, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        true
    }
}

pub fn current_pid() -> u32 {
    std::process::id()
}

/// Start `argv` in a new session with stdio detached; returns the child pid.
pub fn spawn_detached(argv: &[String]) -> Result<u32> {
    let (prog, args) = argv
        .split_first()
        .ok_or_else(|| Error::msg("cannot spawn an empty command"))?;
    let mut cmd = Command::new(prog);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    let child = cmd
        .spawn()
        .map_err(|e| Error::msg(format!("failed to spawn {prog}: {e}")))?;
    Ok(child.id())
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<String>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn last_stdout_line(&self) -> Option<&str> {
        self.stdout
            .iter()
            .rev()
            .map(String::as_str)
            .find(|l| !l.trim().is_empty())
    }

    pub fn tail(&self, lines: usize) -> String {
        let start = self.stdout.len().saturating_sub(lines);
        self.stdout[start..].join("\n")
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Run `argv` in its own process group, logging its output as it arrives.
///
/// The whole group is killed once `timeout` elapses; the returned output then
/// has `timed_out` set. Only stdout lines are kept in the result.
pub fn run_captured(label: &str, argv: &[String], timeout: Duration) -> Result<CommandOutput> {
    let (prog, args) = argv
        .split_first()
        .ok_or_else(|| Error::msg(format!("{label}: command is not configured")))?;
    let mut cmd = Command::new(prog);
    cmd.args(args);

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("{label}: spawn of {prog} failed: {e}")))?;
    let pgid = child.id();
    tracing::debug!(hook = label, pid = pgid, "command started");

    let (tx, rx) = mpsc::channel::<(Stream, String)>();
    if let Some(out) = child.stdout.take() {
        let tx = tx.clone();
        std::thread::spawn(move || read_lines(out, Stream::Stdout, tx));
    }
    if let Some(err) = child.stderr.take() {
        let tx = tx.clone();
        std::thread::spawn(move || read_lines(err, Stream::Stderr, tx));
    }
    drop(tx);

    let deadline = Instant::now() + timeout;
    let mut out = CommandOutput::default();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((stream, line)) => {
                let line = sanitize_line(&line);
                if line.is_empty() {
                    continue;
                }
                match stream {
                    Stream::Stdout => {
                        tracing::debug!(hook = label, "{line}");
                        if out.stdout.len() >= MAX_KEPT_LINES {
                            out.stdout.remove(0);
                        }
                        out.stdout.push(line);
                    }
                    Stream::Stderr => tracing::debug!(hook = label, stream = "stderr", "{line}"),
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(hook = label, timeout_secs = timeout.as_secs(), "command timed out");
                kill_pgroup(pgid, false);
                kill_pgroup(pgid, true);
                out.timed_out = true;
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = child
        .wait()
        .map_err(|e| Error::msg(format!("{label}: wait failed: {e}")))?;
    out.exit_code = status.code();
    tracing::debug!(hook = label, exit_code = ?out.exit_code, "command finished");
    Ok(out)
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative pid targets the process group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

fn read_lines<R: Read>(reader: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>) {
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::with_capacity(512);

    let flush = |pending: &mut Vec<u8>| {
        let line = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        tx.send((stream, line)).is_ok()
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                if !pending.is_empty() && !flush(&mut pending) {
                    return;
                }
            } else {
                pending.push(b);
                if pending.len() >= MAX_LINE_CHARS * 4 && !flush(&mut pending) {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        flush(&mut pending);
    }
}

/// Strip ANSI escape sequences and control/bidi characters from one line of
/// child output, truncating very long lines.
pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut chars = input.chars().peekable();
    let mut kept = 0usize;

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.next() {
                // CSI: parameters until a final byte in '@'..='~'.
                Some('[') => {
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC / DCS / SOS / PM / APC: until BEL or ST.
                Some(']' | 'P' | 'X' | '^' | '_') => {
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }
        let c = if c == '\t' { ' ' } else { c };
        if c.is_control() || is_bidi_control(c) {
            continue;
        }
        out.push(c);
        kept += 1;
        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
