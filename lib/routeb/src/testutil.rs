//! Scripted serial-port double for session-level tests: answers known
//! command lines from a script and lets tests feed unsolicited lines.

use crate::config::Config;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct ScriptState {
    /// Bytes waiting to be read by the module's reader thread.
    feed: Vec<u8>,
    /// Per-command canned answers, consumed on first match.
    answers: Vec<(String, Vec<u8>)>,
    /// Every complete command line received, in order.
    commands: Vec<String>,
    /// Partially received command bytes.
    partial: Vec<u8>,
}

pub(crate) struct ScriptReader {
    state: Arc<Mutex<ScriptState>>,
}

pub(crate) struct ScriptWriter {
    state: Arc<Mutex<ScriptState>>,
}

/// Test-side handle: feed unsolicited lines, inspect received commands.
#[derive(Clone)]
pub(crate) struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl Read for ScriptReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.state.lock().unwrap();

            if !state.feed.is_empty() {
                let count = state.feed.len().min(buf.len());
                buf[..count].copy_from_slice(&state.feed[..count]);
                state.feed.drain(..count);
                return Ok(count);
            }
        }

        thread::sleep(Duration::from_millis(2));
        Err(io::ErrorKind::TimedOut.into())
    }
}

impl Write for ScriptWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.partial.extend_from_slice(buf);

        while let Some(pos) = state
            .partial
            .windows(2)
            .position(|pair| pair == b"\r\n")
        {
            let raw: Vec<u8> = state.partial.drain(..pos + 2).collect();
            let line = String::from_utf8_lossy(&raw[..pos]).into_owned();

            // Echo the command back the way the module does.
            state.feed.extend_from_slice(&raw);

            if let Some(found) = state.answers.iter().position(|(cmd, _)| *cmd == line) {
                let (_, answer) = state.answers.remove(found);
                state.feed.extend_from_slice(&answer);
            }

            state.commands.push(line);
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ScriptHandle {
    /// Queue raw bytes for the reader, e.g. an unsolicited event line.
    pub fn feed(&self, data: &[u8]) {
        self.state.lock().unwrap().feed.extend_from_slice(data);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn saw_command(&self, line: &str) -> bool {
        self.commands().iter().any(|cmd| cmd == line)
    }

    pub fn saw_prefix(&self, prefix: &str) -> bool {
        self.commands().iter().any(|cmd| cmd.starts_with(prefix))
    }
}

/// Neighbour address used throughout the canned scripts.
pub(crate) const NEIGHBOUR: &str = "FE80:0000:0000:0000:021D:1291:0000:0001";

/// Configuration with test-friendly timeouts matching the canned scripts.
pub(crate) fn test_config() -> Config {
    let mut config = Config::new("/dev/ttyTEST", "TESTRBID", "TESTPASSWORD");
    config.command_timeout_secs = 2;
    config.join_timeout_secs = 2;
    config.response_timeout_secs = 2;
    config
}

/// Script covering a nominal open (first scan succeeds) plus teardown.
pub(crate) fn open_script() -> Vec<(&'static str, &'static str)> {
    vec![
        ("SKRESET", "OK\r\n"),
        ("SKVER", "EVER 1.2.8\r\nOK\r\n"),
        (
            "SKINFO",
            "EINFO FE80:0000:0000:0000:021D:1291:0000:0001 001D129100000001 21 8888 FFFE\r\nOK\r\n",
        ),
        ("ROPT", "OK 01\r\n"),
        ("SKSETPWD C TESTPASSWORD", "OK\r\n"),
        ("SKSETRBID TESTRBID", "OK\r\n"),
        (
            "SKSCAN 2 FFFFFFFF 4",
            "OK\r\nEPANDESC\r\n  Channel:21\r\n  Channel Page:09\r\n  Pan ID:8888\r\n  Addr:001D129100000001\r\n  LQI:E1\r\n  PairID:00AABBCC\r\nEVENT 22 FE80:0000:0000:0000:021D:1291:0000:0001\r\n",
        ),
        ("SKLL64 001D129100000001", "FE80:0000:0000:0000:021D:1291:0000:0001\r\n"),
        ("SKSREG S2 21", "OK\r\n"),
        ("SKSREG S3 8888", "OK\r\n"),
        (
            "SKJOIN FE80:0000:0000:0000:021D:1291:0000:0001",
            "OK\r\nEVENT 25 FE80:0000:0000:0000:021D:1291:0000:0001\r\n",
        ),
        ("SKTERM", "OK\r\n"),
    ]
}

/// Build a scripted endpoint pair. Script entries map an exact command line
/// to the full raw answer (excluding the echo, which is automatic).
pub(crate) fn script_pair(script: &[(&str, &str)]) -> (ScriptReader, ScriptWriter, ScriptHandle) {
    let state = Arc::new(Mutex::new(ScriptState {
        answers: script
            .iter()
            .map(|(cmd, answer)| (cmd.to_string(), answer.as_bytes().to_vec()))
            .collect(),
        ..ScriptState::default()
    }));

    (
        ScriptReader { state: state.clone() },
        ScriptWriter { state: state.clone() },
        ScriptHandle { state },
    )
}
