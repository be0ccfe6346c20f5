//! The command dispatcher.
//!
//! One long-lived reader thread owns the framer and classifies everything
//! coming off the wire: response lines feed the single pending command,
//! unsolicited events fan out to channel subscribers. Commands are strictly
//! serialised; at most one is in flight against the module at any time.

use crate::command::{fail_code, Command, Expect};
use crate::event::{PanDescBuilder, RxUdp, SkEvent};
use crate::framer::{Framer, PayloadMode, SkFrame};
use crate::logging;
use crate::{SkError, SkResult};
use std::io::{self, Read, Write};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Patience for the command slot to free up before the reader is declared
/// stuck and the attempt aborted.
const SLOT_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingCommand {
    echo: String,
    expect: Expect,
    lines: Vec<String>,
    outcome: Option<SkResult<()>>,
}

struct Subscriber {
    prefix: &'static str,
    tx: mpsc::Sender<SkEvent>,
}

struct Shared {
    pending: Mutex<Option<PendingCommand>>,
    pending_cond: Condvar,
    subscribers: Mutex<Vec<Subscriber>>,
    binary_payload: AtomicBool,
    stop: AtomicBool,
    dead: AtomicBool,
    log: logging::Logger,
}

/// Handle to a running SK module. Cheap to construct once per open session;
/// dropped (or shut down) when the session closes.
pub struct SkModule {
    shared: Arc<Shared>,
    writer: Mutex<Box<dyn Write + Send>>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SkModule {
    /// Start the dispatcher over an already-open byte stream pair. The
    /// reader half is moved onto the reader thread; the writer half stays
    /// with the handle.
    pub fn start<'a, R, W, L>(reader: R, writer: W, log: L) -> SkModule
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
        L: Into<Option<&'a logging::Logger>>,
    {
        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            pending_cond: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
            binary_payload: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            log: logging::layer(log, "skstack"),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("skstack-reader".to_string())
            .spawn(move || run_reader(thread_shared, reader))
            .expect("failed to spawn reader thread");

        SkModule {
            shared,
            writer: Mutex::new(Box::new(writer)),
            reader: Mutex::new(Some(handle)),
        }
    }

    /// Issue a command and block until its terminator, the timeout or a
    /// fatal transport error. Returns the accumulated response lines, echo
    /// included. A timeout abandons the exchange but leaves the module
    /// usable for subsequent commands.
    pub fn execute(&self, command: &Command, timeout: Duration) -> SkResult<Vec<String>> {
        if self.is_dead() {
            return Err(SkError::Closed);
        }

        let line = command.line();

        logging::debug!(self.shared.log, "issuing command";
                        "command" => command.loggable(),
                        "timeout" => ?timeout);

        self.claim_slot(&line, command.expect())?;

        // Transmit. A write failure means the device is gone.
        if let Err(err) = self.write_line(&line) {
            self.release_slot();
            self.shared.dead.store(true, Ordering::Release);

            logging::error!(self.shared.log, "serial write failed";
                            "command" => command.loggable(),
                            "error" => %err);

            return Err(err.into());
        }

        self.await_outcome(timeout)
    }

    /// Register an event subscriber. `prefix` selects the event family
    /// (`"EVENT"`, `"EPANDESC"`, `"ERXUDP"`, or `""` for everything). The
    /// channel disconnects when the reader thread exits.
    pub fn subscribe(&self, prefix: &'static str) -> mpsc::Receiver<SkEvent> {
        let (tx, rx) = mpsc::channel();

        self.shared
            .subscribers
            .lock()
            .unwrap()
            .push(Subscriber { prefix, tx });

        rx
    }

    /// Select how the framer and the `ERXUDP` parser treat the data column.
    #[inline]
    pub fn set_binary_payload(&self, binary: bool) {
        self.shared.binary_payload.store(binary, Ordering::Release);
    }

    /// True once a fatal transport error has latched or the module was shut
    /// down. Recovery requires a fresh open.
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.shared.dead.load(Ordering::Acquire)
    }

    /// Stop and join the reader thread, then latch the module dead. All
    /// subscriber channels disconnect; pending waiters are released.
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);

        if let Some(handle) = self.reader.lock().unwrap().take() {
            drop(handle.join());
        }

        self.shared.dead.store(true, Ordering::Release);
        self.shared.pending_cond.notify_all();

        logging::debug!(self.shared.log, "module shut down");
    }

    /// Wait (bounded) for the pending slot to be free and claim it.
    fn claim_slot(&self, echo: &str, expect: Expect) -> SkResult<()> {
        let mut pending = self.shared.pending.lock().unwrap();
        let deadline = Instant::now() + SLOT_TIMEOUT;

        while pending.is_some() {
            let left = match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => return Err(SkError::Busy),
            };

            pending = self.shared.pending_cond.wait_timeout(pending, left).unwrap().0;

            if self.is_dead() {
                return Err(SkError::Closed);
            }
        }

        *pending = Some(PendingCommand {
            echo: echo.to_string(),
            expect,
            lines: Vec::new(),
            outcome: None,
        });

        Ok(())
    }

    fn release_slot(&self) {
        *self.shared.pending.lock().unwrap() = None;
        self.shared.pending_cond.notify_all();
    }

    /// Block until the reader marks the pending command complete.
    fn await_outcome(&self, timeout: Duration) -> SkResult<Vec<String>> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.shared.pending.lock().unwrap();

        loop {
            {
                let slot = pending.as_mut().expect("pending command slot vanished");

                if let Some(outcome) = slot.outcome.take() {
                    let lines = mem::replace(&mut slot.lines, Vec::new());
                    *pending = None;
                    self.shared.pending_cond.notify_all();

                    return outcome.map(|()| lines);
                }
            }

            if self.is_dead() {
                *pending = None;
                self.shared.pending_cond.notify_all();
                return Err(SkError::Closed);
            }

            let left = match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => {
                    *pending = None;
                    self.shared.pending_cond.notify_all();
                    return Err(SkError::Timeout);
                }
            };

            pending = self.shared.pending_cond.wait_timeout(pending, left).unwrap().0;
        }
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap();

        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\r\n")?;
        writer.flush()
    }
}

impl Drop for SkModule {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_reader<R: Read>(shared: Arc<Shared>, reader: R) {
    let mut framer = Framer::new(reader, PayloadMode::Ascii);
    let mut pan_desc = PanDescBuilder::new();
    let mut pending_udp: Option<RxUdp> = None;

    while !shared.stop.load(Ordering::Acquire) {
        let mode = match shared.binary_payload.load(Ordering::Acquire) {
            true => PayloadMode::Binary,
            false => PayloadMode::Ascii,
        };
        framer.set_mode(mode);

        match framer.next_frame() {
            Ok(SkFrame::Line(line)) => {
                shared.handle_line(line, &mut pan_desc, &mut pending_udp)
            }
            Ok(SkFrame::Payload(data)) => {
                if let Some(mut udp) = pending_udp.take() {
                    udp.data = data;
                    shared.publish(SkEvent::RxUdp(udp));
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::TimedOut => continue,
            Err(err) => {
                shared.fail(err);
                break;
            }
        }
    }

    // Disconnect every subscriber so monitors observe the shutdown.
    shared.subscribers.lock().unwrap().clear();
}

impl Shared {
    fn handle_line(
        &self,
        line: String,
        pan_desc: &mut PanDescBuilder,
        pending_udp: &mut Option<RxUdp>,
    ) {
        if line.is_empty() {
            return;
        }

        // The module echoes SKSETPWD back; keep the password out of the log.
        if line.starts_with("SKSETPWD") {
            logging::trace!(self.log, "line received"; "raw" => "SKSETPWD <redacted>");
        } else {
            logging::trace!(self.log, "line received"; "raw" => &line);
        }

        // A non-indented line closes any open EPANDESC block.
        if !line.starts_with(' ') {
            if let Some(desc) = pan_desc.finish() {
                self.publish(SkEvent::PanDesc(desc));
            }
        }

        if pan_desc.feed(&line) {
            self.offer_scan_line(&line);
            return;
        }

        if line.starts_with("ERXUDP") {
            let binary = self.binary_payload.load(Ordering::Acquire);

            match RxUdp::parse(&line, binary) {
                Some(udp) if binary => *pending_udp = Some(udp),
                Some(udp) => self.publish(SkEvent::RxUdp(udp)),
                None => {
                    logging::debug!(self.log, "malformed ERXUDP dropped"; "raw" => &line)
                }
            }

            return;
        }

        if line.starts_with("EVENT") {
            if let Some(event) = SkEvent::parse_event(&line) {
                self.publish(event);
            }

            self.offer_event_line(&line);
            return;
        }

        self.offer_response_line(line);
    }

    /// EPANDESC content belongs to the response of a pending until-event
    /// command (the scan); everything else ignores it.
    fn offer_scan_line(&self, line: &str) {
        let mut pending = self.pending.lock().unwrap();

        if let Some(slot) = pending.as_mut() {
            if let Expect::Events(_) = slot.expect {
                slot.lines.push(line.to_string());
            }
        }
    }

    /// Event lines terminate only until-event predicates, and only on the
    /// codes they list. Anything else stays on the event bus alone.
    fn offer_event_line(&self, line: &str) {
        let code = match SkEvent::parse_event(line) {
            Some(SkEvent::Event { code, .. }) => code,
            _ => return,
        };

        let mut pending = self.pending.lock().unwrap();

        if let Some(slot) = pending.as_mut() {
            if let Expect::Events(_) = slot.expect {
                slot.lines.push(line.to_string());

                if slot.expect.event_terminates(code) {
                    slot.outcome = Some(Ok(()));
                    self.pending_cond.notify_all();
                }
            }
        }
    }

    fn offer_response_line(&self, line: String) {
        let mut pending = self.pending.lock().unwrap();

        let slot = match pending.as_mut() {
            Some(slot) => slot,
            None => {
                logging::trace!(self.log, "unsolicited response line dropped"; "raw" => &line);
                return;
            }
        };

        // The module echoes the command text back first.
        if line == slot.echo {
            slot.lines.push(line);
            return;
        }

        if line.starts_with("FAIL") {
            let code = fail_code(&line);
            slot.lines.push(line);
            slot.outcome = Some(Err(SkError::CommandFailed(code)));
            self.pending_cond.notify_all();
            return;
        }

        let terminal = match slot.expect {
            Expect::Ok => line == "OK" || line.starts_with("OK "),
            Expect::Answer => true,
            Expect::Events(_) => false,
        };

        slot.lines.push(line);

        if terminal {
            slot.outcome = Some(Ok(()));
            self.pending_cond.notify_all();
        }
    }

    fn publish(&self, event: SkEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();

        subscribers.retain(|subscriber| {
            if !event.matches(subscriber.prefix) {
                return true;
            }

            subscriber.tx.send(event.clone()).is_ok()
        });
    }

    /// Latch the module dead on a fatal transport error and release every
    /// waiter.
    fn fail(&self, err: io::Error) {
        logging::error!(self.log, "fatal serial error"; "error" => %err);

        self.dead.store(true, Ordering::Release);

        let mut pending = self.pending.lock().unwrap();

        if let Some(slot) = pending.as_mut() {
            if slot.outcome.is_none() {
                slot.outcome = Some(Err(SkError::Io(err.kind())));
            }
        }

        self.pending_cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::TryRecvError;

    /// Scripted serial double: `read` hands out the scripted transcript in
    /// order, then reports timeouts; `write` records everything.
    struct ScriptReader {
        data: Arc<Mutex<Vec<u8>>>,
    }

    #[derive(Clone)]
    struct ScriptWriter {
        written: Arc<Mutex<Vec<u8>>>,
        feed: Arc<Mutex<Vec<u8>>>,
        script: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    impl Read for ScriptReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut data = self.data.lock().unwrap();

            if data.is_empty() {
                // Short heartbeat keeps the tests snappy.
                thread::sleep(Duration::from_millis(2));
                return Err(io::ErrorKind::TimedOut.into());
            }

            let count = data.len().min(buf.len());
            buf[..count].copy_from_slice(&data[..count]);
            data.drain(..count);
            Ok(count)
        }
    }

    impl Write for ScriptWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);

            // When a full command line has been written, feed the scripted
            // answer for it back to the reader.
            let is_complete = {
                let written = self.written.lock().unwrap();
                written.ends_with(b"\r\n")
            };

            if is_complete {
                let line = {
                    let mut written = self.written.lock().unwrap();
                    let line = String::from_utf8_lossy(&written).trim_end().to_string();
                    written.clear();
                    line
                };

                let mut script = self.script.lock().unwrap();

                if let Some(position) = script.iter().position(|(cmd, _)| *cmd == line) {
                    let (_, answer) = script.remove(position);
                    self.feed.lock().unwrap().extend_from_slice(&answer);
                }
            }

            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn scripted(script: Vec<(&str, &str)>) -> (SkModule, ScriptWriter) {
        let feed = Arc::new(Mutex::new(Vec::new()));
        let writer = ScriptWriter {
            written: Arc::new(Mutex::new(Vec::new())),
            feed: feed.clone(),
            script: Arc::new(Mutex::new(
                script
                    .into_iter()
                    .map(|(cmd, answer)| (cmd.to_string(), answer.as_bytes().to_vec()))
                    .collect(),
            )),
        };

        let module = SkModule::start(ScriptReader { data: feed }, writer.clone(), None);

        (module, writer)
    }

    fn feed_raw(writer: &ScriptWriter, data: &[u8]) {
        writer.feed.lock().unwrap().extend_from_slice(data);
    }

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn test_execute_ok_roundtrip() {
        let (module, _writer) = scripted(vec![("SKVER", "SKVER\r\nEVER 1.2.8\r\nOK\r\n")]);

        let lines = module.execute(&Command::SkVer, TIMEOUT).unwrap();

        assert_eq!(lines, vec!["SKVER", "EVER 1.2.8", "OK"]);
    }

    #[test]
    fn test_execute_fail_surfaces_code() {
        let (module, _writer) = scripted(vec![("ROPT", "ROPT\r\nFAIL ER04\r\n")]);

        let err = module.execute(&Command::Ropt, TIMEOUT).unwrap_err();

        assert_eq!(err, SkError::CommandFailed("ER04".to_string()));
    }

    #[test]
    fn test_execute_timeout_is_recoverable() {
        let (module, _writer) = scripted(vec![("SKINFO", "SKINFO\r\nEINFO FE80::1 001D129100000001 21 8888 FFFE\r\nOK\r\n")]);

        let err = module
            .execute(&Command::SkVer, Duration::from_millis(40))
            .unwrap_err();
        assert_eq!(err, SkError::Timeout);

        // The module still answers the next command.
        let lines = module.execute(&Command::SkInfo, TIMEOUT).unwrap();
        assert_eq!(lines.last().unwrap(), "OK");
    }

    #[test]
    fn test_unsolicited_event_does_not_satisfy_ok_predicate() {
        let (module, writer) = scripted(vec![("SKVER", "SKVER\r\nEVENT 32 FE80::1\r\nEVER 1.2.8\r\nOK\r\n")]);

        let events = module.subscribe("EVENT");
        let lines = module.execute(&Command::SkVer, TIMEOUT).unwrap();

        // The event was not folded into the response.
        assert_eq!(lines, vec!["SKVER", "EVER 1.2.8", "OK"]);

        // It went to the bus instead.
        let event = events.recv_timeout(TIMEOUT).unwrap();
        match event {
            SkEvent::Event { code: 0x32, .. } => (),
            other => panic!("unexpected event {:?}", other),
        }

        drop(writer);
    }

    #[test]
    fn test_scan_accumulates_until_completion_event() {
        let answer = "SKSCAN 2 FFFFFFFF 6\r\nOK\r\nEPANDESC\r\n  Channel:21\r\n  Channel Page:09\r\n  Pan ID:8888\r\n  Addr:001D129100000001\r\n  LQI:E1\r\n  PairID:00AABBCC\r\nEVENT 22 FE80::1\r\n";
        let (module, _writer) = scripted(vec![("SKSCAN 2 FFFFFFFF 6", answer)]);

        let lines = module
            .execute(&Command::SkScan { mask: 0xFFFF_FFFF, duration: 6 }, TIMEOUT)
            .unwrap();

        assert!(lines.iter().any(|line| line.trim() == "Channel:21"));
        assert!(lines.iter().any(|line| line.starts_with("EVENT 22")));
    }

    #[test]
    fn test_erxudp_published_in_ascii_mode() {
        let (module, writer) = scripted(vec![]);

        let udp = module.subscribe("ERXUDP");
        feed_raw(
            &writer,
            b"ERXUDP FE80::1 FE80::2 0E1A 0E1A 001D129100000001 1 0004 10810001\r\n",
        );

        match udp.recv_timeout(TIMEOUT).unwrap() {
            SkEvent::RxUdp(rx) => assert_eq!(rx.data, vec![0x10, 0x81, 0x00, 0x01]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_erxudp_binary_payload_pairing() {
        let (module, writer) = scripted(vec![]);
        module.set_binary_payload(true);

        let udp = module.subscribe("ERXUDP");

        let mut raw = b"ERXUDP FE80::1 FE80::2 0E1A 0E1A 001D129100000001 1 0004\r\n".to_vec();
        raw.extend_from_slice(&[0x10, 0x81, 0x00, 0x01]);
        feed_raw(&writer, &raw);

        match udp.recv_timeout(TIMEOUT).unwrap() {
            SkEvent::RxUdp(rx) => assert_eq!(rx.data, vec![0x10, 0x81, 0x00, 0x01]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_subscribers_filtered_by_prefix() {
        let (module, writer) = scripted(vec![]);

        let events = module.subscribe("EVENT");
        let udp = module.subscribe("ERXUDP");

        feed_raw(&writer, b"EVENT 33 FE80::1\r\n");

        match events.recv_timeout(TIMEOUT).unwrap() {
            SkEvent::Event { code: 0x33, .. } => (),
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(udp.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn test_shutdown_disconnects_subscribers() {
        let (module, _writer) = scripted(vec![]);

        let events = module.subscribe("EVENT");

        module.shutdown();

        assert!(module.is_dead());
        assert_eq!(
            module.execute(&Command::SkVer, TIMEOUT).unwrap_err(),
            SkError::Closed
        );
        assert!(events.recv().is_err());
    }

    #[test]
    fn test_pan_desc_published_on_block_close() {
        let (module, writer) = scripted(vec![]);

        let descs = module.subscribe("EPANDESC");

        feed_raw(
            &writer,
            b"EPANDESC\r\n  Channel:21\r\n  Channel Page:09\r\n  Pan ID:8888\r\n  Addr:001D129100000001\r\n  LQI:E1\r\n  PairID:00AABBCC\r\nEVENT 22 FE80::1\r\n",
        );

        match descs.recv_timeout(TIMEOUT).unwrap() {
            SkEvent::PanDesc(desc) => {
                assert_eq!(desc.channel, 0x21);
                assert_eq!(desc.pan_id, 0x8888);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
