//! PAN discovery, PANA session lifecycle and the transmission gate.
//!
//! The session owns the SK module for its whole lifetime. A monitor thread
//! consumes the module's event subscription and drives the state machine:
//!
//! ```text
//! closed → scanning → joining → joined ↔ rejoining
//!                         │         │
//!                         └──fail───┴─→ failed (requires reopen)
//! ```

use crate::config::Config;
use crate::error::{Error, Result};
use skstack::event::{codes, PanDescBuilder};
use skstack::logging;
use skstack::{port, Command, PanDesc, SkError, SkEvent, SkModule};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// ECHONET Lite UDP port.
pub const EL_PORT: u16 = 0x0E1A;

/// Channel mask covering the full Route-B band.
const SCAN_MASK: u32 = 0xFFFF_FFFF;

/// Cadence at which the monitor wakes to enforce rejoin deadlines even when
/// no events arrive.
const MONITOR_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    Closed,
    Scanning,
    Joining,
    Joined,
    Rejoining,
    Failed,
}

/// Gate bookkeeping. The gate admits transmissions iff the session is
/// joined and none of the close causes is set.
#[derive(Debug)]
struct GateState {
    state: SessionState,
    /// `EVENT 32` transmission-rate restriction in force.
    restricted: bool,
    /// PANA re-authentication in progress.
    reauthing: bool,
    /// A serial write is in flight or has stalled.
    stalled: bool,
}

impl GateState {
    fn new() -> GateState {
        GateState {
            state: SessionState::Closed,
            restricted: false,
            reauthing: false,
            stalled: false,
        }
    }

    #[inline]
    fn admits(&self) -> bool {
        self.state == SessionState::Joined
            && !self.restricted
            && !self.reauthing
            && !self.stalled
    }
}

/// What the monitor must do after folding an event into the gate state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum MonitorAction {
    None,
    /// Re-run PANA authentication against the module.
    Rejoin,
}

/// Fold a PANA / restriction event into the gate state. `EVENT 25` is
/// ambiguous on the wire; the current state disambiguates initial join,
/// re-auth start and re-auth completion.
fn apply_event(gate: &mut GateState, code: u8) -> MonitorAction {
    match code {
        codes::PANA_COMPLETE => match gate.state {
            SessionState::Joining => gate.state = SessionState::Joined,
            SessionState::Joined => {
                gate.state = SessionState::Rejoining;
                gate.reauthing = true;
            }
            SessionState::Rejoining => {
                gate.state = SessionState::Joined;
                gate.reauthing = false;
            }
            _ => (),
        },
        codes::PANA_FAILED => match gate.state {
            SessionState::Joining | SessionState::Joined | SessionState::Rejoining => {
                gate.state = SessionState::Failed;
            }
            _ => (),
        },
        codes::PANA_TERMINATED | codes::PANA_EXPIRED => {
            if gate.state == SessionState::Joined || gate.state == SessionState::Rejoining {
                gate.state = SessionState::Rejoining;
                gate.reauthing = true;
                return MonitorAction::Rejoin;
            }
        }
        codes::RESTRICTION_ENTERED => gate.restricted = true,
        codes::RESTRICTION_LIFTED => gate.restricted = false,
        _ => (),
    }

    MonitorAction::None
}

struct Shared {
    gate: Mutex<GateState>,
    cond: Condvar,
    log: logging::Logger,
}

/// An open Route-B session: scanned, registered and PANA-authenticated
/// against one meter. Failure states are sticky; recovery is a fresh
/// `open()`.
pub struct Session {
    sk: Arc<SkModule>,
    shared: Arc<Shared>,
    monitor: Mutex<Option<thread::JoinHandle<()>>>,
    neighbour: String,
    command_timeout: Duration,
    gate_timeout: Duration,
    log: logging::Logger,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("neighbour", &self.neighbour)
            .finish()
    }
}

impl Session {
    /// Bring the link up end to end: reset (optional), payload-mode probe,
    /// credentials, scan escalation, register writes and PANA join.
    pub fn open<'a, L: Into<Option<&'a logging::Logger>>>(
        config: &Config,
        log: L,
    ) -> Result<Session> {
        config.validate()?;

        let pair = port::open(&config.device, config.baud_rate)
            .map_err(|err| Error::Config(format!("cannot open {}: {}", config.device, err)))?;

        Self::open_io(pair.reader, pair.writer, config, log)
    }

    /// Same as [`open`](Session::open) over an already-open byte-stream
    /// pair instead of a serial device path.
    pub fn open_io<'a, R, W, L>(reader: R, writer: W, config: &Config, log: L) -> Result<Session>
    where
        R: std::io::Read + Send + 'static,
        W: std::io::Write + Send + 'static,
        L: Into<Option<&'a logging::Logger>>,
    {
        config.validate()?;

        let root = log.into();
        let log = logging::layer(root, "session");

        let sk = Arc::new(SkModule::start(reader, writer, root));

        let shared = Arc::new(Shared {
            gate: Mutex::new(GateState::new()),
            cond: Condvar::new(),
            log: log.clone(),
        });

        logging::info!(log, "opening session"; "device" => &config.device);

        shared.gate.lock().unwrap().state = SessionState::Scanning;

        match Self::bring_up(&*sk, config, &log) {
            Ok((_desc, neighbour)) => Self::join(sk, shared, config, log, neighbour),
            Err(err) => {
                sk.shutdown();
                Err(err)
            }
        }
    }

    /// Everything up to (not including) `SKJOIN`: returns the selected PAN
    /// descriptor and the neighbour's link-local address.
    fn bring_up(
        sk: &SkModule,
        config: &Config,
        log: &logging::Logger,
    ) -> Result<(PanDesc, String)> {
        let timeout = config.command_timeout();

        if config.reset_dev {
            sk.execute(&Command::SkReset, timeout)?;
        }

        for info in sk.execute(&Command::SkVer, timeout)? {
            if info.starts_with("EVER") {
                logging::info!(log, "module firmware"; "ever" => &info);
            }
        }

        for info in sk.execute(&Command::SkInfo, timeout)? {
            if info.starts_with("EINFO") {
                logging::info!(log, "module info"; "einfo" => &info);
            }
        }

        Self::select_ascii_payload(sk, log, timeout)?;

        sk.execute(&Command::SkSetPwd(config.password.clone()), timeout)?;
        sk.execute(&Command::SkSetRbid(config.rbid.clone()), timeout)?;

        let desc = Self::scan(sk, config, log)?;

        let answer = sk.execute(&Command::SkLl64 { addr: desc.addr }, timeout)?;
        let neighbour = answer
            .last()
            .filter(|line| line.contains(':'))
            .cloned()
            .ok_or(Error::NeedToReopen)?;

        logging::info!(log, "neighbour resolved";
                       "ipaddr" => &neighbour,
                       "channel" => desc.channel,
                       "pan_id" => desc.pan_id);

        sk.execute(
            &Command::SkSreg { register: 2, value: u32::from(desc.channel) },
            timeout,
        )?;
        sk.execute(
            &Command::SkSreg { register: 3, value: u32::from(desc.pan_id) },
            timeout,
        )?;

        Ok((desc, neighbour))
    }

    /// Probe `ROPT` and switch the module to ASCII payload rendering when
    /// required. Firmware without `ROPT` answers `FAIL ER04` and is assumed
    /// to be in ASCII mode already; `WOPT` is then skipped (it persists to
    /// flash with a limited write count).
    fn select_ascii_payload(
        sk: &SkModule,
        log: &logging::Logger,
        timeout: Duration,
    ) -> Result<()> {
        match sk.execute(&Command::Ropt, timeout) {
            Ok(lines) => {
                let mode = lines
                    .iter()
                    .find_map(|line| line.strip_prefix("OK "))
                    .map(str::trim)
                    .unwrap_or("01");

                if mode != "01" {
                    logging::info!(log, "switching module to ascii payload"; "ropt" => mode);

                    sk.set_binary_payload(true);
                    sk.execute(&Command::Wopt(0x01), timeout)?;
                    sk.set_binary_payload(false);
                }

                Ok(())
            }
            Err(SkError::CommandFailed(ref code)) if code == "ER04" => {
                logging::debug!(log, "ROPT unsupported; assuming ascii payload");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Scan escalation: walk the duration ladder until a PAN descriptor
    /// shows up in the scan response.
    fn scan(sk: &SkModule, config: &Config, log: &logging::Logger) -> Result<PanDesc> {
        for duration in config.scan_duration_min..=config.scan_duration_max {
            logging::debug!(log, "scanning"; "duration" => duration);

            let command = Command::SkScan { mask: SCAN_MASK, duration };
            let lines = sk
                .execute(&command, scan_timeout(duration))
                .map_err(|err| match err {
                    SkError::Timeout => Error::ScanFailure,
                    other => other.into(),
                })?;

            if let Some(desc) = parse_scan_response(&lines) {
                logging::info!(log, "pan discovered";
                               "channel" => desc.channel,
                               "pan_id" => desc.pan_id,
                               "addr" => format!("{:016X}", desc.addr));
                return Ok(desc);
            }
        }

        Err(Error::ScanFailure)
    }

    /// Issue `SKJOIN`, start the monitor and wait for the PANA outcome.
    fn join(
        sk: Arc<SkModule>,
        shared: Arc<Shared>,
        config: &Config,
        log: logging::Logger,
        neighbour: String,
    ) -> Result<Session> {
        shared.gate.lock().unwrap().state = SessionState::Joining;

        let events = sk.subscribe("EVENT");
        let monitor = spawn_monitor(
            shared.clone(),
            sk.clone(),
            events,
            config.join_timeout(),
            config.command_timeout(),
        );

        let session = Session {
            sk,
            shared,
            monitor: Mutex::new(Some(monitor)),
            neighbour,
            command_timeout: config.command_timeout(),
            gate_timeout: config.gate_timeout(),
            log,
        };

        let joined = session
            .sk
            .execute(&Command::SkJoin { ipaddr: session.neighbour.clone() }, session.command_timeout)
            .map_err(|_| Error::JoinFailure)
            .and_then(|_| session.await_join(config.join_timeout()));

        if let Err(err) = joined {
            session.close();
            return Err(err);
        }

        logging::info!(session.log, "session joined"; "neighbour" => &session.neighbour);

        Ok(session)
    }

    fn await_join(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut gate = self.shared.gate.lock().unwrap();

        loop {
            match gate.state {
                SessionState::Joined => return Ok(()),
                SessionState::Failed | SessionState::Closed => return Err(Error::JoinFailure),
                _ => (),
            }

            let left = match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => return Err(Error::JoinFailure),
            };

            gate = self.shared.cond.wait_timeout(gate, left).unwrap().0;
        }
    }

    /// The neighbour's IPv6 link-local address as reported by `SKLL64`,
    /// reused verbatim for sends and for response source filtering.
    #[inline]
    pub fn neighbour(&self) -> &str {
        &self.neighbour
    }

    /// Subscription to inbound UDP deliveries, for the ECHONET client.
    #[inline]
    pub(crate) fn subscribe_udp(&self) -> Receiver<SkEvent> {
        self.sk.subscribe("ERXUDP")
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.shared.gate.lock().unwrap().state
    }

    /// Send one ECHONET Lite frame to the meter. Blocks on the transmission
    /// gate first; the gate stays held (as the `stalled` cause) until the
    /// module acknowledges the command.
    pub fn send_to_meter(&self, data: Vec<u8>, deadline: Instant) -> Result<()> {
        self.acquire_gate(deadline)?;

        let command = Command::SkSendTo {
            handle: 1,
            ipaddr: self.neighbour.clone(),
            port: EL_PORT,
            sec: 1,
            side: 0,
            data,
        };

        let timeout = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::from_millis(0))
            .max(Duration::from_millis(1));

        match self.sk.execute(&command, timeout) {
            Ok(_) => {
                self.release_gate();
                Ok(())
            }
            Err(SkError::Timeout) => {
                // Serial stall. Leave the gate closed; the session is gone.
                logging::error!(self.log, "serial stall during send");
                self.fail();
                Err(Error::NeedToReopen)
            }
            Err(err) => {
                logging::error!(self.log, "send rejected"; "error" => %err);
                self.release_gate();
                Err(err.into())
            }
        }
    }

    /// Wait until the gate admits a transmission, bounded by the caller's
    /// deadline and the configured gate patience, then hold it.
    fn acquire_gate(&self, deadline: Instant) -> Result<()> {
        let deadline = deadline.min(Instant::now() + self.gate_timeout);
        let mut gate = self.shared.gate.lock().unwrap();

        loop {
            match gate.state {
                SessionState::Failed | SessionState::Closed => return Err(Error::NeedToReopen),
                _ => (),
            }

            if gate.admits() {
                gate.stalled = true;
                return Ok(());
            }

            let left = match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => return Err(Error::NeedToReopen),
            };

            gate = self.shared.cond.wait_timeout(gate, left).unwrap().0;
        }
    }

    fn release_gate(&self) {
        let mut gate = self.shared.gate.lock().unwrap();
        gate.stalled = false;
        self.shared.cond.notify_all();
    }

    fn fail(&self) {
        let mut gate = self.shared.gate.lock().unwrap();
        gate.state = SessionState::Failed;
        self.shared.cond.notify_all();
    }

    /// Tear the session down: best-effort `SKTERM`, stop the reader, join
    /// the monitor. Idempotent; every waiter is released.
    pub fn close(&self) {
        let was_up = {
            let mut gate = self.shared.gate.lock().unwrap();

            if gate.state == SessionState::Closed {
                return;
            }

            let was_up = gate.state == SessionState::Joined
                || gate.state == SessionState::Rejoining;
            gate.state = SessionState::Closed;
            self.shared.cond.notify_all();
            was_up
        };

        if was_up {
            drop(self.sk.execute(&Command::SkTerm, self.command_timeout));
        }

        self.sk.shutdown();

        if let Some(handle) = self.monitor.lock().unwrap().take() {
            drop(handle.join());
        }

        logging::info!(self.log, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Approximate worst-case wall time of one `SKSCAN` pass plus margin.
fn scan_timeout(duration: u8) -> Duration {
    let per_channel_ms = 9.6 * (f64::from(1u32 << u32::from(duration.min(14))) + 1.0);
    Duration::from_millis((per_channel_ms * 28.0) as u64 + 5_000)
}

/// Extract the first complete `EPANDESC` block from accumulated scan
/// response lines.
fn parse_scan_response(lines: &[String]) -> Option<PanDesc> {
    let mut builder = PanDescBuilder::new();
    let mut found = None;

    for line in lines {
        if !line.starts_with(' ') {
            if let Some(desc) = builder.finish() {
                found.get_or_insert(desc);
            }
        }

        builder.feed(line);
    }

    if let Some(desc) = builder.finish() {
        found.get_or_insert(desc);
    }

    found
}

fn spawn_monitor(
    shared: Arc<Shared>,
    sk: Arc<SkModule>,
    events: Receiver<SkEvent>,
    join_timeout: Duration,
    command_timeout: Duration,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("routeb-session-monitor".to_string())
        .spawn(move || run_monitor(shared, sk, events, join_timeout, command_timeout))
        .expect("failed to spawn session monitor")
}

fn run_monitor(
    shared: Arc<Shared>,
    sk: Arc<SkModule>,
    events: Receiver<SkEvent>,
    join_timeout: Duration,
    command_timeout: Duration,
) {
    let mut rejoin_deadline: Option<Instant> = None;

    loop {
        let event = match events.recv_timeout(MONITOR_TICK) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut action = MonitorAction::None;

        {
            let mut gate = shared.gate.lock().unwrap();

            if gate.state == SessionState::Closed {
                break;
            }

            if let Some(SkEvent::Event { code, .. }) = event {
                logging::debug!(shared.log, "session event";
                                "code" => format!("{:02X}", code),
                                "state" => ?gate.state);

                action = apply_event(&mut gate, code);
                shared.cond.notify_all();
            }

            // A rejoin that never completes is a dead session.
            if let Some(deadline) = rejoin_deadline {
                if gate.state == SessionState::Rejoining && Instant::now() >= deadline {
                    logging::error!(shared.log, "rejoin timed out");
                    gate.state = SessionState::Failed;
                    shared.cond.notify_all();
                    rejoin_deadline = None;
                } else if gate.state != SessionState::Rejoining {
                    rejoin_deadline = None;
                }
            }
        }

        if action == MonitorAction::Rejoin {
            rejoin_deadline = Some(Instant::now() + join_timeout);

            logging::info!(shared.log, "re-running pana authentication");

            if sk.execute(&Command::SkRejoin, command_timeout).is_err() {
                let mut gate = shared.gate.lock().unwrap();
                gate.state = SessionState::Failed;
                shared.cond.notify_all();
            }
        }
    }
}
