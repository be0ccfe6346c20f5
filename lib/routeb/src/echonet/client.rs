//! Request/response plumbing for ECHONET Lite over the joined session.
//!
//! Each outbound frame gets a fresh transaction id; a demux thread matches
//! `ERXUDP` deliveries back to the waiting caller by source address, port
//! and TID. Unmatched responses are dropped.

use crate::echonet::frame::{esv, ElFrame, ElProperty};
use crate::error::{Error, Result};
use crate::session::{Session, EL_PORT};
use hashbrown::HashMap;
use skstack::logging;
use skstack::{RxUdp, SkEvent};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Shape of a request, deciding which response services are acceptable and
/// how a negative response names the offending properties.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RequestKind {
    Get,
    SetC,
}

struct ResponseSlot {
    frame: Mutex<Option<Result<ElFrame>>>,
    cond: Condvar,
}

impl ResponseSlot {
    fn new() -> Arc<ResponseSlot> {
        Arc::new(ResponseSlot {
            frame: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn fill(&self, result: Result<ElFrame>) {
        *self.frame.lock().unwrap() = Some(result);
        self.cond.notify_all();
    }
}

struct TidTable {
    next: u16,
    inflight: HashMap<u16, Arc<ResponseSlot>>,
}

impl TidTable {
    fn new() -> TidTable {
        TidTable {
            next: 1,
            inflight: HashMap::new(),
        }
    }

    /// Cyclic 16-bit allocation, skipping ids still in flight.
    fn allocate(&mut self) -> (u16, Arc<ResponseSlot>) {
        loop {
            let tid = self.next;
            self.next = self.next.wrapping_add(1);

            if !self.inflight.contains_key(&tid) {
                let slot = ResponseSlot::new();
                self.inflight.insert(tid, slot.clone());
                return (tid, slot);
            }
        }
    }
}

/// ECHONET Lite client bound to one joined session.
pub struct ElClient {
    session: Session,
    table: Arc<Mutex<TidTable>>,
    demux: Mutex<Option<thread::JoinHandle<()>>>,
    log: logging::Logger,
}

impl ElClient {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(session: Session, log: L) -> ElClient {
        let log = logging::layer(log, "echonet");
        let table = Arc::new(Mutex::new(TidTable::new()));

        let events = session.subscribe_udp();
        let neighbour = session.neighbour().to_string();

        let demux_table = table.clone();
        let demux_log = log.clone();
        let demux = thread::Builder::new()
            .name("routeb-el-demux".to_string())
            .spawn(move || run_demux(demux_table, neighbour, events, demux_log))
            .expect("failed to spawn echonet demux");

        ElClient {
            session,
            table,
            demux: Mutex::new(Some(demux)),
            log,
        }
    }

    /// Read one or more properties with a single Get aggregate.
    pub fn get(&self, epcs: &[u8], timeout: Duration) -> Result<Vec<ElProperty>> {
        let props = epcs.iter().map(|&epc| ElProperty::request(epc)).collect();

        self.transact(esv::GET, RequestKind::Get, props, timeout)
    }

    /// Write one or more properties with a single SetC aggregate.
    pub fn set_c(&self, props: Vec<ElProperty>, timeout: Duration) -> Result<Vec<ElProperty>> {
        self.transact(esv::SET_C, RequestKind::SetC, props, timeout)
    }

    fn transact(
        &self,
        service: u8,
        kind: RequestKind,
        props: Vec<ElProperty>,
        timeout: Duration,
    ) -> Result<Vec<ElProperty>> {
        let deadline = Instant::now() + timeout;
        let (tid, slot) = self.table.lock().unwrap().allocate();

        let epcs: Vec<String> = props.iter().map(|prop| format!("{:02X}", prop.epc)).collect();
        logging::debug!(self.log, "request";
                        "tid" => tid,
                        "esv" => format!("{:02X}", service),
                        "epcs" => epcs.join(","));

        let frame = ElFrame::request(tid, service, props);

        if let Err(err) = self.session.send_to_meter(frame.encode(), deadline) {
            self.reclaim(tid);
            return Err(err);
        }

        let response = self.await_response(&slot, tid, deadline)?;

        logging::debug!(self.log, "response";
                        "tid" => tid,
                        "esv" => format!("{:02X}", response.esv));

        interpret(kind, response)
    }

    /// Wait for the demux to fill the slot. A missing response is
    /// indistinguishable from a dead radio, so expiry poisons the session
    /// for the caller.
    fn await_response(
        &self,
        slot: &ResponseSlot,
        tid: u16,
        deadline: Instant,
    ) -> Result<ElFrame> {
        let mut frame = slot.frame.lock().unwrap();

        loop {
            if let Some(result) = frame.take() {
                return result;
            }

            let left = match deadline.checked_duration_since(Instant::now()) {
                Some(left) => left,
                None => {
                    drop(frame);
                    self.reclaim(tid);
                    logging::debug!(self.log, "response deadline expired"; "tid" => tid);
                    return Err(Error::NeedToReopen);
                }
            };

            frame = slot.cond.wait_timeout(frame, left).unwrap().0;
        }
    }

    fn reclaim(&self, tid: u16) {
        self.table.lock().unwrap().inflight.remove(&tid);
    }

    /// Release every waiter with `NeedToReopen`, close the session and join
    /// the demux thread. Idempotent.
    pub fn close(&self) {
        {
            let mut table = self.table.lock().unwrap();

            for (_, slot) in table.inflight.drain() {
                slot.fill(Err(Error::NeedToReopen));
            }
        }

        self.session.close();

        if let Some(handle) = self.demux.lock().unwrap().take() {
            drop(handle.join());
        }
    }
}

impl Drop for ElClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_demux(
    table: Arc<Mutex<TidTable>>,
    neighbour: String,
    events: Receiver<SkEvent>,
    log: logging::Logger,
) {
    for event in events.iter() {
        let udp = match event {
            SkEvent::RxUdp(udp) => udp,
            _ => continue,
        };

        let frame = match match_response(&udp, &neighbour) {
            Ok(frame) => frame,
            Err(reason) => {
                logging::debug!(log, "datagram dropped";
                                "sender" => &udp.sender,
                                "reason" => reason);
                continue;
            }
        };

        let slot = table.lock().unwrap().inflight.remove(&frame.tid);

        match slot {
            Some(slot) => slot.fill(Ok(frame)),
            None => {
                logging::debug!(log, "unmatched response dropped"; "tid" => frame.tid)
            }
        }
    }
}

/// Filter and decode an inbound datagram: correct port, correct source,
/// well-formed ECHONET Lite format-1 frame.
fn match_response(udp: &RxUdp, neighbour: &str) -> std::result::Result<ElFrame, &'static str> {
    if udp.lport != EL_PORT {
        return Err("foreign destination port");
    }

    if udp.sender != neighbour {
        return Err("foreign sender");
    }

    ElFrame::decode(&udp.data).map_err(|_| "undecodable frame")
}

fn interpret(kind: RequestKind, frame: ElFrame) -> Result<Vec<ElProperty>> {
    match (kind, frame.esv) {
        (RequestKind::Get, esv::GET_RES) | (RequestKind::SetC, esv::SET_RES) => Ok(frame.props),
        // A Get "not possible" response flags rejected properties with an
        // empty EDT; a SetC one echoes the rejected data back.
        (RequestKind::Get, esv::GET_SNA) => Err(Error::ResponsePossibleFailure {
            epcs: frame
                .props
                .iter()
                .filter(|prop| prop.edt.is_empty())
                .map(|prop| prop.epc)
                .collect(),
        }),
        (RequestKind::SetC, esv::SET_SNA) => Err(Error::ResponsePossibleFailure {
            epcs: frame
                .props
                .iter()
                .filter(|prop| !prop.edt.is_empty())
                .map(|prop| prop.epc)
                .collect(),
        }),
        _ => Err(Error::MalformedResponse {
            epc: frame.props.first().map(|prop| prop.epc).unwrap_or(0),
        }),
    }
}
