//! Parsing for unsolicited module output: `EVENT` lines, `EPANDESC`
//! scan-result blocks and `ERXUDP` datagram deliveries.

/// PANA / transmission-control event codes the client reacts to.
pub mod codes {
    /// Beacon received (scan partial result).
    pub const SCAN_BEACON: u8 = 0x20;
    /// Active scan completed.
    pub const SCAN_COMPLETE: u8 = 0x22;
    /// PANA authentication failed.
    pub const PANA_FAILED: u8 = 0x24;
    /// PANA authentication completed (initial join or re-auth).
    pub const PANA_COMPLETE: u8 = 0x25;
    /// Peer requested PANA session termination.
    pub const PANA_TERMINATED: u8 = 0x26;
    /// PANA session lifetime expired.
    pub const PANA_EXPIRED: u8 = 0x29;
    /// Cumulative transmission-time restriction entered.
    pub const RESTRICTION_ENTERED: u8 = 0x32;
    /// Cumulative transmission-time restriction lifted.
    pub const RESTRICTION_LIFTED: u8 = 0x33;
}

/// Unsolicited module output, fanned out to subscribers by prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkEvent {
    /// `EVENT <code> <sender> [<param>]`
    Event {
        code: u8,
        sender: Option<String>,
        param: Option<u8>,
    },
    /// Assembled `EPANDESC` block.
    PanDesc(PanDesc),
    /// `ERXUDP` datagram.
    RxUdp(RxUdp),
}

impl SkEvent {
    /// Parse an `EVENT` line. Codes and params are hex per the datasheet.
    pub fn parse_event(line: &str) -> Option<SkEvent> {
        let mut tokens = line.split_whitespace();

        if tokens.next()? != "EVENT" {
            return None;
        }

        let code = u8::from_str_radix(tokens.next()?, 16).ok()?;
        let sender = tokens.next().map(str::to_owned);
        let param = tokens.last().and_then(|token| u8::from_str_radix(token, 16).ok());

        Some(SkEvent::Event { code, sender, param })
    }

    /// Whether a subscriber registered under `prefix` receives this event.
    #[inline]
    pub fn matches(&self, prefix: &str) -> bool {
        match self {
            _ if prefix.is_empty() => true,
            SkEvent::Event { .. } => prefix == "EVENT",
            SkEvent::PanDesc(_) => prefix == "EPANDESC",
            SkEvent::RxUdp(_) => prefix == "ERXUDP",
        }
    }
}

/// Coordinates of a discovered PAN, collected from an `EPANDESC` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanDesc {
    pub channel: u8,
    pub channel_page: u8,
    pub pan_id: u16,
    pub addr: u64,
    pub lqi: Option<u8>,
    pub pair_id: Option<String>,
}

/// Stateful accumulator for `EPANDESC` blocks: a bare header line followed
/// by indented `Key:Value` lines. The block has no terminator of its own;
/// the next non-indented line closes it.
#[derive(Default)]
pub struct PanDescBuilder {
    active: bool,
    channel: Option<u8>,
    channel_page: Option<u8>,
    pan_id: Option<u16>,
    addr: Option<u64>,
    lqi: Option<u8>,
    pair_id: Option<String>,
}

impl PanDescBuilder {
    pub fn new() -> PanDescBuilder {
        PanDescBuilder::default()
    }

    /// Offer a line to the builder. Returns true when the line belonged to
    /// an `EPANDESC` block and was consumed.
    pub fn feed(&mut self, line: &str) -> bool {
        if line == "EPANDESC" {
            *self = PanDescBuilder::default();
            self.active = true;
            return true;
        }

        if !self.active || !line.starts_with(' ') {
            return false;
        }

        if let Some(split) = line.find(':') {
            let key = line[..split].trim();
            let value = line[split + 1..].trim();

            match key {
                "Channel" => self.channel = u8::from_str_radix(value, 16).ok(),
                "Channel Page" => self.channel_page = u8::from_str_radix(value, 16).ok(),
                "Pan ID" => self.pan_id = u16::from_str_radix(value, 16).ok(),
                "Addr" => self.addr = u64::from_str_radix(value, 16).ok(),
                "LQI" => self.lqi = u8::from_str_radix(value, 16).ok(),
                "PairID" => self.pair_id = Some(value.to_string()),
                _ => (),
            }
        }

        true
    }

    /// Close the block and yield the descriptor if all mandatory fields
    /// (channel, page, PAN id, address) were populated.
    pub fn finish(&mut self) -> Option<PanDesc> {
        if !self.active {
            return None;
        }

        self.active = false;

        let desc = PanDesc {
            channel: self.channel?,
            channel_page: self.channel_page?,
            pan_id: self.pan_id?,
            addr: self.addr?,
            lqi: self.lqi,
            pair_id: self.pair_id.take(),
        };

        Some(desc)
    }
}

/// An inbound UDP datagram delivered by `ERXUDP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxUdp {
    pub sender: String,
    pub dest: String,
    pub rport: u16,
    pub lport: u16,
    pub sender_lla: String,
    pub secured: bool,
    pub data: Vec<u8>,
}

impl RxUdp {
    /// Parse an `ERXUDP` line. In ASCII payload mode the data column is
    /// inline hex; in binary mode the line only announces the byte count
    /// and `data` is filled in from the following payload frame.
    pub fn parse(line: &str, binary_payload: bool) -> Option<RxUdp> {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if tokens.first() != Some(&"ERXUDP") || tokens.len() < 8 {
            return None;
        }

        let data = if binary_payload {
            Vec::new()
        } else {
            let data = hex::decode(tokens.last()?).ok()?;
            let announced = usize::from_str_radix(tokens[tokens.len() - 2], 16).ok()?;

            if data.len() != announced {
                return None;
            }

            data
        };

        Some(RxUdp {
            sender: tokens[1].to_string(),
            dest: tokens[2].to_string(),
            rport: u16::from_str_radix(tokens[3], 16).ok()?,
            lport: u16::from_str_radix(tokens[4], 16).ok()?,
            sender_lla: tokens[5].to_string(),
            secured: tokens[6] == "1" || tokens[6] == "01",
            data,
        })
    }
}
