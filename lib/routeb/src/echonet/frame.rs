//! ECHONET Lite frame layout:
//!
//! ```text
//! EHD1=0x10 EHD2=0x81 TID(2) SEOJ(3) DEOJ(3) ESV(1) OPC(1) {EPC(1) PDC(1) EDT(PDC)}*
//! ```

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

pub const EHD1: u8 = 0x10;
pub const EHD2: u8 = 0x81;

/// Management controller object, the Route-B client side.
pub const EOJ_CONTROLLER: [u8; 3] = [0x05, 0xFF, 0x01];
/// Low-voltage smart electric energy meter object.
pub const EOJ_METER: [u8; 3] = [0x02, 0x88, 0x01];

/// ECHONET Lite service codes used on Route B.
pub mod esv {
    /// Property write request (with acknowledgement).
    pub const SET_C: u8 = 0x61;
    /// Property read request.
    pub const GET: u8 = 0x62;
    /// Property write response.
    pub const SET_RES: u8 = 0x71;
    /// Property read response.
    pub const GET_RES: u8 = 0x72;
    /// Property write not possible.
    pub const SET_SNA: u8 = 0x51;
    /// Property read not possible.
    pub const GET_SNA: u8 = 0x52;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElProperty {
    pub epc: u8,
    pub edt: Vec<u8>,
}

impl ElProperty {
    #[inline]
    pub fn request(epc: u8) -> ElProperty {
        ElProperty { epc, edt: Vec::new() }
    }

    #[inline]
    pub fn with_edt(epc: u8, edt: Vec<u8>) -> ElProperty {
        ElProperty { epc, edt }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElFrame {
    pub tid: u16,
    pub seoj: [u8; 3],
    pub deoj: [u8; 3],
    pub esv: u8,
    pub props: Vec<ElProperty>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// EHD1/EHD2 are not the ECHONET Lite format-1 magic.
    BadHeader,
    /// The byte count does not cover the advertised properties.
    Truncated,
}

impl ElFrame {
    /// Request frame from the controller to the meter.
    #[inline]
    pub fn request(tid: u16, esv: u8, props: Vec<ElProperty>) -> ElFrame {
        ElFrame {
            tid,
            seoj: EOJ_CONTROLLER,
            deoj: EOJ_METER,
            esv,
            props,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.props.len() * 2);

        buf.write_u8(EHD1).unwrap();
        buf.write_u8(EHD2).unwrap();
        buf.write_u16::<BigEndian>(self.tid).unwrap();
        buf.extend_from_slice(&self.seoj);
        buf.extend_from_slice(&self.deoj);
        buf.write_u8(self.esv).unwrap();
        buf.write_u8(self.props.len() as u8).unwrap();

        for prop in &self.props {
            buf.write_u8(prop.epc).unwrap();
            buf.write_u8(prop.edt.len() as u8).unwrap();
            buf.extend_from_slice(&prop.edt);
        }

        buf
    }

    pub fn decode(data: &[u8]) -> Result<ElFrame, FrameError> {
        let mut cursor = Cursor::new(data);

        let ehd1 = cursor.read_u8().map_err(|_| FrameError::Truncated)?;
        let ehd2 = cursor.read_u8().map_err(|_| FrameError::Truncated)?;

        if ehd1 != EHD1 || ehd2 != EHD2 {
            return Err(FrameError::BadHeader);
        }

        let tid = cursor.read_u16::<BigEndian>().map_err(|_| FrameError::Truncated)?;

        let mut seoj = [0u8; 3];
        let mut deoj = [0u8; 3];
        cursor.read_exact(&mut seoj).map_err(|_| FrameError::Truncated)?;
        cursor.read_exact(&mut deoj).map_err(|_| FrameError::Truncated)?;

        let esv = cursor.read_u8().map_err(|_| FrameError::Truncated)?;
        let opc = cursor.read_u8().map_err(|_| FrameError::Truncated)?;

        let mut props = Vec::with_capacity(opc as usize);

        for _ in 0..opc {
            let epc = cursor.read_u8().map_err(|_| FrameError::Truncated)?;
            let pdc = cursor.read_u8().map_err(|_| FrameError::Truncated)?;

            let mut edt = vec![0u8; pdc as usize];
            cursor.read_exact(&mut edt).map_err(|_| FrameError::Truncated)?;

            props.push(ElProperty { epc, edt });
        }

        Ok(ElFrame { tid, seoj, deoj, esv, props })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_get_request() {
        // Get instantaneous power, the canonical single-property request.
        let frame = ElFrame::request(0x0001, esv::GET, vec![ElProperty::request(0xE7)]);

        assert_eq!(
            frame.encode(),
            vec![0x10, 0x81, 0x00, 0x01, 0x05, 0xFF, 0x01, 0x02, 0x88, 0x01, 0x62, 0x01, 0xE7, 0x00]
        );
    }

    #[test]
    fn test_decode_get_response() {
        let raw = [
            0x10, 0x81, 0x00, 0x01, 0x02, 0x88, 0x01, 0x05, 0xFF, 0x01, 0x72, 0x01, 0xE7, 0x04,
            0x00, 0x00, 0x01, 0xF4,
        ];

        let frame = ElFrame::decode(&raw).unwrap();

        assert_eq!(frame.tid, 0x0001);
        assert_eq!(frame.seoj, EOJ_METER);
        assert_eq!(frame.deoj, EOJ_CONTROLLER);
        assert_eq!(frame.esv, esv::GET_RES);
        assert_eq!(frame.props.len(), 1);
        assert_eq!(frame.props[0].epc, 0xE7);
        assert_eq!(frame.props[0].edt, vec![0x00, 0x00, 0x01, 0xF4]);
    }

    #[test]
    fn test_decode_rejects_foreign_header() {
        let raw = [0x10, 0x82, 0x00, 0x01, 0x05, 0xFF, 0x01, 0x02, 0x88, 0x01, 0x62, 0x00];

        assert_eq!(ElFrame::decode(&raw), Err(FrameError::BadHeader));
    }

    #[test]
    fn test_decode_rejects_truncated_property() {
        let raw = [
            0x10, 0x81, 0x00, 0x01, 0x02, 0x88, 0x01, 0x05, 0xFF, 0x01, 0x72, 0x01, 0xE7, 0x04,
            0x00, 0x00,
        ];

        assert_eq!(ElFrame::decode(&raw), Err(FrameError::Truncated));
    }

    #[test]
    fn test_roundtrip_multi_property() {
        let frame = ElFrame::request(
            0xBEEF,
            esv::GET,
            vec![
                ElProperty::request(0xE7),
                ElProperty::request(0xD3),
                ElProperty::with_edt(0xE5, vec![0x03]),
            ],
        );

        assert_eq!(ElFrame::decode(&frame.encode()), Ok(frame));
    }
}
