//! Minimal LLRP 1.1 wire codec.
//!
//! Only the messages and parameters this service touches are modeled:
//! reader configuration, the ROSpec lifecycle, tag reports, and
//! keepalives. Everything else on the wire is skipped by length and never
//! treated as a hard failure.

use bytes::{BufMut, Bytes, BytesMut};

use tagstream_core::reader::PowerLevel;
use tagstream_core::MIN_SIGNAL_STRENGTH;

use crate::error::LlrpError;

/// Protocol version bits for LLRP 1.1.
pub const LLRP_VERSION: u8 = 2;

/// The single ROSpec this service installs on every reader.
pub const ROSPEC_ID: u32 = 1;

pub const MSG_SET_READER_CONFIG: u16 = 3;
pub const MSG_SET_READER_CONFIG_RESPONSE: u16 = 13;
pub const MSG_CLOSE_CONNECTION: u16 = 14;
pub const MSG_ADD_ROSPEC: u16 = 20;
pub const MSG_START_ROSPEC: u16 = 22;
pub const MSG_ENABLE_ROSPEC: u16 = 24;
pub const MSG_ADD_ROSPEC_RESPONSE: u16 = 30;
pub const MSG_START_ROSPEC_RESPONSE: u16 = 32;
pub const MSG_ENABLE_ROSPEC_RESPONSE: u16 = 34;
pub const MSG_RO_ACCESS_REPORT: u16 = 61;
pub const MSG_KEEPALIVE: u16 = 62;
pub const MSG_READER_EVENT_NOTIFICATION: u16 = 63;
pub const MSG_KEEPALIVE_ACK: u16 = 72;

const PARAM_RO_SPEC: u16 = 177;
const PARAM_RO_BOUNDARY_SPEC: u16 = 178;
const PARAM_RO_SPEC_START_TRIGGER: u16 = 179;
const PARAM_RO_SPEC_STOP_TRIGGER: u16 = 182;
const PARAM_AI_SPEC: u16 = 183;
const PARAM_AI_SPEC_STOP_TRIGGER: u16 = 184;
const PARAM_INVENTORY_PARAMETER_SPEC: u16 = 186;
const PARAM_ANTENNA_CONFIGURATION: u16 = 222;
const PARAM_RF_TRANSMITTER: u16 = 224;
const PARAM_TAG_REPORT_DATA: u16 = 240;
const PARAM_EPC_DATA: u16 = 241;
const PARAM_LLRP_STATUS: u16 = 287;

const TV_PEAK_RSSI: u8 = 6;
const TV_EPC_96: u8 = 13;

/// EPCGlobalClass1Gen2 air protocol id.
const AIR_PROTOCOL_C1G2: u8 = 1;

/// Frames larger than this are rejected as malformed.
const MAX_MESSAGE_LEN: u32 = 1 << 20;

/// Decoded message header: 10 bytes on the wire.
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    pub version: u8,
    pub msg_type: u16,
    pub msg_len: u32,
    pub msg_id: u32,
}

/// One EPC sighting extracted from a RO_ACCESS_REPORT.
#[derive(Debug, Clone, PartialEq)]
pub struct TagReport {
    pub epc: String,
    pub peak_rssi: Option<i8>,
}

pub fn encode_message(msg_type: u16, msg_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(10 + payload.len());
    buf.put_u16(((LLRP_VERSION as u16) << 10) | (msg_type & 0x03FF));
    buf.put_u32((10 + payload.len()) as u32);
    buf.put_u32(msg_id);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn decode_header(raw: &[u8; 10]) -> Result<MessageHeader, LlrpError> {
    let type_field = u16::from_be_bytes([raw[0], raw[1]]);
    let msg_len = u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]);
    if msg_len < 10 {
        return Err(LlrpError::Malformed("message length below header size"));
    }
    if msg_len > MAX_MESSAGE_LEN {
        return Err(LlrpError::Malformed("message length exceeds limit"));
    }

    Ok(MessageHeader {
        version: ((type_field >> 10) & 0x07) as u8,
        msg_type: type_field & 0x03FF,
        msg_len,
        msg_id: u32::from_be_bytes([raw[6], raw[7], raw[8], raw[9]]),
    })
}

/// SET_READER_CONFIG payload applying transmit power for antenna 1.
///
/// Transmit power goes on the wire as an index into the reader's power
/// table; the index is derived from the level's upper dBm bound offset
/// from the minimum supported signal.
pub fn set_reader_config(power_level: PowerLevel) -> Bytes {
    let mut rf = BytesMut::new();
    rf.put_u16(1); // HopTableID
    rf.put_u16(1); // ChannelIndex
    rf.put_u16(transmit_power_index(power_level));

    let mut antenna = BytesMut::new();
    antenna.put_u16(1); // AntennaID
    put_tlv(&mut antenna, PARAM_RF_TRANSMITTER, &rf);

    let mut payload = BytesMut::new();
    payload.put_u8(0); // ResetToFactoryDefault off
    put_tlv(&mut payload, PARAM_ANTENNA_CONFIGURATION, &antenna);
    payload.freeze()
}

fn transmit_power_index(power_level: PowerLevel) -> u16 {
    let (_, max_dbm) = power_level.dbm_range();
    (max_dbm - MIN_SIGNAL_STRENGTH) as u16
}

/// ADD_ROSPEC payload: one disabled ROSpec with an immediate start
/// trigger, no stop triggers, antenna 1, EPCGlobal Class-1 Gen-2.
pub fn add_rospec() -> Bytes {
    let mut start_trigger = BytesMut::new();
    start_trigger.put_u8(1); // Immediate

    let mut stop_trigger = BytesMut::new();
    stop_trigger.put_u8(0); // Null
    stop_trigger.put_u32(0);

    let mut boundary = BytesMut::new();
    put_tlv(&mut boundary, PARAM_RO_SPEC_START_TRIGGER, &start_trigger);
    put_tlv(&mut boundary, PARAM_RO_SPEC_STOP_TRIGGER, &stop_trigger);

    let mut ai_stop = BytesMut::new();
    ai_stop.put_u8(0); // Null
    ai_stop.put_u32(0);

    let mut inventory = BytesMut::new();
    inventory.put_u16(1); // InventoryParameterSpecID
    inventory.put_u8(AIR_PROTOCOL_C1G2);

    let mut ai_spec = BytesMut::new();
    ai_spec.put_u16(1); // antenna count
    ai_spec.put_u16(1); // antenna id
    put_tlv(&mut ai_spec, PARAM_AI_SPEC_STOP_TRIGGER, &ai_stop);
    put_tlv(&mut ai_spec, PARAM_INVENTORY_PARAMETER_SPEC, &inventory);

    let mut rospec = BytesMut::new();
    rospec.put_u32(ROSPEC_ID);
    rospec.put_u8(0); // priority
    rospec.put_u8(0); // CurrentState = Disabled
    put_tlv(&mut rospec, PARAM_RO_BOUNDARY_SPEC, &boundary);
    put_tlv(&mut rospec, PARAM_AI_SPEC, &ai_spec);

    let mut payload = BytesMut::new();
    put_tlv(&mut payload, PARAM_RO_SPEC, &rospec);
    payload.freeze()
}

/// ENABLE_ROSPEC / START_ROSPEC payload.
pub fn rospec_id_payload(rospec_id: u32) -> Bytes {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u32(rospec_id);
    payload.freeze()
}

/// Verify the LLRPStatus embedded in a response payload reports success.
pub fn check_status(payload: &[u8]) -> Result<(), LlrpError> {
    for param in ParamReader::new(payload) {
        if let Param::Tlv {
            param_type: PARAM_LLRP_STATUS,
            body,
        } = param?
        {
            if body.len() < 4 {
                return Err(LlrpError::Malformed("truncated LLRPStatus"));
            }
            let code = u16::from_be_bytes([body[0], body[1]]);
            if code == 0 {
                return Ok(());
            }
            let desc_len = u16::from_be_bytes([body[2], body[3]]) as usize;
            let description = body
                .get(4..4 + desc_len)
                .map(|raw| String::from_utf8_lossy(raw).into_owned())
                .unwrap_or_default();
            return Err(LlrpError::Status { code, description });
        }
    }
    Err(LlrpError::Malformed("response without LLRPStatus"))
}

/// Extract EPC sightings from a RO_ACCESS_REPORT payload.
///
/// Parameters other than the EPC and PeakRSSI are skipped; a report entry
/// carrying no EPC at all is dropped.
pub fn decode_tag_reports(payload: &[u8]) -> Result<Vec<TagReport>, LlrpError> {
    let mut reports = Vec::new();

    for param in ParamReader::new(payload) {
        let Param::Tlv {
            param_type: PARAM_TAG_REPORT_DATA,
            body,
        } = param?
        else {
            continue;
        };

        let mut epc = None;
        let mut peak_rssi = None;
        for inner in ParamReader::new(body) {
            match inner? {
                Param::Tlv {
                    param_type: PARAM_EPC_DATA,
                    body,
                } => {
                    if body.len() < 2 {
                        return Err(LlrpError::Malformed("truncated EPCData"));
                    }
                    let bits = u16::from_be_bytes([body[0], body[1]]) as usize;
                    let nbytes = bits.div_ceil(8);
                    let raw = body
                        .get(2..2 + nbytes)
                        .ok_or(LlrpError::Malformed("EPCData shorter than bit count"))?;
                    epc = Some(hex_upper(raw));
                }
                Param::Tv {
                    param_type: TV_EPC_96,
                    value,
                } => epc = Some(hex_upper(value)),
                Param::Tv {
                    param_type: TV_PEAK_RSSI,
                    value,
                } => peak_rssi = Some(value[0] as i8),
                _ => {}
            }
        }

        if let Some(epc) = epc {
            reports.push(TagReport { epc, peak_rssi });
        }
    }

    Ok(reports)
}

/// Build a success/failure response payload. Used by reader simulators
/// and the test harness; the service itself only decodes these.
pub fn status_payload(code: u16, description: &str) -> Bytes {
    let mut status = BytesMut::new();
    status.put_u16(code);
    status.put_u16(description.len() as u16);
    status.put_slice(description.as_bytes());

    let mut payload = BytesMut::new();
    put_tlv(&mut payload, PARAM_LLRP_STATUS, &status);
    payload.freeze()
}

/// Build a RO_ACCESS_REPORT payload from (EPC hex, PeakRSSI) pairs.
/// Counterpart of [`decode_tag_reports`] for simulators and tests.
pub fn tag_report_payload(reports: &[(&str, Option<i8>)]) -> Bytes {
    let mut payload = BytesMut::new();

    for (epc_hex, rssi) in reports {
        let epc_bytes = hex_to_bytes(epc_hex);

        let mut epc_data = BytesMut::new();
        epc_data.put_u16((epc_bytes.len() * 8) as u16);
        epc_data.put_slice(&epc_bytes);

        let mut report = BytesMut::new();
        put_tlv(&mut report, PARAM_EPC_DATA, &epc_data);
        if let Some(rssi) = rssi {
            report.put_u8(0x80 | TV_PEAK_RSSI);
            report.put_i8(*rssi);
        }

        put_tlv(&mut payload, PARAM_TAG_REPORT_DATA, &report);
    }

    payload.freeze()
}

fn put_tlv(buf: &mut BytesMut, param_type: u16, body: &[u8]) {
    buf.put_u16(param_type & 0x03FF);
    buf.put_u16((4 + body.len()) as u16);
    buf.put_slice(body);
}

enum Param<'a> {
    Tlv { param_type: u16, body: &'a [u8] },
    Tv { param_type: u8, value: &'a [u8] },
}

/// Walks a parameter list, yielding TLV bodies and TV values and skipping
/// over anything it does not recognize by declared length.
struct ParamReader<'a> {
    buf: &'a [u8],
}

impl<'a> ParamReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }
}

impl<'a> Iterator for ParamReader<'a> {
    type Item = Result<Param<'a>, LlrpError>;

    fn next(&mut self) -> Option<Self::Item> {
        let buf = self.buf;
        if buf.is_empty() {
            return None;
        }

        // TV parameters carry the high bit and a fixed per-type length.
        if buf[0] & 0x80 != 0 {
            let param_type = buf[0] & 0x7F;
            let Some(value_len) = tv_value_len(param_type) else {
                self.buf = &[];
                return Some(Err(LlrpError::Malformed("unknown TV parameter type")));
            };
            if buf.len() < 1 + value_len {
                self.buf = &[];
                return Some(Err(LlrpError::Malformed("truncated TV parameter")));
            }
            self.buf = &buf[1 + value_len..];
            return Some(Ok(Param::Tv {
                param_type,
                value: &buf[1..1 + value_len],
            }));
        }

        if buf.len() < 4 {
            self.buf = &[];
            return Some(Err(LlrpError::Malformed("truncated TLV header")));
        }
        let param_type = u16::from_be_bytes([buf[0], buf[1]]) & 0x03FF;
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if len < 4 || len > buf.len() {
            self.buf = &[];
            return Some(Err(LlrpError::Malformed("TLV length out of bounds")));
        }

        self.buf = &buf[len..];
        Some(Ok(Param::Tlv {
            param_type,
            body: &buf[4..len],
        }))
    }
}

/// Fixed value sizes for the LLRP 1.1 TV parameter set.
fn tv_value_len(param_type: u8) -> Option<usize> {
    match param_type {
        1 => Some(2),        // AntennaID
        2..=5 => Some(8),    // First/LastSeenTimestamp UTC/Uptime
        6 => Some(1),        // PeakRSSI
        7 | 8 => Some(2),    // ChannelIndex, TagSeenCount
        9 => Some(4),        // ROSpecID
        10..=12 => Some(2),  // InventoryParameterSpecID, C1G2CRC, C1G2PC
        13 => Some(12),      // EPC-96
        14 | 15 | 17 => Some(2), // SpecIndex, ClientRequestOpSpecResult, OpSpecID
        16 => Some(4),       // AccessSpecID
        _ => None,
    }
}

fn hex_upper(raw: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(raw.len() * 2);
    for byte in raw {
        let _ = write!(out, "{byte:02X}");
    }
    out
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    hex.as_bytes()
        .chunks(2)
        .filter_map(|pair| {
            let s = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPC: &str = "E200123456789012345678AB";

    #[test]
    fn test_header_round_trip() {
        let frame = encode_message(MSG_ADD_ROSPEC, 7, &[1, 2, 3]);
        let header = decode_header(frame[..10].try_into().unwrap()).unwrap();
        assert_eq!(header.version, LLRP_VERSION);
        assert_eq!(header.msg_type, MSG_ADD_ROSPEC);
        assert_eq!(header.msg_len, 13);
        assert_eq!(header.msg_id, 7);
    }

    #[test]
    fn test_header_rejects_undersized_length() {
        let mut raw = [0u8; 10];
        raw[5] = 9; // length 9 < header size
        assert!(decode_header(&raw).is_err());
    }

    #[test]
    fn test_tag_report_round_trip() {
        let payload = tag_report_payload(&[(EPC, Some(-47)), (EPC, None)]);
        let reports = decode_tag_reports(&payload).unwrap();
        assert_eq!(
            reports,
            vec![
                TagReport {
                    epc: EPC.to_string(),
                    peak_rssi: Some(-47)
                },
                TagReport {
                    epc: EPC.to_string(),
                    peak_rssi: None
                },
            ]
        );
    }

    #[test]
    fn test_unknown_tlv_inside_report_is_skipped() {
        let mut payload = BytesMut::new();

        let mut epc_data = BytesMut::new();
        epc_data.put_u16(96);
        epc_data.put_slice(&hex_to_bytes(EPC));

        let mut report = BytesMut::new();
        // An unmodeled TLV (ROSpecID parameter, type 218) ahead of the EPC.
        put_tlv(&mut report, 218, &[0, 0, 0, 1]);
        put_tlv(&mut report, PARAM_EPC_DATA, &epc_data);
        report.put_u8(0x80 | TV_PEAK_RSSI);
        report.put_i8(-50);

        put_tlv(&mut payload, PARAM_TAG_REPORT_DATA, &report);

        let reports = decode_tag_reports(&payload).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].epc, EPC);
        assert_eq!(reports[0].peak_rssi, Some(-50));
    }

    #[test]
    fn test_epc96_tv_variant_decodes() {
        let mut report = BytesMut::new();
        report.put_u8(0x80 | TV_EPC_96);
        report.put_slice(&hex_to_bytes(EPC));

        let mut payload = BytesMut::new();
        put_tlv(&mut payload, PARAM_TAG_REPORT_DATA, &report);

        let reports = decode_tag_reports(&payload).unwrap();
        assert_eq!(reports[0].epc, EPC);
        assert_eq!(reports[0].peak_rssi, None);
    }

    #[test]
    fn test_report_without_epc_is_dropped() {
        let mut report = BytesMut::new();
        report.put_u8(0x80 | TV_PEAK_RSSI);
        report.put_i8(-50);

        let mut payload = BytesMut::new();
        put_tlv(&mut payload, PARAM_TAG_REPORT_DATA, &report);

        assert!(decode_tag_reports(&payload).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_tlv_is_malformed() {
        let mut payload = BytesMut::new();
        payload.put_u16(PARAM_TAG_REPORT_DATA);
        payload.put_u16(64); // claims more than present
        payload.put_u8(0);
        assert!(decode_tag_reports(&payload).is_err());
    }

    #[test]
    fn test_status_success_and_failure() {
        assert!(check_status(&status_payload(0, "")).is_ok());

        let err = check_status(&status_payload(101, "no such ROSpec")).unwrap_err();
        match err {
            LlrpError::Status { code, description } => {
                assert_eq!(code, 101);
                assert_eq!(description, "no such ROSpec");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_add_rospec_is_one_rospec_tlv() {
        let payload = add_rospec();
        let param_type = u16::from_be_bytes([payload[0], payload[1]]) & 0x03FF;
        let len = u16::from_be_bytes([payload[2], payload[3]]) as usize;
        assert_eq!(param_type, PARAM_RO_SPEC);
        assert_eq!(len, payload.len());
        // ROSpecID, priority, state prefix the body.
        assert_eq!(&payload[4..8], &ROSPEC_ID.to_be_bytes());
        assert_eq!(payload[8], 0);
        assert_eq!(payload[9], 0);
    }

    #[test]
    fn test_transmit_power_tracks_power_level() {
        let low = set_reader_config(PowerLevel::Low);
        let high = set_reader_config(PowerLevel::High);
        assert_ne!(low, high);
        // Index grows with the level's upper dBm bound.
        assert_eq!(transmit_power_index(PowerLevel::Low), 15);
        assert_eq!(transmit_power_index(PowerLevel::Medium), 35);
        assert_eq!(transmit_power_index(PowerLevel::High), 50);
    }
}
