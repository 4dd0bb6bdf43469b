//! Framing for the relay between a consumer and the microcontroller.
//!
//! The microcontroller asks for a reading by sending [`REQUEST`]. The relay answers with a
//! four byte frame `[alert, letter, number, checksum]` where the checksum is the XOR of the
//! first three bytes, and the microcontroller acknowledges with a two byte reply.

use serde::Serialize;

use crate::{protocol::Telemetry, Error, Result};

pub const REQUEST: u8 = 0xAA;
pub const ACK: u8 = 0x06;
pub const NACK: u8 = 0x15;
pub const FRAME_LEN: usize = 4;
pub const REPLY_LEN: usize = 2;

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertFrame {
    #[serde(rename = "Alert")]
    pub alert: u8,
    #[serde(rename = "position_letter")]
    pub letter: char,
    #[serde(rename = "position_number")]
    pub number: u8,
}

impl AlertFrame {
    /// `letter` must be an uppercase ASCII letter
    pub fn new(anomalous: bool, letter: char, number: u8) -> Option<Self> {
        letter.is_ascii_uppercase().then_some(Self {
            alert: anomalous as u8,
            letter,
            number,
        })
    }

    pub fn from_telemetry(telemetry: &Telemetry, letter: char, number: u8) -> Option<Self> {
        Self::new(telemetry.anomalies_present(), letter, number)
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let body = [self.alert, self.letter as u8, self.number];
        [body[0], body[1], body[2], checksum(&body)]
    }

    pub fn decode(frame: &[u8; FRAME_LEN]) -> Result<Self> {
        let expected = checksum(&frame[..3]);
        if expected != frame[3] {
            return Err(Error::Protocol(format!(
                "bad checksum: expected {expected:#04x}, got {:#04x}",
                frame[3]
            )));
        }
        if frame[0] > 1 {
            return Err(Error::Protocol(format!("bad alert byte {:#04x}", frame[0])));
        }
        Self::new(frame[0] == 1, frame[1] as char, frame[2])
            .ok_or_else(|| Error::Protocol(format!("bad position letter {:#04x}", frame[1])))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack,
    Unrecognized,
}

impl Reply {
    /// Only the first byte of a complete reply is significant
    pub fn parse(bytes: &[u8]) -> Self {
        match bytes {
            [ACK, _] => Reply::Ack,
            [NACK, _] => Reply::Nack,
            _ => Reply::Unrecognized,
        }
    }
}

/// What gets republished to the broker for each handshake
#[derive(Serialize, Debug, Clone)]
pub struct RelayRecord<'a> {
    #[serde(flatten)]
    pub frame: AlertFrame,
    #[serde(flatten)]
    pub telemetry: &'a Telemetry,
}

impl RelayRecord<'_> {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = AlertFrame::new(true, 'C', 42).unwrap();
        let bytes = frame.encode();
        assert_eq!(bytes, [1, 0x43, 42, 1 ^ 0x43 ^ 42]);
        assert_eq!(AlertFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let mut bytes = AlertFrame::new(false, 'Z', 100).unwrap().encode();
        bytes[2] ^= 0x01;
        assert!(matches!(AlertFrame::decode(&bytes), Err(Error::Protocol(_))));
        let bad_letter = [0, b'a', 3, checksum(&[0, b'a', 3])];
        assert!(AlertFrame::decode(&bad_letter).is_err());
        assert!(AlertFrame::new(false, '7', 0).is_none());
    }

    #[test]
    fn test_reply_discriminates_ack_and_nack() {
        assert_eq!(Reply::parse(&[ACK, 0x00]), Reply::Ack);
        assert_eq!(Reply::parse(&[NACK, 0x00]), Reply::Nack);
        assert_eq!(Reply::parse(&[ACK]), Reply::Unrecognized);
        assert_eq!(Reply::parse(&[0x99, 0x00]), Reply::Unrecognized);
    }

    #[test]
    fn test_alert_follows_anomalies() {
        let quiet = Telemetry::from_lines("Differences: {\"Channel 1\":{},\"Channel 2\":{}}\n");
        assert_eq!(AlertFrame::from_telemetry(&quiet, 'A', 1).unwrap().alert, 0);
        let loud =
            Telemetry::from_lines("Anomalies: {\"Channel 1\":{\"Mean\":[0.0,3.0]},\"Channel 2\":{}}\n");
        let frame = AlertFrame::from_telemetry(&loud, 'B', 2).unwrap();
        assert_eq!(frame.alert, 1);

        let json = RelayRecord {
            frame,
            telemetry: &loud,
        }
        .to_json()
        .unwrap();
        assert!(json.starts_with("{\"Alert\":1,\"position_letter\":\"B\",\"position_number\":2,"));
        assert!(json.contains("\"Stats\":null"));
    }
}
