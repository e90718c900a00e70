//! Wire message types and the fixed-width payload codecs that travel in them.

use crate::NetError;

/// A frame's one-byte type tag. Unknown tags are not an error at the framing layer; a peer may
/// send a tag this build doesn't recognize and the dispatcher logs and ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    ResourceReport = 1,
    Ping = 2,
    Pong = 3,
    Shutdown = 4,
    Config = 5,
}

impl MsgType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::ResourceReport),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            4 => Some(Self::Shutdown),
            5 => Some(Self::Config),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Payload of a `RESOURCE_REPORT` frame: 12 bytes, big-endian `u64 ram_bytes` then `u32
/// threads`. The peer's IP is inferred from the socket, not carried in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceReportPayload {
    pub ram_bytes: u64,
    pub threads: u32,
}

impl ResourceReportPayload {
    pub const WIRE_LEN: usize = 12;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        buf[0..8].copy_from_slice(&self.ram_bytes.to_be_bytes());
        buf[8..12].copy_from_slice(&self.threads.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, NetError> {
        if buf.len() != Self::WIRE_LEN {
            return Err(NetError::InvalidPayloadSize {
                expected: Self::WIRE_LEN,
                actual: buf.len(),
            });
        }
        let ram_bytes = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let threads = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        Ok(Self { ram_bytes, threads })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn resource_report_round_trips() {
        for (ram, threads) in [(0u64, 0u32), (1, 1), (u64::MAX, u32::MAX), (17_179_869_184, 16)] {
            let payload = ResourceReportPayload { ram_bytes: ram, threads };
            let decoded = ResourceReportPayload::decode(&payload.encode()).unwrap();
            assert_eq!(payload, decoded);
        }
    }

    #[test]
    fn resource_report_rejects_wrong_size() {
        assert!(matches!(
            ResourceReportPayload::decode(&[0u8; 11]),
            Err(NetError::InvalidPayloadSize { expected: 12, actual: 11 })
        ));
    }

    #[test]
    fn msg_type_round_trips_known_tags() {
        for t in [MsgType::ResourceReport, MsgType::Ping, MsgType::Pong, MsgType::Shutdown, MsgType::Config] {
            assert_eq!(MsgType::from_u8(t.as_u8()), Some(t));
        }
        assert_eq!(MsgType::from_u8(200), None);
    }
}
