//! Telemetry message framing for the UDP fan-out.
//!
//! One datagram carries one frame: `{ type:u32, len:u32, body[len] }`,
//! little-endian. The body layouts for queue, link and engine snapshots are
//! fixed-width so a dashboard can decode without a schema.

use crate::engine::{EngineState, StateCounts};
use crate::error::{Error, Result};
use crate::link::LinkState;
use crate::seq::SeqNo;

pub const FRAME_HDR_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TelemetryType {
    Heap = 0,
    HashTbl = 1,
    Thread = 2,
    Multiplexer = 3,
    Socket = 4,
    Queue = 5,
    Engine = 6,
    Link = 7,
    DbEnv = 8,
    DbHost = 9,
    Db = 10,
}

impl TryFrom<u32> for TelemetryType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => TelemetryType::Heap,
            1 => TelemetryType::HashTbl,
            2 => TelemetryType::Thread,
            3 => TelemetryType::Multiplexer,
            4 => TelemetryType::Socket,
            5 => TelemetryType::Queue,
            6 => TelemetryType::Engine,
            7 => TelemetryType::Link,
            8 => TelemetryType::DbEnv,
            9 => TelemetryType::DbHost,
            10 => TelemetryType::Db,
            _ => return Err(Error::Corrupt("unknown telemetry type")),
        })
    }
}

/// Encodes one frame into `out` (one datagram's worth of bytes).
pub fn encode_frame(type_id: TelemetryType, body: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| Error::PayloadTooLarge)?;
    out.clear();
    out.reserve(FRAME_HDR_LEN + body.len());
    out.extend_from_slice(&(type_id as u32).to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(())
}

/// Decodes one datagram into its type and body.
pub fn decode_frame(buf: &[u8]) -> Result<(TelemetryType, &[u8])> {
    if buf.len() < FRAME_HDR_LEN {
        return Err(Error::Corrupt("telemetry frame shorter than header"));
    }
    let type_id = u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes"));
    let len = u32::from_le_bytes(buf[4..8].try_into().expect("4 bytes")) as usize;
    if FRAME_HDR_LEN + len != buf.len() {
        return Err(Error::Corrupt("telemetry frame length mismatch"));
    }
    Ok((TelemetryType::try_from(type_id)?, &buf[FRAME_HDR_LEN..]))
}

/// Point-in-time snapshot of one sequence queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueTelemetry {
    pub link_id: u32,
    pub head: SeqNo,
    pub tail: SeqNo,
    pub count: u64,
    pub seq_len: u64,
    pub bytes: u64,
}

impl QueueTelemetry {
    pub const LEN: usize = 44;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&self.link_id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.head.to_le_bytes());
        buf[12..20].copy_from_slice(&self.tail.to_le_bytes());
        buf[20..28].copy_from_slice(&self.count.to_le_bytes());
        buf[28..36].copy_from_slice(&self.seq_len.to_le_bytes());
        buf[36..44].copy_from_slice(&self.bytes.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::LEN {
            return Err(Error::Corrupt("queue telemetry length mismatch"));
        }
        Ok(Self {
            link_id: u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
            head: u64::from_le_bytes(buf[4..12].try_into().expect("8 bytes")),
            tail: u64::from_le_bytes(buf[12..20].try_into().expect("8 bytes")),
            count: u64::from_le_bytes(buf[20..28].try_into().expect("8 bytes")),
            seq_len: u64::from_le_bytes(buf[28..36].try_into().expect("8 bytes")),
            bytes: u64::from_le_bytes(buf[36..44].try_into().expect("8 bytes")),
        })
    }
}

fn link_state_code(state: LinkState) -> u8 {
    match state {
        LinkState::Down => 0,
        LinkState::Disabled => 1,
        LinkState::Connecting => 2,
        LinkState::Disconnecting => 3,
        LinkState::ConnectPending => 4,
        LinkState::DisconnectPending => 5,
        LinkState::Up => 6,
        LinkState::ReconnectPending => 7,
        LinkState::Reconnecting => 8,
        LinkState::Failed => 9,
        LinkState::Deleted => 10,
    }
}

/// Point-in-time snapshot of one link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkTelemetry {
    pub id: u32,
    pub state: u8,
    pub reconnects: u32,
    pub rx_seq: SeqNo,
    pub tx_seq: SeqNo,
}

impl LinkTelemetry {
    pub const LEN: usize = 25;

    pub fn new(id: u32, state: LinkState, reconnects: u32, rx_seq: SeqNo, tx_seq: SeqNo) -> Self {
        Self {
            id,
            state: link_state_code(state),
            reconnects,
            rx_seq,
            tx_seq,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4] = self.state;
        buf[5..9].copy_from_slice(&self.reconnects.to_le_bytes());
        buf[9..17].copy_from_slice(&self.rx_seq.to_le_bytes());
        buf[17..25].copy_from_slice(&self.tx_seq.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::LEN {
            return Err(Error::Corrupt("link telemetry length mismatch"));
        }
        Ok(Self {
            id: u32::from_le_bytes(buf[0..4].try_into().expect("4 bytes")),
            state: buf[4],
            reconnects: u32::from_le_bytes(buf[5..9].try_into().expect("4 bytes")),
            rx_seq: u64::from_le_bytes(buf[9..17].try_into().expect("8 bytes")),
            tx_seq: u64::from_le_bytes(buf[17..25].try_into().expect("8 bytes")),
        })
    }
}

fn engine_state_code(state: EngineState) -> u8 {
    match state {
        EngineState::Stopped => 0,
        EngineState::Starting => 1,
        EngineState::Running => 2,
        EngineState::Stopping => 3,
        EngineState::StartPending => 4,
        EngineState::StopPending => 5,
    }
}

/// Point-in-time snapshot of an engine and its per-state link counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineTelemetry {
    pub state: u8,
    pub links: u32,
    pub down: u32,
    pub disabled: u32,
    pub transient: u32,
    pub up: u32,
    pub reconn: u32,
    pub failed: u32,
}

impl EngineTelemetry {
    pub const LEN: usize = 29;

    pub fn new(state: EngineState, counts: &StateCounts) -> Self {
        Self {
            state: engine_state_code(state),
            links: counts.total() as u32,
            down: counts.down as u32,
            disabled: counts.disabled as u32,
            transient: counts.transient as u32,
            up: counts.up as u32,
            reconn: counts.reconn as u32,
            failed: counts.failed as u32,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.state;
        buf[1..5].copy_from_slice(&self.links.to_le_bytes());
        buf[5..9].copy_from_slice(&self.down.to_le_bytes());
        buf[9..13].copy_from_slice(&self.disabled.to_le_bytes());
        buf[13..17].copy_from_slice(&self.transient.to_le_bytes());
        buf[17..21].copy_from_slice(&self.up.to_le_bytes());
        buf[21..25].copy_from_slice(&self.reconn.to_le_bytes());
        buf[25..29].copy_from_slice(&self.failed.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != Self::LEN {
            return Err(Error::Corrupt("engine telemetry length mismatch"));
        }
        Ok(Self {
            state: buf[0],
            links: u32::from_le_bytes(buf[1..5].try_into().expect("4 bytes")),
            down: u32::from_le_bytes(buf[5..9].try_into().expect("4 bytes")),
            disabled: u32::from_le_bytes(buf[9..13].try_into().expect("4 bytes")),
            transient: u32::from_le_bytes(buf[13..17].try_into().expect("4 bytes")),
            up: u32::from_le_bytes(buf[17..21].try_into().expect("4 bytes")),
            reconn: u32::from_le_bytes(buf[21..25].try_into().expect("4 bytes")),
            failed: u32::from_le_bytes(buf[25..29].try_into().expect("4 bytes")),
        })
    }
}
