//! Random-write raft payload codec
//!
//! New entries are always encoded as v3:
//!
//! ```text
//!  0  magic     u32  (0xF3)
//!  4  opcode    u8
//!  5  extent_id u64
//! 13  offset    u64
//! 21  size      u64
//! 29  crc       u32
//! 33  data      [size]
//! ```
//!
//! Logs written by older nodes may still hold the v1 binary form (magic
//! `0xFF`, same field order, data read as a stream) or the JSON envelope
//! `{"op": u32, "k": bytes, "v": bytes}` whose `v` is the v1 body without
//! magic and opcode. All three decode to the same command.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use cubefs_common::{Error, Opcode, Result};
use serde::Deserialize;

pub const RANDOM_WRITE_MAGIC_V3: u32 = 0xF3;
pub const BINARY_MARSHAL_MAGIC: u32 = 0xFF;
pub const RANDOM_WRITE_V3_HEADER_SIZE: usize = 33;

/// v1 body after magic and opcode: eid, off, size, crc
const V1_BODY_HEADER_SIZE: usize = 28;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RandomWriteCommand {
    pub opcode: Opcode,
    pub extent_id: u64,
    pub offset: u64,
    pub size: u64,
    pub crc: u32,
    pub data: Bytes,
}

#[derive(Deserialize)]
struct LegacyRaftCmd {
    op: u32,
    #[serde(default)]
    v: Option<String>,
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Deserialization(format!(
                "random write payload truncated: need {n}, have {}",
                self.buf.len()
            )));
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(b))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }
}

impl RandomWriteCommand {
    pub fn new(opcode: Opcode, extent_id: u64, offset: u64, data: Bytes, crc: u32) -> Self {
        Self {
            opcode,
            extent_id,
            offset,
            size: data.len() as u64,
            crc,
            data,
        }
    }

    pub const fn is_sync(&self) -> bool {
        matches!(self.opcode, Opcode::SyncRandomWrite)
    }

    /// Encode as v3
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(RANDOM_WRITE_V3_HEADER_SIZE + self.data.len());
        buf.put_u32(RANDOM_WRITE_MAGIC_V3);
        buf.put_u8(self.opcode.as_u8());
        buf.put_u64(self.extent_id);
        buf.put_u64(self.offset);
        buf.put_u64(self.size);
        buf.put_u32(self.crc);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Decode any of the three payload generations
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() >= 4 {
            let mut r = Reader { buf: raw };
            match r.u32()? {
                RANDOM_WRITE_MAGIC_V3 => return Self::decode_v3(raw),
                BINARY_MARSHAL_MAGIC => {
                    let opcode = Opcode::try_from(r.u8()?)?;
                    return Self::decode_body(opcode, r.buf);
                }
                _ => {}
            }
        }
        Self::decode_json(raw)
    }

    fn decode_v3(raw: &[u8]) -> Result<Self> {
        if raw.len() < RANDOM_WRITE_V3_HEADER_SIZE {
            return Err(Error::Deserialization(format!(
                "random write v3 header truncated: {}",
                raw.len()
            )));
        }
        let mut r = Reader { buf: &raw[4..] };
        let opcode = Opcode::try_from(r.u8()?)?;
        let extent_id = r.u64()?;
        let offset = r.u64()?;
        let size = r.u64()?;
        let crc = r.u32()?;
        if u64::try_from(r.buf.len()).ok() != Some(size) {
            return Err(Error::Deserialization(format!(
                "random write v3 body is {} bytes, header says {size}",
                r.buf.len()
            )));
        }
        Ok(Self {
            opcode,
            extent_id,
            offset,
            size,
            crc,
            data: Bytes::copy_from_slice(r.buf),
        })
    }

    /// `eid, off, size, crc, data` as written by v1 and the JSON envelope.
    /// Data is read like a stream: a short body yields what is there.
    fn decode_body(opcode: Opcode, body: &[u8]) -> Result<Self> {
        if body.len() < V1_BODY_HEADER_SIZE {
            return Err(Error::Deserialization(format!(
                "random write v1 body truncated: {}",
                body.len()
            )));
        }
        let mut r = Reader { buf: body };
        let extent_id = r.u64()?;
        let offset = r.u64()?;
        let size = r.u64()?;
        let crc = r.u32()?;
        let n = usize::try_from(size).map_or(r.buf.len(), |s| s.min(r.buf.len()));
        let data = Bytes::copy_from_slice(&r.buf[..n]);
        Ok(Self {
            opcode,
            extent_id,
            offset,
            size: data.len() as u64,
            crc,
            data,
        })
    }

    fn decode_json(raw: &[u8]) -> Result<Self> {
        let cmd: LegacyRaftCmd = serde_json::from_slice(raw)
            .map_err(|e| Error::Deserialization(format!("random write payload: {e}")))?;
        let opcode = u8::try_from(cmd.op)
            .map_err(|_| Error::Deserialization(format!("opcode {} out of range", cmd.op)))
            .and_then(Opcode::try_from)?;
        let body = STANDARD
            .decode(cmd.v.unwrap_or_default())
            .map_err(|e| Error::Deserialization(format!("random write payload value: {e}")))?;
        Self::decode_body(opcode, &body)
    }
}
