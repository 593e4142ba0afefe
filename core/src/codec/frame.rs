use crate::codec::varint::{read_uvarint, write_uvarint};
use crate::crypto::hash;
use crate::error::{CoreError, Result};

/// Wire magic: "LR".
pub const FRAME_MAGIC: u16 = 0x4C52;
pub const FRAME_VERSION: u8 = 1;

const FLAG_DICTIONARY: u8 = 0b0000_0001;
const FLAG_FRAGMENT: u8 = 0b0000_0010;
const FLAG_SIGNATURE: u8 = 0b0000_0100;

/// Frame type tags, one per mesh message family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Transaction = 1,
    Block = 2,
    Proof = 3,
    Routing = 4,
    Hello = 5,
    Fragment = 6,
    Ack = 7,
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => FrameKind::Transaction,
            2 => FrameKind::Block,
            3 => FrameKind::Proof,
            4 => FrameKind::Routing,
            5 => FrameKind::Hello,
            6 => FrameKind::Fragment,
            7 => FrameKind::Ack,
            other => {
                return Err(CoreError::Protocol(format!(
                    "unknown frame kind {:#x}",
                    other
                )))
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameKind::Transaction => "transaction",
            FrameKind::Block => "block",
            FrameKind::Proof => "proof",
            FrameKind::Routing => "routing",
            FrameKind::Hello => "hello",
            FrameKind::Fragment => "fragment",
            FrameKind::Ack => "ack",
        }
    }
}

/// Fragment addressing inside a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    pub index: u32,
    pub total: u32,
    pub message_id: u64,
}

/// One radio frame.
///
/// Layout: magic, version, kind, compression tag, flags,
/// varint original-size, 4-byte checksum (blake3 prefix of the original
/// payload), optional varint dictionary id, optional fragment triple,
/// varint payload length, payload, optional 64-byte signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub compression: u8,
    pub original_size: u64,
    pub checksum: [u8; 4],
    pub dictionary_id: Option<u32>,
    pub fragment: Option<FragmentInfo>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; 64]>,
}

impl Frame {
    /// Checksum over the original (pre-compression) payload bytes.
    pub fn checksum_of(original: &[u8]) -> [u8; 4] {
        let digest = hash::blake(original);
        [digest[0], digest[1], digest[2], digest[3]]
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 32);
        out.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
        out.push(FRAME_VERSION);
        out.push(self.kind as u8);
        out.push(self.compression);

        let mut flags = 0u8;
        if self.dictionary_id.is_some() {
            flags |= FLAG_DICTIONARY;
        }
        if self.fragment.is_some() {
            flags |= FLAG_FRAGMENT;
        }
        if self.signature.is_some() {
            flags |= FLAG_SIGNATURE;
        }
        out.push(flags);

        write_uvarint(&mut out, self.original_size);
        out.extend_from_slice(&self.checksum);

        if let Some(dict_id) = self.dictionary_id {
            write_uvarint(&mut out, dict_id as u64);
        }
        if let Some(frag) = &self.fragment {
            write_uvarint(&mut out, frag.index as u64);
            write_uvarint(&mut out, frag.total as u64);
            out.extend_from_slice(&frag.message_id.to_be_bytes());
        }

        write_uvarint(&mut out, self.payload.len() as u64);
        out.extend_from_slice(&self.payload);

        if let Some(sig) = &self.signature {
            out.extend_from_slice(sig);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 9 {
            return Err(CoreError::Protocol("frame too short".into()));
        }
        let magic = u16::from_be_bytes([buf[0], buf[1]]);
        if magic != FRAME_MAGIC {
            return Err(CoreError::Protocol(format!("bad magic {:#06x}", magic)));
        }
        let version = buf[2];
        if version != FRAME_VERSION {
            return Err(CoreError::Protocol(format!(
                "unknown frame version {}",
                version
            )));
        }
        let kind = FrameKind::from_u8(buf[3])?;
        let compression = buf[4];
        let flags = buf[5];
        let mut offset = 6usize;

        let (original_size, n) = read_uvarint(buf, offset)?;
        offset += n;

        let checksum: [u8; 4] = buf
            .get(offset..offset + 4)
            .ok_or_else(|| CoreError::Protocol("truncated checksum".into()))?
            .try_into()
            .unwrap();
        offset += 4;

        let dictionary_id = if flags & FLAG_DICTIONARY != 0 {
            let (id, n) = read_uvarint(buf, offset)?;
            offset += n;
            if id > u32::MAX as u64 {
                return Err(CoreError::Protocol("dictionary id out of range".into()));
            }
            Some(id as u32)
        } else {
            None
        };

        let fragment = if flags & FLAG_FRAGMENT != 0 {
            let (index, n) = read_uvarint(buf, offset)?;
            offset += n;
            let (total, n) = read_uvarint(buf, offset)?;
            offset += n;
            let id_bytes: [u8; 8] = buf
                .get(offset..offset + 8)
                .ok_or_else(|| CoreError::Protocol("truncated fragment id".into()))?
                .try_into()
                .unwrap();
            offset += 8;
            if index >= total || total == 0 || total > u32::MAX as u64 {
                return Err(CoreError::Protocol(format!(
                    "invalid fragment position {}/{}",
                    index, total
                )));
            }
            Some(FragmentInfo {
                index: index as u32,
                total: total as u32,
                message_id: u64::from_be_bytes(id_bytes),
            })
        } else {
            None
        };

        let (payload_len, n) = read_uvarint(buf, offset)?;
        offset += n;
        let payload_len = payload_len as usize;
        let payload = buf
            .get(offset..offset + payload_len)
            .ok_or_else(|| CoreError::Protocol("truncated payload".into()))?
            .to_vec();
        offset += payload_len;

        let signature = if flags & FLAG_SIGNATURE != 0 {
            let sig: [u8; 64] = buf
                .get(offset..offset + 64)
                .ok_or_else(|| CoreError::Protocol("truncated signature".into()))?
                .try_into()
                .unwrap();
            offset += 64;
            Some(sig)
        } else {
            None
        };

        if offset != buf.len() {
            return Err(CoreError::Protocol(format!(
                "{} trailing bytes after frame",
                buf.len() - offset
            )));
        }

        Ok(Self {
            kind,
            compression,
            original_size,
            checksum,
            dictionary_id,
            fragment,
            payload,
            signature,
        })
    }

    /// The bytes a frame signature covers: everything up to the payload,
    /// plus the payload itself.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        unsigned.encode()
    }
}
