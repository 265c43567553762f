/// Wire format for the broadcast protocol.
///
/// Five message kinds share a common 4-byte header:
///
/// ```text
/// [0]     msg_type (u8)
/// [1]     reserved (u8, zero)
/// [2..4]  payload_len (u16 LE)
/// [4..]   payload (fixed layout per kind, little-endian, packed)
/// ```
///
/// Payloads after the header:
///
/// ```text
/// SESSION_ANNOUNCE  file_id:u16  total_chunks:u32  window_size:u16
///                   chunk_size:u32  filename:[u8;64]
/// DATA_CHUNK        file_id:u16  chunk_id:u32  data_len:u16  crc:u16
///                   data:[u8;data_len]
/// STATUS_REQ        file_id:u16  window_id:u32  round_id:u16
/// NACK              file_id:u16  window_id:u32  round_id:u16  uav_id:u8
///                   missing_bitmap:u64
/// END               file_id:u16  total_chunks:u32  file_hash:u32
/// ```
///
/// Encoding is explicit byte-by-byte; no struct memory layout on the wire.
/// A frame shorter than the header, or shorter than its kind's fixed
/// portion, decodes to `None` and is silently dropped by both sides.

pub const MSG_SESSION_ANNOUNCE: u8 = 1;
pub const MSG_DATA_CHUNK: u8 = 2;
pub const MSG_STATUS_REQ: u8 = 3;
pub const MSG_NACK: u8 = 4;
pub const MSG_END: u8 = 5;

/// Common header size.
pub const HEADER_LEN: usize = 4;

/// Fixed field bytes per kind (the part before any variable payload).
pub const ANNOUNCE_LEN: usize = 2 + 4 + 2 + 4 + FILENAME_LEN;
pub const DATA_CHUNK_FIXED: usize = 2 + 4 + 2 + 2;
pub const STATUS_REQ_LEN: usize = 2 + 4 + 2;
pub const NACK_LEN: usize = 2 + 4 + 2 + 1 + 8;
pub const END_LEN: usize = 2 + 4 + 4;

/// Zero-padded fixed filename field.
pub const FILENAME_LEN: usize = 64;

/// Payload bytes per data chunk.
pub const MAX_CHUNK_SIZE: u32 = 1024;

/// Chunks per window. Must fit a 64-bit bitmap.
pub const WINDOW_SIZE: u16 = 64;

/// Largest frame the protocol produces: a full data chunk.
pub const MAX_DATAGRAM: usize = HEADER_LEN + DATA_CHUNK_FIXED + MAX_CHUNK_SIZE as usize;

/// Default multicast group and port.
pub const MULTICAST_GROUP: &str = "239.255.1.1";
pub const MULTICAST_PORT: u16 = 9000;
pub const MULTICAST_TTL: u32 = 32;

/// Receiver NACK backoff window.
pub const NACK_TIMEOUT_MS: u64 = 50;

/// Master probe interval. Must exceed the NACK backoff plus network delay
/// so a round's NACKs arrive before the snapshot.
pub const STATUS_REQ_INTERVAL_MS: u64 = 500;

/// Repair rounds per window before giving up.
pub const MAX_RETRANS_ROUNDS: u16 = 10;

/// Probes per round while some live UAV is silent.
pub const MAX_RESEND_BITMAP_ASK: u32 = 5;

/// Session announce repetitions.
pub const ANNOUNCE_REPEAT_COUNT: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAnnounce {
    pub file_id: u16,
    pub total_chunks: u32,
    pub window_size: u16,
    pub chunk_size: u32,
    pub filename: [u8; FILENAME_LEN],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub file_id: u16,
    pub chunk_id: u32,
    pub crc: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReq {
    pub file_id: u16,
    pub window_id: u32,
    pub round_id: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nack {
    pub file_id: u16,
    pub window_id: u32,
    pub round_id: u16,
    pub uav_id: u8,
    pub missing_bitmap: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct End {
    pub file_id: u16,
    pub total_chunks: u32,
    pub file_hash: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SessionAnnounce(SessionAnnounce),
    DataChunk(DataChunk),
    StatusReq(StatusReq),
    Nack(Nack),
    End(End),
}

impl Message {
    /// Serialize to wire format, header included.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::SessionAnnounce(m) => {
                let mut buf = frame(MSG_SESSION_ANNOUNCE, ANNOUNCE_LEN);
                buf.extend_from_slice(&m.file_id.to_le_bytes());
                buf.extend_from_slice(&m.total_chunks.to_le_bytes());
                buf.extend_from_slice(&m.window_size.to_le_bytes());
                buf.extend_from_slice(&m.chunk_size.to_le_bytes());
                buf.extend_from_slice(&m.filename);
                buf
            }
            Message::DataChunk(m) => {
                let mut buf = frame(MSG_DATA_CHUNK, DATA_CHUNK_FIXED + m.data.len());
                buf.extend_from_slice(&m.file_id.to_le_bytes());
                buf.extend_from_slice(&m.chunk_id.to_le_bytes());
                buf.extend_from_slice(&(m.data.len() as u16).to_le_bytes());
                buf.extend_from_slice(&m.crc.to_le_bytes());
                buf.extend_from_slice(&m.data);
                buf
            }
            Message::StatusReq(m) => {
                let mut buf = frame(MSG_STATUS_REQ, STATUS_REQ_LEN);
                buf.extend_from_slice(&m.file_id.to_le_bytes());
                buf.extend_from_slice(&m.window_id.to_le_bytes());
                buf.extend_from_slice(&m.round_id.to_le_bytes());
                buf
            }
            Message::Nack(m) => {
                let mut buf = frame(MSG_NACK, NACK_LEN);
                buf.extend_from_slice(&m.file_id.to_le_bytes());
                buf.extend_from_slice(&m.window_id.to_le_bytes());
                buf.extend_from_slice(&m.round_id.to_le_bytes());
                buf.push(m.uav_id);
                buf.extend_from_slice(&m.missing_bitmap.to_le_bytes());
                buf
            }
            Message::End(m) => {
                let mut buf = frame(MSG_END, END_LEN);
                buf.extend_from_slice(&m.file_id.to_le_bytes());
                buf.extend_from_slice(&m.total_chunks.to_le_bytes());
                buf.extend_from_slice(&m.file_hash.to_le_bytes());
                buf
            }
        }
    }

    /// Parse from wire format. Returns None for anything undersized,
    /// unknown, or inconsistent; callers drop such frames silently.
    pub fn decode(buf: &[u8]) -> Option<Message> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let msg_type = buf[0];
        let payload_len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
        let body = &buf[HEADER_LEN..];
        if body.len() < payload_len {
            return None;
        }
        let body = &body[..payload_len];

        match msg_type {
            MSG_SESSION_ANNOUNCE => {
                if body.len() < ANNOUNCE_LEN {
                    return None;
                }
                let mut filename = [0u8; FILENAME_LEN];
                filename.copy_from_slice(&body[12..12 + FILENAME_LEN]);
                Some(Message::SessionAnnounce(SessionAnnounce {
                    file_id: get_u16(body, 0),
                    total_chunks: get_u32(body, 2),
                    window_size: get_u16(body, 6),
                    chunk_size: get_u32(body, 8),
                    filename,
                }))
            }
            MSG_DATA_CHUNK => {
                if body.len() < DATA_CHUNK_FIXED {
                    return None;
                }
                let data_len = get_u16(body, 6) as usize;
                if body.len() < DATA_CHUNK_FIXED + data_len {
                    return None;
                }
                Some(Message::DataChunk(DataChunk {
                    file_id: get_u16(body, 0),
                    chunk_id: get_u32(body, 2),
                    crc: get_u16(body, 8),
                    data: body[DATA_CHUNK_FIXED..DATA_CHUNK_FIXED + data_len].to_vec(),
                }))
            }
            MSG_STATUS_REQ => {
                if body.len() < STATUS_REQ_LEN {
                    return None;
                }
                Some(Message::StatusReq(StatusReq {
                    file_id: get_u16(body, 0),
                    window_id: get_u32(body, 2),
                    round_id: get_u16(body, 6),
                }))
            }
            MSG_NACK => {
                if body.len() < NACK_LEN {
                    return None;
                }
                Some(Message::Nack(Nack {
                    file_id: get_u16(body, 0),
                    window_id: get_u32(body, 2),
                    round_id: get_u16(body, 6),
                    uav_id: body[8],
                    missing_bitmap: get_u64(body, 9),
                }))
            }
            MSG_END => {
                if body.len() < END_LEN {
                    return None;
                }
                Some(Message::End(End {
                    file_id: get_u16(body, 0),
                    total_chunks: get_u32(body, 2),
                    file_hash: get_u32(body, 6),
                }))
            }
            _ => None,
        }
    }
}

fn frame(msg_type: u8, payload_len: usize) -> Vec<u8> {
    debug_assert!(payload_len <= u16::MAX as usize);
    let mut buf = Vec::with_capacity(HEADER_LEN + payload_len);
    buf.push(msg_type);
    buf.push(0); // reserved
    buf.extend_from_slice(&(payload_len as u16).to_le_bytes());
    buf
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Pack a filename into the zero-padded wire field, truncating if needed.
pub fn encode_filename(name: &str) -> [u8; FILENAME_LEN] {
    let mut field = [0u8; FILENAME_LEN];
    let bytes = name.as_bytes();
    let len = bytes.len().min(FILENAME_LEN);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Recover a filename from the wire field: bytes up to the first NUL,
/// reduced to a bare basename so a hostile announce cannot direct the
/// output file outside the receiver's directory.
pub fn decode_filename(field: &[u8; FILENAME_LEN]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(FILENAME_LEN);
    let name = String::from_utf8_lossy(&field[..end]);
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    if base.is_empty() || base == "." || base == ".." {
        "unnamed".to_string()
    } else {
        base.to_string()
    }
}
