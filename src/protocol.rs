// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Wire protocol shared by the two proxy processes.
//!
//! Every frame on the transport is a `u32` little-endian payload length
//! followed by that many bytes of message payload. The payload is one tagged
//! message: a `u8` tag, then the fields in order, integers little-endian,
//! byte blobs and strings length-prefixed with a `u32`.

use crate::vsock_proxy::{Error, Result};

/// Upper bound on a single frame payload. Anything larger is treated as a
/// framing error rather than an allocation request.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of fd descriptions carried by one Data message. Bounded by
/// the ancillary-data budget of a single sendmsg on the transport; reads that
/// pick up more than this are refused rather than split.
pub const MAX_TRANSFERRED_FDS: usize = 16;

const TAG_CLOSE: u8 = 1;
const TAG_DATA: u8 = 2;
const TAG_CONNECT_REQUEST: u8 = 3;
const TAG_CONNECT_RESPONSE: u8 = 4;
const TAG_PREAD_REQUEST: u8 = 5;
const TAG_PREAD_RESPONSE: u8 = 6;
const TAG_PWRITE_REQUEST: u8 = 7;
const TAG_PWRITE_RESPONSE: u8 = 8;
const TAG_FSTAT_REQUEST: u8 = 9;
const TAG_FSTAT_RESPONSE: u8 = 10;

/// How a registered file descriptor must be handled, and how the peer
/// re-materializes it when it is transported inside a Data message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdKind {
    Stream,
    Dgram,
    Seqpacket,
    FifoRead,
    FifoWrite,
    Regular,
    Transportable,
}

impl FdKind {
    /// Kinds whose registered fd is read by the proxy and forwarded as Data.
    pub fn is_forwarding(self) -> bool {
        matches!(
            self,
            FdKind::Stream | FdKind::Dgram | FdKind::Seqpacket | FdKind::FifoRead
        )
    }

    /// Kinds whose reads and writes carry ancillary fds.
    pub fn is_socket(self) -> bool {
        matches!(self, FdKind::Stream | FdKind::Dgram | FdKind::Seqpacket)
    }

    fn to_wire(self) -> u8 {
        match self {
            FdKind::Stream => 1,
            FdKind::Dgram => 2,
            FdKind::Seqpacket => 3,
            FdKind::FifoRead => 4,
            FdKind::FifoWrite => 5,
            FdKind::Regular => 6,
            FdKind::Transportable => 7,
        }
    }

    fn from_wire(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FdKind::Stream),
            2 => Ok(FdKind::Dgram),
            3 => Ok(FdKind::Seqpacket),
            4 => Ok(FdKind::FifoRead),
            5 => Ok(FdKind::FifoWrite),
            6 => Ok(FdKind::Regular),
            7 => Ok(FdKind::Transportable),
            _ => Err(Error::MalformedMessage("unknown fd kind")),
        }
    }
}

/// Description of one fd transported inside a Data message.
///
/// For synthesizable kinds the peer re-creates the endpoint locally and
/// registers its end under `handle`. For `Transportable` the raw fd rides the
/// transport's own ancillary channel and `handle` names the sender-side entry
/// to close once it has been handed over. `flags` are the open flags of a
/// `Regular` file and zero otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FdDescription {
    pub kind: FdKind,
    pub handle: i64,
    pub flags: i32,
}

/// The tagged union exchanged between the two proxies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VsockMessage {
    Close {
        handle: i64,
    },
    Data {
        handle: i64,
        blob: Vec<u8>,
        fds: Vec<FdDescription>,
    },
    ConnectRequest {
        cookie: i64,
        path: Vec<u8>,
    },
    ConnectResponse {
        cookie: i64,
        error_code: i32,
        handle: i64,
    },
    PreadRequest {
        cookie: i64,
        handle: i64,
        count: u64,
        offset: u64,
    },
    PreadResponse {
        cookie: i64,
        error_code: i32,
        blob: Vec<u8>,
    },
    PwriteRequest {
        cookie: i64,
        handle: i64,
        blob: Vec<u8>,
        offset: u64,
    },
    PwriteResponse {
        cookie: i64,
        error_code: i32,
        bytes_written: i64,
    },
    FstatRequest {
        cookie: i64,
        handle: i64,
    },
    FstatResponse {
        cookie: i64,
        error_code: i32,
        size: i64,
    },
}

impl VsockMessage {
    /// Serializes the message payload, without the length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            VsockMessage::Close { handle } => {
                buf.push(TAG_CLOSE);
                put_i64(&mut buf, *handle);
            }
            VsockMessage::Data { handle, blob, fds } => {
                buf.push(TAG_DATA);
                put_i64(&mut buf, *handle);
                put_bytes(&mut buf, blob);
                put_u32(&mut buf, fds.len() as u32);
                for fd in fds {
                    buf.push(fd.kind.to_wire());
                    put_i64(&mut buf, fd.handle);
                    put_i32(&mut buf, fd.flags);
                }
            }
            VsockMessage::ConnectRequest { cookie, path } => {
                buf.push(TAG_CONNECT_REQUEST);
                put_i64(&mut buf, *cookie);
                put_bytes(&mut buf, path);
            }
            VsockMessage::ConnectResponse {
                cookie,
                error_code,
                handle,
            } => {
                buf.push(TAG_CONNECT_RESPONSE);
                put_i64(&mut buf, *cookie);
                put_i32(&mut buf, *error_code);
                put_i64(&mut buf, *handle);
            }
            VsockMessage::PreadRequest {
                cookie,
                handle,
                count,
                offset,
            } => {
                buf.push(TAG_PREAD_REQUEST);
                put_i64(&mut buf, *cookie);
                put_i64(&mut buf, *handle);
                put_u64(&mut buf, *count);
                put_u64(&mut buf, *offset);
            }
            VsockMessage::PreadResponse {
                cookie,
                error_code,
                blob,
            } => {
                buf.push(TAG_PREAD_RESPONSE);
                put_i64(&mut buf, *cookie);
                put_i32(&mut buf, *error_code);
                put_bytes(&mut buf, blob);
            }
            VsockMessage::PwriteRequest {
                cookie,
                handle,
                blob,
                offset,
            } => {
                buf.push(TAG_PWRITE_REQUEST);
                put_i64(&mut buf, *cookie);
                put_i64(&mut buf, *handle);
                put_bytes(&mut buf, blob);
                put_u64(&mut buf, *offset);
            }
            VsockMessage::PwriteResponse {
                cookie,
                error_code,
                bytes_written,
            } => {
                buf.push(TAG_PWRITE_RESPONSE);
                put_i64(&mut buf, *cookie);
                put_i32(&mut buf, *error_code);
                put_i64(&mut buf, *bytes_written);
            }
            VsockMessage::FstatRequest { cookie, handle } => {
                buf.push(TAG_FSTAT_REQUEST);
                put_i64(&mut buf, *cookie);
                put_i64(&mut buf, *handle);
            }
            VsockMessage::FstatResponse {
                cookie,
                error_code,
                size,
            } => {
                buf.push(TAG_FSTAT_RESPONSE);
                put_i64(&mut buf, *cookie);
                put_i32(&mut buf, *error_code);
                put_i64(&mut buf, *size);
            }
        }
        buf
    }

    /// Decodes one message payload. The whole buffer must be consumed.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let tag = r.u8()?;
        let message = match tag {
            TAG_CLOSE => VsockMessage::Close { handle: r.i64()? },
            TAG_DATA => {
                let handle = r.i64()?;
                let blob = r.bytes()?;
                let count = r.u32()? as usize;
                if count > MAX_TRANSFERRED_FDS {
                    return Err(Error::MalformedMessage("too many fd descriptions"));
                }
                let mut fds = Vec::with_capacity(count);
                for _ in 0..count {
                    let kind = FdKind::from_wire(r.u8()?)?;
                    let handle = r.i64()?;
                    let flags = r.i32()?;
                    fds.push(FdDescription { kind, handle, flags });
                }
                VsockMessage::Data { handle, blob, fds }
            }
            TAG_CONNECT_REQUEST => VsockMessage::ConnectRequest {
                cookie: r.i64()?,
                path: r.bytes()?,
            },
            TAG_CONNECT_RESPONSE => VsockMessage::ConnectResponse {
                cookie: r.i64()?,
                error_code: r.i32()?,
                handle: r.i64()?,
            },
            TAG_PREAD_REQUEST => VsockMessage::PreadRequest {
                cookie: r.i64()?,
                handle: r.i64()?,
                count: r.u64()?,
                offset: r.u64()?,
            },
            TAG_PREAD_RESPONSE => VsockMessage::PreadResponse {
                cookie: r.i64()?,
                error_code: r.i32()?,
                blob: r.bytes()?,
            },
            TAG_PWRITE_REQUEST => VsockMessage::PwriteRequest {
                cookie: r.i64()?,
                handle: r.i64()?,
                blob: r.bytes()?,
                offset: r.u64()?,
            },
            TAG_PWRITE_RESPONSE => VsockMessage::PwriteResponse {
                cookie: r.i64()?,
                error_code: r.i32()?,
                bytes_written: r.i64()?,
            },
            TAG_FSTAT_REQUEST => VsockMessage::FstatRequest {
                cookie: r.i64()?,
                handle: r.i64()?,
            },
            TAG_FSTAT_RESPONSE => VsockMessage::FstatResponse {
                cookie: r.i64()?,
                error_code: r.i32()?,
                size: r.i64()?,
            },
            _ => return Err(Error::MalformedMessage("unknown message tag")),
        };
        r.finish()?;
        Ok(message)
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return Err(Error::MalformedMessage("truncated message"));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::MalformedMessage("oversized blob"));
        }
        Ok(self.take(len)?.to_vec())
    }

    fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::MalformedMessage("trailing bytes after message"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_data_message_encoding() {
        let message = VsockMessage::Data {
            handle: -3,
            blob: b"abcdefg\0".to_vec(),
            fds: vec![
                FdDescription {
                    kind: FdKind::Stream,
                    handle: 7,
                    flags: 0,
                },
                FdDescription {
                    kind: FdKind::Regular,
                    handle: -9,
                    flags: libc::O_RDWR,
                },
            ],
        };
        let decoded = VsockMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_request_response_encoding() {
        for message in [
            VsockMessage::ConnectRequest {
                cookie: 1,
                path: b"/tmp/test.sock".to_vec(),
            },
            VsockMessage::PreadRequest {
                cookie: -2,
                handle: 5,
                count: 10,
                offset: 10,
            },
            VsockMessage::PwriteResponse {
                cookie: 3,
                error_code: libc::EBADF,
                bytes_written: 0,
            },
            VsockMessage::FstatResponse {
                cookie: 4,
                error_code: 0,
                size: 26,
            },
        ] {
            assert_eq!(VsockMessage::decode(&message.encode()).unwrap(), message);
        }
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        assert_matches!(
            VsockMessage::decode(&[0xff, 0, 0, 0]),
            Err(Error::MalformedMessage(_))
        );
    }

    #[test]
    fn test_truncated_message_is_malformed() {
        let encoded = VsockMessage::Close { handle: 42 }.encode();
        assert_matches!(
            VsockMessage::decode(&encoded[..encoded.len() - 1]),
            Err(Error::MalformedMessage(_))
        );
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let mut encoded = VsockMessage::Close { handle: 42 }.encode();
        encoded.push(0);
        assert_matches!(
            VsockMessage::decode(&encoded),
            Err(Error::MalformedMessage(_))
        );
    }
}
