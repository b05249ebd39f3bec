//! Packet framing and payload cursors.
//!
//! Every frame is a 3-byte little-endian length, a sequence id, and the
//! payload. Payloads of 2^24-1 bytes or more span multiple frames; a
//! maximal chunk is followed by another frame (possibly empty) so the
//! reader knows where the payload ends.

use byteorder::{
    ByteOrder,
    LittleEndian,
};
use common::{
    Error,
    ErrorKind,
    Result,
};
use tokio::io::{
    AsyncRead,
    AsyncReadExt,
    AsyncWrite,
    AsyncWriteExt,
};

use crate::constants::MAX_PACKET_CHUNK;

/// Read one complete payload into `buffer`, concatenating continuation
/// frames. Returns the sequence id of the first frame and the id expected
/// next.
pub(crate) async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
) -> Result<(u8, u8)> {
    buffer.clear();
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let mut length = LittleEndian::read_u24(&header) as usize;
    let first_seq = header[3];
    let mut next_seq = first_seq.wrapping_add(1);

    let start = buffer.len();
    buffer.resize(start + length, 0);
    reader.read_exact(&mut buffer[start..]).await?;

    while length == MAX_PACKET_CHUNK {
        reader.read_exact(&mut header).await?;
        length = LittleEndian::read_u24(&header) as usize;
        if header[3] != next_seq {
            return Err(Error::protocol(format!(
                "unexpected sequence id {} (expected {next_seq})",
                header[3]
            )));
        }
        next_seq = next_seq.wrapping_add(1);
        let start = buffer.len();
        buffer.resize(start + length, 0);
        reader.read_exact(&mut buffer[start..]).await?;
    }
    Ok((first_seq, next_seq))
}

/// Write one payload, splitting it into maximal frames and appending the
/// empty trailer frame when the last chunk is exactly maximal. Returns the
/// next sequence id.
pub(crate) async fn write_payload<W: AsyncWrite + Unpin>(
    writer: &mut W,
    mut seq: u8,
    payload: &[u8],
) -> Result<u8> {
    let mut remaining = payload;
    loop {
        let chunk_len = remaining.len().min(MAX_PACKET_CHUNK);
        let (chunk, rest) = remaining.split_at(chunk_len);
        let mut header = [0u8; 4];
        LittleEndian::write_u24(&mut header, chunk_len as u32);
        header[3] = seq;
        seq = seq.wrapping_add(1);
        writer.write_all(&header).await?;
        writer.write_all(chunk).await?;
        remaining = rest;
        if chunk_len < MAX_PACKET_CHUNK {
            break;
        }
        // A maximal chunk demands a follow-up frame; if nothing remains the
        // loop emits the empty trailer on its next pass.
    }
    writer.flush().await?;
    Ok(seq)
}

/// Forward cursor over one payload.
pub(crate) struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn truncated() -> Error {
        Error::new(ErrorKind::Protocol, "truncated packet")
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Self::truncated());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_le(&mut self) -> Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn u32_le(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn u64_le(&mut self) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn f32_le(&mut self) -> Result<f32> {
        Ok(LittleEndian::read_f32(self.take(4)?))
    }

    pub fn f64_le(&mut self) -> Result<f64> {
        Ok(LittleEndian::read_f64(self.take(8)?))
    }

    /// Length-encoded integer. The 0xfb marker (NULL in row payloads) is
    /// the caller's business and rejected here.
    pub fn lenenc_int(&mut self) -> Result<u64> {
        let first = self.u8()?;
        match first {
            0xfc => Ok(self.u16_le()? as u64),
            0xfd => Ok(LittleEndian::read_u24(self.take(3)?) as u64),
            0xfe => self.u64_le(),
            0xfb | 0xff => Err(Error::protocol(format!(
                "unexpected 0x{first:02x} where a length-encoded integer was expected"
            ))),
            n => Ok(n as u64),
        }
    }

    pub fn lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.lenenc_int()? as usize;
        self.take(len)
    }

    pub fn null_terminated(&mut self) -> Result<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(idx) => {
                let s = &rest[..idx];
                self.pos += idx + 1;
                Ok(s)
            },
            None => Err(Self::truncated()),
        }
    }

    pub fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }
}

pub(crate) fn put_lenenc_int(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfa => out.push(value as u8),
        0xfb..=0xffff => {
            out.push(0xfc);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        },
        0x1_0000..=0xff_ffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        },
        _ => {
            out.push(0xfe);
            out.extend_from_slice(&value.to_le_bytes());
        },
    }
}

pub(crate) fn put_lenenc_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_lenenc_int(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// OK packet (header 0x00).
#[derive(Clone, Debug, Default)]
pub(crate) struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
}

pub(crate) fn parse_ok(payload: &[u8]) -> Result<OkPacket> {
    let mut reader = PayloadReader::new(payload);
    let header = reader.u8()?;
    if header != 0x00 && header != 0xfe {
        return Err(Error::protocol(format!("not an OK packet: 0x{header:02x}")));
    }
    let affected_rows = reader.lenenc_int()?;
    let last_insert_id = reader.lenenc_int()?;
    let status_flags = reader.u16_le()?;
    let warnings = reader.u16_le()?;
    Ok(OkPacket {
        affected_rows,
        last_insert_id,
        status_flags,
        warnings,
    })
}

/// EOF packet: 0xfe header with a short payload (protocol-41 form).
pub(crate) fn is_eof(payload: &[u8]) -> bool {
    !payload.is_empty() && payload[0] == 0xfe && payload.len() < 9
}

pub(crate) fn parse_eof_status(payload: &[u8]) -> Result<u16> {
    let mut reader = PayloadReader::new(payload);
    reader.skip(1)?;
    let _warnings = reader.u16_le()?;
    reader.u16_le()
}

/// ERR packet (header 0xff) surfaced as a typed rejection.
pub(crate) fn parse_err(payload: &[u8]) -> Error {
    let mut reader = PayloadReader::new(payload);
    let parsed: Result<(u16, String, String)> = (|| {
        reader.skip(1)?;
        let code = reader.u16_le()?;
        let mut sql_state = String::new();
        if reader.peek() == Some(b'#') {
            reader.skip(1)?;
            sql_state = String::from_utf8_lossy(reader.take(5)?).into_owned();
        }
        let message = String::from_utf8_lossy(reader.rest()).into_owned();
        Ok((code, sql_state, message))
    })();
    match parsed {
        Ok((code, sql_state, message)) => {
            Error::new(ErrorKind::Sql { code, sql_state }, message)
        },
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[tokio::test]
    async fn test_payload_round_trip_small() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let payload = b"hello mysql".to_vec();
        let next = write_payload(&mut a, 0, &payload).await.unwrap();
        assert_eq!(next, 1);
        let mut buf = Vec::new();
        let (seq, next_seq) = read_payload(&mut b, &mut buf).await.unwrap();
        assert_eq!(seq, 0);
        assert_eq!(next_seq, 1);
        assert_eq!(buf, payload);
    }

    #[tokio::test]
    async fn test_payload_round_trip_spanning_frames() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let payload: Vec<u8> = (0..(MAX_PACKET_CHUNK + 5))
            .map(|i| (i % 251) as u8)
            .collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            write_payload(&mut a, 3, &payload).await.unwrap()
        });
        let mut buf = Vec::new();
        let (seq, next_seq) = read_payload(&mut b, &mut buf).await.unwrap();
        let next = writer.await.unwrap();
        assert_eq!(seq, 3);
        // Two frames were used.
        assert_eq!(next, 5);
        assert_eq!(next_seq, 5);
        assert_eq!(buf, expected);
    }

    #[tokio::test]
    async fn test_exactly_maximal_payload_gets_empty_trailer() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let payload = vec![0xabu8; MAX_PACKET_CHUNK];
        let expected_len = payload.len();
        let writer = tokio::spawn(async move {
            write_payload(&mut a, 0, &payload).await.unwrap()
        });
        let mut buf = Vec::new();
        read_payload(&mut b, &mut buf).await.unwrap();
        let next = writer.await.unwrap();
        // Maximal frame plus the empty trailer.
        assert_eq!(next, 2);
        assert_eq!(buf.len(), expected_len);
    }

    #[tokio::test]
    async fn test_sequence_mismatch_is_a_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        // Hand-craft two frames with a broken continuation sequence id.
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0xff, 0xff, 0xff, 0]);
        frame.extend_from_slice(&vec![0u8; MAX_PACKET_CHUNK]);
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 7]);
        let writer = tokio::spawn(async move {
            let _ = tokio::io::AsyncWriteExt::write_all(&mut a, &frame).await;
        });
        let mut buf = Vec::new();
        let err = read_payload(&mut b, &mut buf).await.unwrap_err();
        let _ = writer.await;
        assert_eq!(*err.kind(), common::ErrorKind::Protocol);
    }

    #[test]
    fn test_ok_and_err_parsing() {
        // affected=2, insert_id=5, status=autocommit, warnings=1
        let ok = parse_ok(&[0x00, 0x02, 0x05, 0x02, 0x00, 0x01, 0x00]).unwrap();
        assert_eq!(ok.affected_rows, 2);
        assert_eq!(ok.last_insert_id, 5);
        assert_eq!(ok.status_flags, 0x0002);
        assert_eq!(ok.warnings, 1);

        let mut err_payload = vec![0xff, 0x48, 0x04, b'#'];
        err_payload.extend_from_slice(b"HY000");
        err_payload.extend_from_slice(b"No tables used");
        let err = parse_err(&err_payload);
        match err.kind() {
            common::ErrorKind::Sql { code, sql_state } => {
                assert_eq!(*code, 1096);
                assert_eq!(sql_state, "HY000");
            },
            other => panic!("unexpected kind {other:?}"),
        }
        assert!(err.to_string().contains("No tables used"));
    }

    proptest! {
        #[test]
        fn proptest_lenenc_int_round_trip(value in proptest::num::u64::ANY) {
            let mut out = Vec::new();
            put_lenenc_int(&mut out, value);
            let mut reader = PayloadReader::new(&out);
            prop_assert_eq!(reader.lenenc_int().unwrap(), value);
            prop_assert_eq!(reader.remaining(), 0);
        }

        #[test]
        fn proptest_lenenc_bytes_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut out = Vec::new();
            put_lenenc_bytes(&mut out, &bytes);
            let mut reader = PayloadReader::new(&out);
            prop_assert_eq!(reader.lenenc_bytes().unwrap(), &bytes[..]);
        }
    }
}
