//! Fixed-size handshake header.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::crypto::{SharedSecret, NONCE_SIZE, TOKEN_SIZE};
use crate::error::{Error, Result};
use crate::handshake::token;

/// Encoded header length: 8 (step) + 16 (nonce) + 32 (token).
pub const HEADER_LEN: usize = 8 + NONCE_SIZE + TOKEN_SIZE;

/// Preamble sent at the start of every flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    /// Step the sender derived its port for
    pub step: i64,
    /// Single-use random nonce
    pub nonce: [u8; NONCE_SIZE],
    /// HMAC over step, nonce and identity
    pub token: [u8; TOKEN_SIZE],
}

impl HandshakeHeader {
    /// Build a header with a fresh nonce for `step`.
    pub fn issue(secret: &SharedSecret, step: i64, identity: &str) -> Self {
        let (nonce, token) = token::issue(secret, step, identity);
        Self { step, nonce, token }
    }

    /// Append the wire form to `buf`.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.step as u64);
        buf.put_slice(&self.nonce);
        buf.put_slice(&self.token);
    }

    /// Wire form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        self.encode_into(&mut &mut out[..]);
        out
    }

    /// Header followed by `payload`, as sent in the first datagram of a flow.
    pub fn prefix(&self, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        self.encode_into(&mut buf);
        buf.put_slice(payload);
        buf
    }

    /// Parse the first [`HEADER_LEN`] bytes of `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Buffer {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }

        let mut buf = &data[..HEADER_LEN];
        let step = buf.get_u64() as i64;
        let mut nonce = [0u8; NONCE_SIZE];
        buf.copy_to_slice(&mut nonce);
        let mut token = [0u8; TOKEN_SIZE];
        buf.copy_to_slice(&mut token);

        Ok(Self { step, nonce, token })
    }

    /// Split a first datagram into its header and the payload behind it.
    pub fn split_datagram(data: &[u8]) -> Result<(Self, &[u8])> {
        let header = Self::decode(data)?;
        Ok((header, &data[HEADER_LEN..]))
    }

    /// Read exactly [`HEADER_LEN`] bytes from a stream.
    ///
    /// A peer that closes before sending a full header is a handshake error.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut raw = [0u8; HEADER_LEN];
        match reader.read_exact(&mut raw).await {
            Ok(_) => Self::decode(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(Error::handshake("connection closed before full header"))
            }
            Err(e) => Err(Error::Network(e)),
        }
    }
}
