/*!
 * Command codecs.
 *
 * A [`Codec`] turns a command into wire bytes and validates the reply to
 * that same command. Three wire shapes are provided: fixed binary frames
 * with a checksum ([`binary`]), ASCII command lines with echoed replies
 * ([`ascii`]) and Alpaca-style REST requests with JSON replies ([`rest`]).
 * [`exchange`] runs one full command cycle over a [`Link`].
 */
use tracing::warn;

use skylink_core::utils::hex_dump;

use crate::error::{CodecError, DriverError, Result, TransportError};
use crate::transport::{Delimiter, Link};

pub mod ascii;
pub mod binary;
pub mod rest;

pub use ascii::{AsciiCodec, AsciiCommand, AsciiDialect, AsciiReply, EchoStyle};
pub use binary::{BinaryCodec, Frame};
pub use rest::{RestCodec, RestReply, RestRequest};

/// How replies are delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Reply ends with this byte
    Terminated(u8),
    /// Fixed header carrying the payload length, then payload and trailer
    LengthPrefixed {
        /// Header size in bytes
        header: usize,
        /// Offset of the length byte within the header
        length_at: usize,
        /// Bytes after the payload (checksum)
        trailer: usize,
    },
}

/// Encodes commands and decodes the replies to them
pub trait Codec {
    /// Outgoing command
    type Command;
    /// Decoded reply
    type Reply;

    /// Encode a command to wire bytes
    fn encode(&self, command: &Self::Command) -> std::result::Result<Vec<u8>, CodecError>;

    /// Decode the raw reply to `command`
    fn decode(&self, command: &Self::Command, raw: &[u8])
        -> std::result::Result<Self::Reply, CodecError>;

    /// Reply framing
    fn framing(&self) -> Framing;
}

/// Send one command and decode its reply.
///
/// If a length-prefixed reply is cut short, the bytes that did arrive are
/// decoded anyway so a lost byte is reported as a framing error rather than
/// a bare timeout.
pub async fn exchange<C: Codec>(codec: &C, link: &mut Link, command: &C::Command) -> Result<C::Reply> {
    let frame = codec.encode(command)?;
    link.send(&frame).await?;

    let raw = match codec.framing() {
        Framing::Terminated(byte) => link.receive(Delimiter::Byte(byte)).await?,
        Framing::LengthPrefixed {
            header,
            length_at,
            trailer,
        } => {
            let mut raw = link.receive(Delimiter::Count(header)).await?;
            let length = raw.get(length_at).copied().unwrap_or_default() as usize;
            match link.receive(Delimiter::Count(length + trailer)).await {
                Ok(rest) => raw.extend_from_slice(&rest),
                Err(TransportError::Timeout(timeout)) => {
                    raw.extend_from_slice(&timeout.partial);
                    warn!("Short frame after {:?}: {}", timeout.waited, hex_dump(&raw));
                    codec.decode(command, &raw)?;
                    return Err(DriverError::from(timeout));
                }
                Err(e) => return Err(e.into()),
            }
            raw
        }
    };

    Ok(codec.decode(command, &raw)?)
}
