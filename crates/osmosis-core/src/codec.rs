//! Framing for items and results on a worker's byte channels.
//!
//! Both codecs stream a sequence of values over one continuous channel and
//! report a clean end of stream (`Ok(None)`) distinctly from a truncated frame.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::io::{self, BufRead, Write};
use std::str::FromStr;

/// Largest frame accepted by the length-prefixed codec.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Wire encoding between the executor and a worker's execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Big-endian `u32` length followed by a MessagePack body.
    #[default]
    MsgPack,
    /// One JSON document per line.
    JsonLines,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("encode: {0}")]
    Encode(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("frame of {0} bytes exceeds the 64 MiB limit")]
    FrameTooLarge(usize),

    #[error("stream ended inside a frame")]
    Truncated,
}

impl Codec {
    pub fn name(self) -> &'static str {
        match self {
            Codec::MsgPack => "msgpack",
            Codec::JsonLines => "jsonl",
        }
    }

    /// Write one value and flush.
    pub fn write<W: Write, T: Serialize>(self, w: &mut W, value: &T) -> Result<(), CodecError> {
        match self {
            Codec::MsgPack => {
                let body = rmp_serde::to_vec_named(value)
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
                if body.len() > MAX_FRAME_LEN {
                    return Err(CodecError::FrameTooLarge(body.len()));
                }
                w.write_all(&(body.len() as u32).to_be_bytes())?;
                w.write_all(&body)?;
            }
            Codec::JsonLines => {
                serde_json::to_writer(&mut *w, value)
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
                w.write_all(b"\n")?;
            }
        }
        w.flush()?;
        Ok(())
    }

    /// Read the next value, or `None` at a clean end of stream.
    pub fn read<R: BufRead, T: DeserializeOwned>(self, r: &mut R) -> Result<Option<T>, CodecError> {
        match self {
            Codec::MsgPack => {
                let mut len = [0u8; 4];
                if !read_exact_or_eof(r, &mut len)? {
                    return Ok(None);
                }
                let len = u32::from_be_bytes(len) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(CodecError::FrameTooLarge(len));
                }
                let mut body = vec![0u8; len];
                if !read_exact_or_eof(r, &mut body)? && len > 0 {
                    return Err(CodecError::Truncated);
                }
                rmp_serde::from_slice(&body)
                    .map(Some)
                    .map_err(|e| CodecError::Decode(e.to_string()))
            }
            Codec::JsonLines => {
                let mut line = String::new();
                loop {
                    line.clear();
                    if r.read_line(&mut line)? == 0 {
                        return Ok(None);
                    }
                    if !line.trim().is_empty() {
                        break;
                    }
                }
                if !line.ends_with('\n') {
                    return Err(CodecError::Truncated);
                }
                serde_json::from_str(line.trim_end())
                    .map(Some)
                    .map_err(|e| CodecError::Decode(e.to_string()))
            }
        }
    }
}

/// Fill `buf` completely. Returns `false` if the stream was already at EOF,
/// and `Truncated` if it ended part-way.
fn read_exact_or_eof<R: BufRead>(r: &mut R, buf: &mut [u8]) -> Result<bool, CodecError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(CodecError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "msgpack" | "messagepack" => Ok(Codec::MsgPack),
            "jsonl" | "ndjson" | "json-lines" => Ok(Codec::JsonLines),
            _ => Err(format!("Invalid codec '{}'. Use: msgpack, jsonl", s)),
        }
    }
}
