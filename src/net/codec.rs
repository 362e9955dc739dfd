//! Wire frame for one sample's channel values.
//!
//! ```text
//! +--------+-------------+---------------------------+
//! | format | count (u16) | count values, little end. |
//! +--------+-------------+---------------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use log::*;
use std::io;
use tokio_util::codec;

use super::{ChannelFormat, Channels};

const HEADER_LEN: usize = 3;

const TAG_FLOAT32: u8 = 1;
const TAG_DOUBLE64: u8 = 2;
const TAG_INT64: u8 = 3;

pub struct ChannelCodec {}

impl ChannelCodec {
    pub fn new() -> ChannelCodec {
        ChannelCodec {}
    }

    fn format_of(tag: u8) -> io::Result<ChannelFormat> {
        match tag {
            TAG_FLOAT32 => Ok(ChannelFormat::Float32),
            TAG_DOUBLE64 => Ok(ChannelFormat::Double64),
            TAG_INT64 => Ok(ChannelFormat::Int64),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown channel format tag {:#x}", other),
            )),
        }
    }

    fn tag_of(format: ChannelFormat) -> u8 {
        match format {
            ChannelFormat::Float32 => TAG_FLOAT32,
            ChannelFormat::Double64 => TAG_DOUBLE64,
            ChannelFormat::Int64 => TAG_INT64,
        }
    }
}

impl Default for ChannelCodec {
    fn default() -> Self {
        ChannelCodec::new()
    }
}

impl<'a> codec::Encoder<&'a Channels> for ChannelCodec {
    type Error = io::Error;

    fn encode(&mut self, channels: &'a Channels, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let count = channels.len();
        if count > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} channels do not fit in one frame", count),
            ));
        }

        let format = channels.format();
        dst.reserve(HEADER_LEN + count * format.width());
        dst.put_u8(ChannelCodec::tag_of(format));
        dst.put_u16_le(count as u16);
        match channels {
            Channels::Float32(values) => values.iter().for_each(|v| dst.put_f32_le(*v)),
            Channels::Double64(values) => values.iter().for_each(|v| dst.put_f64_le(*v)),
            Channels::Int64(values) => values.iter().for_each(|v| dst.put_i64_le(*v)),
        }
        Ok(())
    }
}

impl codec::Decoder for ChannelCodec {
    type Item = Channels;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            // Not enough data
            return Ok(None);
        }

        let format = ChannelCodec::format_of(src[0])?;
        let count = u16::from_le_bytes([src[1], src[2]]) as usize;
        let frame_len = HEADER_LEN + count * format.width();
        if src.len() < frame_len {
            return Ok(None);
        }

        trace!("decoding {} frame: {}", format, hex::encode(&src[..frame_len]));
        src.advance(HEADER_LEN);
        let channels = match format {
            ChannelFormat::Float32 => Channels::Float32((0..count).map(|_| src.get_f32_le()).collect()),
            ChannelFormat::Double64 => {
                Channels::Double64((0..count).map(|_| src.get_f64_le()).collect())
            }
            ChannelFormat::Int64 => Channels::Int64((0..count).map(|_| src.get_i64_le()).collect()),
        };
        Ok(Some(channels))
    }
}
