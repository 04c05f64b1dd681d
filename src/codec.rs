// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Framing. A frame is a 4-byte little-endian length followed by that many
//! bytes of bincode-encoded `Message`. Each connection carries exactly one.

use crate::{Error, Message, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Largest frame we will write or accept.
pub const MAX_FRAME: usize = 64 * 1024;

/// Encode `msg` into a complete frame, length prefix included.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let body = bincode::serialize(msg).map_err(|source| Error::Encode {
        kind: msg.kind,
        source,
    })?;
    if body.len() > MAX_FRAME {
        return Err(Error::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode(body: &[u8]) -> Result<Message> {
    bincode::deserialize(body).map_err(Error::Decode)
}

pub async fn write_frame(stream: &mut (impl AsyncWriteExt + Unpin), frame: &[u8]) -> Result<()> {
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_message(stream: &mut (impl AsyncReadExt + Unpin)) -> Result<Message> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(Error::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    decode(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Address, Ballot, Kind};

    fn sample() -> Message {
        Message::new(
            7,
            &Address::new("127.0.0.1", "7007"),
            Kind::Pong,
            Ballot::new(2, 5),
        )
        .with_size(3)
    }

    #[tokio::test]
    async fn frame_reads_back_through_a_stream() {
        let frame = encode(&sample()).unwrap();
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &frame).await.unwrap();
        drop(a);
        let got = read_message(&mut b).await.unwrap();
        assert_eq!(got, sample());
    }

    #[tokio::test]
    async fn oversized_length_is_refused_before_reading_body() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_FRAME as u32 + 1).to_le_bytes();
        write_frame(&mut a, &len).await.unwrap();
        match read_message(&mut b).await {
            Err(Error::FrameTooLarge(n)) => assert_eq!(n, MAX_FRAME + 1),
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let frame = encode(&sample()).unwrap();
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &frame[..frame.len() - 2]).await.unwrap();
        drop(a);
        assert!(read_message(&mut b).await.is_err());
    }

    #[test]
    fn garbage_body_fails_to_decode() {
        assert!(matches!(decode(&[0xff; 3]), Err(Error::Decode(_))));
    }
}
