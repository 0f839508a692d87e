// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP receiver loop for KNX IP Secure unicast sessions (§4.7/§8 "C3").
//!
//! KNXnet/IP frames are self-describing (`total_length` in the header), so
//! "length-framed" here means reading the fixed 6-byte header first, then
//! exactly `total_length - 6` more bytes with a second `read_exact`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, ReadHalf},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{ConnResult, ConnectionError},
    net::udp::DatagramHandler,
    wire::{Header, HEADER_LEN},
};

/// Parsed frame handed to the session owning this TCP connection.
pub struct ReceivedStream {
    pub header: Header,
    pub body: Bytes,
}

pub trait StreamHandler: Send + Sync {
    fn handle(&self, received: ReceivedStream);
}

impl<F> StreamHandler for F
where F: Fn(ReceivedStream) + Send + Sync
{
    fn handle(&self, received: ReceivedStream) {
        self(received)
    }
}

async fn read_one_frame(reader: &mut ReadHalf<TcpStream>) -> ConnResult<ReceivedStream> {
    let mut header_buf = [0u8; HEADER_LEN];
    reader.read_exact(&mut header_buf).await?;
    let header = Header::decode(&header_buf)?;
    let body_len = (header.total_length as usize).saturating_sub(HEADER_LEN);
    let mut body = vec![0u8; body_len];
    if body_len > 0 {
        reader.read_exact(&mut body).await?;
    }
    Ok(ReceivedStream { header, body: Bytes::from(body) })
}

/// Runs until `cancel` fires or the peer closes the stream, dispatching one
/// frame at a time. A malformed header closes the session (§7: a framing
/// error on a byte stream cannot be safely resynchronized, unlike a UDP
/// datagram which is simply dropped).
pub async fn run_receiver(
    mut reader: ReadHalf<TcpStream>,
    handler: Arc<dyn StreamHandler>,
    cancel: CancellationToken,
) -> ConnResult<()> {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            frame = read_one_frame(&mut reader) => frame,
        };
        match frame {
            Ok(frame) => handler.handle(frame),
            Err(ConnectionError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("secure session peer closed the stream");
                return Ok(());
            },
            Err(err) => return Err(err),
        }
    }
}
