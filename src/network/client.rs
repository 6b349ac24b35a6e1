// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time;
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, FramedRead};

use super::frame::FrameCodec;
use crate::protocol::{ChatHeader, Message, RequestHeader, ResponseHeader, ServerMetadata};
use crate::{AppError, AppResult};

/// Client side of a relay connection.
#[derive(Debug)]
pub struct Client {
    local_addr: SocketAddr,
    reader: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl Client {
    pub async fn connect(
        addr: SocketAddr,
        dial_timeout: Duration,
        max_frame_size: usize,
    ) -> AppResult<Client> {
        let socket = time::timeout(dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                AppError::IoError(std::io::Error::new(
                    ErrorKind::TimedOut,
                    format!("dial {} timed out after {:?}", addr, dial_timeout),
                ))
            })??;
        socket.set_nodelay(true)?;
        let local_addr = socket.local_addr()?;
        let (reader, writer) = socket.into_split();
        Ok(Client {
            local_addr,
            reader: FramedRead::new(reader, FrameCodec::new(max_frame_size)),
            writer,
            codec: FrameCodec::new(max_frame_size),
            buffer: BytesMut::with_capacity(4 * 1024),
        })
    }

    /// The address the relay sees this client as.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send(&mut self, message: &Message) -> AppResult<()> {
        self.buffer.clear();
        self.codec.encode(message, &mut self.buffer)?;
        self.writer.write_all(&self.buffer).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn send_request(&mut self, metadata: &ServerMetadata) -> AppResult<()> {
        let header = RequestHeader::new(self.local_addr.to_string());
        self.send(&Message::request(&header, metadata)).await
    }

    pub async fn send_chat(
        &mut self,
        source_user_id: &str,
        destination_user_id: &str,
        body: impl Into<bytes::Bytes>,
    ) -> AppResult<()> {
        let header = ChatHeader::new(
            self.local_addr.to_string(),
            source_user_id,
            destination_user_id,
        );
        self.send(&Message::chat(&header, body)).await
    }

    /// Next message from the relay, `None` once it closed the connection.
    pub async fn recv(&mut self) -> AppResult<Option<Message>> {
        self.reader.next().await.transpose()
    }

    /// Like [`Client::recv`], but also `None` when nothing arrived within `wait`.
    pub async fn recv_timeout(&mut self, wait: Duration) -> AppResult<Option<Message>> {
        match time::timeout(wait, self.recv()).await {
            Ok(res) => res,
            Err(_) => Ok(None),
        }
    }

    /// Sends a request and waits for the response to it.
    pub async fn call(
        &mut self,
        metadata: &ServerMetadata,
        wait: Duration,
    ) -> AppResult<(ResponseHeader, bytes::Bytes)> {
        self.send_request(metadata).await?;
        loop {
            let message = self.recv_timeout(wait).await?.ok_or_else(|| {
                AppError::IoError(std::io::Error::new(
                    ErrorKind::TimedOut,
                    "no response from relay",
                ))
            })?;
            // chat traffic may interleave with responses
            if let Ok(header) = message.response_header() {
                if header.operation == metadata.operation {
                    return Ok((header, message.body));
                }
            }
        }
    }

    pub async fn shutdown(mut self) -> AppResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
