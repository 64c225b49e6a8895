use prost::Message as ProstMessage;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ChatError, ChatResult};
use crate::protocol::PeerId;

pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// A chat line as it travels between peers.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    /// `<sender_id>:<sequence>`
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub sender_id: String,
    #[prost(string, tag = "3")]
    pub nickname: String,
    #[prost(string, tag = "4")]
    pub body: String,
    /// Unix milliseconds at the sender.
    #[prost(uint64, tag = "5")]
    pub timestamp: u64,
}

impl Message {
    pub fn new(sender_id: &PeerId, sequence: u64, nickname: String, body: String) -> Self {
        Self {
            id: Self::compose_id(sender_id, sequence),
            sender_id: sender_id.to_string(),
            nickname,
            body,
            timestamp: crate::current_timestamp_millis(),
        }
    }

    pub fn compose_id(sender_id: &PeerId, sequence: u64) -> String {
        format!("{}:{}", sender_id, sequence)
    }

    /// Per-sender sequence number, if the id is well formed.
    pub fn sequence(&self) -> Option<u64> {
        let (sender, sequence) = self.id.rsplit_once(':')?;
        if sender != self.sender_id {
            return None;
        }
        sequence.parse().ok()
    }

    pub fn sender(&self) -> PeerId {
        PeerId::from(self.sender_id.as_str())
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    #[prost(string, tag = "1")]
    pub peer_id: String,
    #[prost(string, tag = "2")]
    pub nickname: String,
    #[prost(string, tag = "3")]
    pub room_name: String,
    #[prost(uint32, tag = "4")]
    pub tcp_port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(oneof = "frame::Kind", tags = "1, 2, 3")]
    pub kind: Option<frame::Kind>,
}

pub mod frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Hello(super::Hello),
        #[prost(message, tag = "2")]
        Chat(super::Message),
        #[prost(message, tag = "3")]
        Heartbeat(super::Heartbeat),
    }
}

impl Frame {
    pub fn hello(hello: Hello) -> Self {
        Self { kind: Some(frame::Kind::Hello(hello)) }
    }

    pub fn chat(message: Message) -> Self {
        Self { kind: Some(frame::Kind::Chat(message)) }
    }

    pub fn heartbeat() -> Self {
        Self { kind: Some(frame::Kind::Heartbeat(Heartbeat {})) }
    }
}

/// Writes one frame: 8-byte big-endian length, then the protobuf body.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> ChatResult<()>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.encode_to_vec();
    let mut data = Vec::with_capacity(8 + body.len());
    data.extend_from_slice(&(body.len() as u64).to_be_bytes());
    data.extend_from_slice(&body);

    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> ChatResult<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut size_bytes = [0u8; 8];
    match reader.read_exact(&mut size_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u64::from_be_bytes(size_bytes);
    if size > max_len as u64 {
        return Err(ChatError::FrameTooLarge { size, max: max_len });
    }

    let mut buffer = vec![0u8; size as usize];
    reader.read_exact(&mut buffer).await.map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            ChatError::ProtocolFrame("stream ended inside a frame".to_string())
        } else {
            ChatError::Network(e)
        }
    })?;

    let frame = Frame::decode(&buffer[..])?;
    if frame.kind.is_none() {
        return Err(ChatError::ProtocolFrame("frame without payload".to_string()));
    }
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(body: &str) -> Frame {
        Frame::chat(Message::new(&PeerId::from("peer-a"), 7, "Alex".to_string(), body.to_string()))
    }

    #[test]
    fn message_id_carries_sender_and_sequence() {
        let message = Message::new(&PeerId::from("peer-a"), 42, "Alex".to_string(), "hi".to_string());
        assert_eq!(message.id, "peer-a:42");
        assert_eq!(message.sequence(), Some(42));
        assert_eq!(message.sender(), PeerId::from("peer-a"));
    }

    #[test]
    fn sequence_requires_matching_sender() {
        let mut message = Message::new(&PeerId::from("peer-a"), 1, "Alex".to_string(), "hi".to_string());
        message.sender_id = "peer-b".to_string();
        assert_eq!(message.sequence(), None);
    }

    #[tokio::test]
    async fn frames_are_read_back_in_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let (one, two) = (chat("one"), chat("two"));
        write_frame(&mut client, &one).await.unwrap();
        write_frame(&mut client, &Frame::heartbeat()).await.unwrap();
        write_frame(&mut client, &two).await.unwrap();
        drop(client);

        let first = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(first, Some(one));
        let second = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(second, Some(Frame::heartbeat()));
        let third = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert_eq!(third, Some(two));
        assert_eq!(read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused_before_allocation() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(u64::MAX).to_be_bytes()).await.unwrap();

        let result = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await;
        assert!(matches!(result, Err(ChatError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn truncated_body_is_a_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u64.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let result = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await;
        assert!(matches!(result, Err(ChatError::ProtocolFrame(_))));
    }

    #[tokio::test]
    async fn undecodable_body_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&3u64.to_be_bytes()).await.unwrap();
        client.write_all(&[0xff, 0xff, 0xff]).await.unwrap();

        assert!(read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await.is_err());
    }

    #[tokio::test]
    async fn empty_frame_is_a_protocol_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, &Frame { kind: None }).await.unwrap();

        let result = read_frame(&mut server, DEFAULT_MAX_FRAME_LEN).await;
        assert!(matches!(result, Err(ChatError::ProtocolFrame(_))));
    }
}
