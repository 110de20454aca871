//! Network Module
//!
//! The cluster gateway (server side) and the persistent gateway client
//! used by followers, peers and the CLI.

mod client;
mod server;

pub use client::{GatewayClient, WriteOutcome};
pub use server::{ClusterGateway, GatewayContext};

use crate::error::{Error, Result};
use crate::replication::{FrameHeader, Message};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > FrameHeader::MAX_BODY {
        return Err(Error::Network(format!(
            "Frame of {} bytes exceeds limit",
            header.length
        )));
    }

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    if body.len() > FrameHeader::MAX_BODY as usize {
        return Err(Error::Network(format!(
            "Message of {} bytes exceeds frame limit",
            body.len()
        )));
    }
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

/// Whether an error means the peer closed the connection
pub(crate) fn is_eof(error: &Error) -> bool {
    matches!(error, Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::{Request, Response, Status};

    #[tokio::test]
    async fn test_framed_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let request = Message::Request {
            id: 7,
            request: Request::GetBackLog { from_sequence: 12 },
        };
        write_message(&mut a, &request).await.unwrap();
        write_message(
            &mut a,
            &Message::Response {
                id: 7,
                response: Response::Status {
                    status: Status::Ok,
                    address: String::new(),
                },
            },
        )
        .await
        .unwrap();

        match read_message(&mut b).await.unwrap() {
            Message::Request {
                id,
                request: Request::GetBackLog { from_sequence },
            } => {
                assert_eq!(id, 7);
                assert_eq!(from_sequence, 12);
            }
            other => panic!("unexpected {}", other.type_name()),
        }
        assert!(matches!(
            read_message(&mut b).await.unwrap(),
            Message::Response { id: 7, .. }
        ));

        drop(a);
        assert!(is_eof(&read_message(&mut b).await.unwrap_err()));
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(1024);
        let body = Message::Request {
            id: 1,
            request: Request::GetStatus,
        }
        .serialize()
        .unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 1;
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        assert!(matches!(read_message(&mut b).await, Err(Error::Network(_))));
    }
}
