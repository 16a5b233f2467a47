//! Length-prefixed bincode frames
//!
//! Each frame is a big-endian `u32` byte length followed by the bincode
//! (legacy configuration) encoding of one request or response.

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{ControlError, Result};

/// Largest request the server accepts (1MB)
pub const MAX_REQUEST_SIZE: u32 = 1_000_000;

/// Largest response the client accepts (10MB)
pub const MAX_RESPONSE_SIZE: u32 = 10_000_000;

/// Read one frame
///
/// # Errors
///
/// Returns [`ControlError::ConnectionClosed`] if the peer hung up before a
/// frame started, or a protocol error if the frame is larger than `max_len`
/// or does not decode
pub async fn read_frame<T, R>(stream: &mut R, max_len: u32) -> Result<T>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ControlError::ConnectionClosed
        } else {
            ControlError::Io(e)
        }
    })?;

    let len = u32::from_be_bytes(len_buf);
    if len > max_len {
        return Err(ControlError::FrameTooLarge { len, max: max_len });
    }

    let mut bytes = vec![0u8; len as usize];
    stream.read_exact(&mut bytes).await?;

    let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
    Ok(value)
}

/// Write one frame and flush
///
/// # Errors
///
/// Returns an error if the value does not encode or the write fails
pub async fn write_frame<T, W>(stream: &mut W, value: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;
    let len = u32::try_from(bytes.len())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use cadence_common::CampaignId;

    use super::*;
    use crate::protocol::{Request, RequestCommand, ScheduleCommand};

    #[tokio::test]
    async fn frames_carry_requests_across_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let campaign_id = CampaignId::generate();

        write_frame(
            &mut client,
            &Request::new(RequestCommand::Schedule(ScheduleCommand::Pause { campaign_id })),
        )
        .await
        .unwrap();

        let request: Request = read_frame(&mut server, MAX_REQUEST_SIZE).await.unwrap();
        assert!(matches!(
            request.command,
            RequestCommand::Schedule(ScheduleCommand::Pause { campaign_id: id })
                if id == campaign_id
        ));
    }

    #[tokio::test]
    async fn oversized_frames_are_refused_before_reading_the_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(MAX_REQUEST_SIZE + 1).to_be_bytes()).await.unwrap();

        let err = read_frame::<Request, _>(&mut server, MAX_REQUEST_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::FrameTooLarge { len, max }
                if len == MAX_REQUEST_SIZE + 1 && max == MAX_REQUEST_SIZE
        ));
    }

    #[tokio::test]
    async fn a_closed_pipe_reads_as_connection_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let err = read_frame::<Request, _>(&mut server, MAX_REQUEST_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::ConnectionClosed));
    }
}
