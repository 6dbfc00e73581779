//! Frame encoding/decoding for the tunnel protocol

use super::{MessageType, ProtocolError, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type
    pub message_type: MessageType,
    /// Payload data
    pub payload: Bytes,
}

impl Message {
    /// Create a message of the given type
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
        }
    }

    /// Create an auth message carrying the plaintext password
    pub fn auth(password: &str) -> Self {
        Self::new(MessageType::Auth, Bytes::copy_from_slice(password.as_bytes()))
    }

    /// Create an auth response message
    pub fn auth_response(verdict: &'static [u8]) -> Self {
        Self::new(MessageType::AuthResponse, Bytes::from_static(verdict))
    }

    /// Get the total encoded size of this message
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a message to bytes
pub fn encode(message: &Message) -> Result<BytesMut, ProtocolError> {
    let payload_len = message.payload.len();
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload_len));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);

    // Type (1 byte)
    buf.put_u8(message.message_type as u8);

    // Payload length (4 bytes, big endian)
    buf.put_u32(payload_len as u32);

    buf.extend_from_slice(&message.payload);

    Ok(buf)
}

/// Decode exactly one message from a stream
///
/// Never reads past the end of the frame, so repeated calls on the same
/// stream yield consecutive messages. A frame with an unknown type byte is
/// still consumed whole before `InvalidMessageType` is returned.
pub async fn decode<R>(reader: &mut R) -> Result<Message, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_SIZE];
    read_full(reader, &mut header).await?;

    let payload_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

    // Checked before allocating
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len];
    read_full(reader, &mut payload).await?;

    let message_type = MessageType::try_from(header[0])?;
    Ok(Message {
        message_type,
        payload: Bytes::from(payload),
    })
}

/// Encode a message and write it as a single buffer
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let buf = encode(message)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(ProtocolError::IncompleteFrame)
        }
        Err(e) => Err(ProtocolError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_encode_decode() {
        let original = Message::new(MessageType::Data, Bytes::from_static(b"Hello, World!"));
        let encoded = encode(&original).unwrap();

        assert_eq!(encoded.len(), original.encoded_size());
        assert_eq!(encoded[0], MessageType::Data as u8);
        assert_eq!(&encoded[1..5], &13u32.to_be_bytes());

        let mut reader = &encoded[..];
        let decoded = decode(&mut reader).await.unwrap();
        assert_eq!(decoded, original);
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let original = Message::new(MessageType::Heartbeat, Bytes::new());
        let encoded = encode(&original).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE);

        let mut reader = &encoded[..];
        assert_eq!(decode(&mut reader).await.unwrap(), original);
    }

    #[test]
    fn test_size_bound() {
        let at_limit = Message::new(MessageType::Data, vec![0u8; MAX_PAYLOAD_SIZE]);
        assert!(encode(&at_limit).is_ok());

        let over_limit = Message::new(MessageType::Data, vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        assert!(matches!(
            encode(&over_limit),
            Err(ProtocolError::FrameTooLarge(n)) if n == MAX_PAYLOAD_SIZE + 1
        ));
    }

    #[tokio::test]
    async fn test_decode_rejects_oversized_length() {
        let mut raw = vec![MessageType::Data as u8];
        raw.extend_from_slice(&((MAX_PAYLOAD_SIZE as u32) + 1).to_be_bytes());

        let mut reader = &raw[..];
        assert!(matches!(
            decode(&mut reader).await,
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let encoded = encode(&Message::auth("secret")).unwrap();
        let truncated = &encoded[..encoded.len() - 1];

        let mut reader = truncated;
        assert!(matches!(
            decode(&mut reader).await,
            Err(ProtocolError::IncompleteFrame)
        ));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let mut reader: &[u8] = &[MessageType::Data as u8, 0, 0];
        assert!(matches!(
            decode(&mut reader).await,
            Err(ProtocolError::IncompleteFrame)
        ));

        let mut empty: &[u8] = &[];
        assert!(matches!(
            decode(&mut empty).await,
            Err(ProtocolError::IncompleteFrame)
        ));
    }

    #[tokio::test]
    async fn test_unknown_type_consumes_frame() {
        let mut stream = vec![7u8, 0, 0, 0, 2, b'h', b'i'];
        stream.extend_from_slice(&encode(&Message::auth("secret")).unwrap());

        let mut reader = &stream[..];
        assert!(matches!(
            decode(&mut reader).await,
            Err(ProtocolError::InvalidMessageType(7))
        ));
        assert_eq!(decode(&mut reader).await.unwrap(), Message::auth("secret"));
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_sequential_decode() {
        let first = Message::auth("secret");
        let second = Message::auth_response(crate::protocol::AUTH_OK);

        let mut stream = encode(&first).unwrap();
        stream.extend_from_slice(&encode(&second).unwrap());

        let mut reader = &stream[..];
        assert_eq!(decode(&mut reader).await.unwrap(), first);
        assert_eq!(decode(&mut reader).await.unwrap(), second);
        assert!(reader.is_empty());
    }
}
