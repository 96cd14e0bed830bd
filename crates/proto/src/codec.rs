//! Length-prefixed postcard framing.
//!
//! Each frame is a `u32` little-endian byte length followed by the postcard
//! encoding of the value.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Framing failures.
#[derive(Debug, Error)]
pub enum CodecError {
	/// The peer closed the socket between frames.
	#[error("connection closed")]
	Closed,
	/// Socket error.
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
	/// Encoding or decoding failed.
	#[error("postcard error: {0}")]
	Postcard(#[from] postcard::Error),
	/// Frame length exceeds [`MAX_FRAME_LEN`].
	#[error("frame of {0} bytes exceeds limit")]
	TooLarge(usize),
}

/// Writes one frame and flushes.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), CodecError>
where
	W: AsyncWrite + Unpin,
	T: Serialize,
{
	let buf = postcard::to_allocvec(value)?;
	if buf.len() > MAX_FRAME_LEN {
		return Err(CodecError::TooLarge(buf.len()));
	}
	writer.write_u32_le(buf.len() as u32).await?;
	writer.write_all(&buf).await?;
	writer.flush().await?;
	Ok(())
}

/// Reads one frame. A clean EOF before the length prefix yields
/// [`CodecError::Closed`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, CodecError>
where
	R: AsyncRead + Unpin,
	T: DeserializeOwned,
{
	let len = match reader.read_u32_le().await {
		Ok(len) => len as usize,
		Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(CodecError::Closed),
		Err(e) => return Err(e.into()),
	};
	if len > MAX_FRAME_LEN {
		return Err(CodecError::TooLarge(len));
	}
	let mut buf = vec![0u8; len];
	reader.read_exact(&mut buf).await?;
	Ok(postcard::from_bytes(&buf)?)
}
