//! Binary frame codec for the client-facing duplex channel.
//!
//! Wire layout, big-endian, one logical frame per WebSocket binary message:
//!
//! ```text
//! type: u16 | status: i16 | seqLen: u16 | seq[seqLen] | dataLen: u32 | data[dataLen]
//! ```
//!
//! The `seq` is an opaque correlation id chosen by the sender; responses echo
//! it. Frame type codes are stable across versions:
//!
//! * `0x100` HANDSHAKE
//! * `0x101` RPC_REQUEST (responses echo the request type)
//! * `0x102` BLOCK_NOTIFY
//! * `0x110` AMOP_SUBTOPIC
//! * `0x111` AMOP_REQUEST
//! * `0x112` AMOP_BROADCAST
//! * `0x113` AMOP_RESPONSE
//! * `0x120` EVENT_SUBSCRIBE
//! * `0x121` EVENT_UNSUBSCRIBE
//! * `0x122` EVENT_LOG_PUSH

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::types::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
	Handshake,
	RpcRequest,
	BlockNotify,
	AmopSubTopic,
	AmopRequest,
	AmopBroadcast,
	AmopResponse,
	EventSubscribe,
	EventUnsubscribe,
	EventLogPush,
}

impl FrameType {
	pub fn code(&self) -> u16 {
		match self {
			FrameType::Handshake => 0x100,
			FrameType::RpcRequest => 0x101,
			FrameType::BlockNotify => 0x102,
			FrameType::AmopSubTopic => 0x110,
			FrameType::AmopRequest => 0x111,
			FrameType::AmopBroadcast => 0x112,
			FrameType::AmopResponse => 0x113,
			FrameType::EventSubscribe => 0x120,
			FrameType::EventUnsubscribe => 0x121,
			FrameType::EventLogPush => 0x122,
		}
	}

	pub fn from_code(code: u16) -> Option<FrameType> {
		match code {
			0x100 => Some(FrameType::Handshake),
			0x101 => Some(FrameType::RpcRequest),
			0x102 => Some(FrameType::BlockNotify),
			0x110 => Some(FrameType::AmopSubTopic),
			0x111 => Some(FrameType::AmopRequest),
			0x112 => Some(FrameType::AmopBroadcast),
			0x113 => Some(FrameType::AmopResponse),
			0x120 => Some(FrameType::EventSubscribe),
			0x121 => Some(FrameType::EventUnsubscribe),
			0x122 => Some(FrameType::EventLogPush),
			_ => None,
		}
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
	#[error("frame truncated: needed {needed} more bytes")]
	Truncated { needed: usize },
	#[error("frame length fields exceed payload: {0}")]
	LengthMismatch(usize),
}

/// One unit on the wire. `frame_type` is kept raw so that frames with a code
/// this version does not know still decode; the router drops them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub frame_type: u16,
	pub status: i16,
	pub seq: Vec<u8>,
	pub data: Vec<u8>,
}

impl Frame {
	/// New request frame with a generated correlation id.
	pub fn new(frame_type: FrameType, data: Vec<u8>) -> Self {
		Frame {
			frame_type: frame_type.code(),
			status: StatusCode::Success.code(),
			seq: Uuid::new_v4().as_simple().to_string().into_bytes(),
			data,
		}
	}

	pub fn with_seq(frame_type: FrameType, seq: Vec<u8>, data: Vec<u8>) -> Self {
		Frame {
			frame_type: frame_type.code(),
			status: StatusCode::Success.code(),
			seq,
			data,
		}
	}

	/// Response frame echoing this frame's type and correlation id.
	pub fn reply(&self, status: StatusCode, data: Vec<u8>) -> Frame {
		Frame {
			frame_type: self.frame_type,
			status: status.code(),
			seq: self.seq.clone(),
			data,
		}
	}

	/// Response frame of a different type, keeping the correlation id.
	pub fn reply_as(&self, frame_type: FrameType, status: StatusCode, data: Vec<u8>) -> Frame {
		Frame {
			frame_type: frame_type.code(),
			status: status.code(),
			seq: self.seq.clone(),
			data,
		}
	}

	pub fn kind(&self) -> Option<FrameType> {
		FrameType::from_code(self.frame_type)
	}

	pub fn seq_string(&self) -> String {
		String::from_utf8_lossy(&self.seq).into_owned()
	}

	pub fn encode(&self) -> Bytes {
		let mut buffer = BytesMut::with_capacity(10 + self.seq.len() + self.data.len());
		buffer.put_u16(self.frame_type);
		buffer.put_i16(self.status);
		buffer.put_u16(self.seq.len() as u16);
		buffer.put_slice(&self.seq);
		buffer.put_u32(self.data.len() as u32);
		buffer.put_slice(&self.data);
		buffer.freeze()
	}

	pub fn decode(mut input: &[u8]) -> Result<Frame, CodecError> {
		if input.remaining() < 6 {
			return Err(CodecError::Truncated {
				needed: 6 - input.remaining(),
			});
		}
		let frame_type = input.get_u16();
		let status = input.get_i16();
		let seq_len = input.get_u16() as usize;
		if input.remaining() < seq_len {
			return Err(CodecError::Truncated {
				needed: seq_len - input.remaining(),
			});
		}
		let seq = input.copy_to_bytes(seq_len).to_vec();
		if input.remaining() < 4 {
			return Err(CodecError::Truncated {
				needed: 4 - input.remaining(),
			});
		}
		let data_len = input.get_u32() as usize;
		if input.remaining() != data_len {
			return Err(CodecError::LengthMismatch(input.remaining()));
		}
		let data = input.copy_to_bytes(data_len).to_vec();

		Ok(Frame {
			frame_type,
			status,
			seq,
			data,
		})
	}
}
