//! Codec of the messages exchanged with peer nodes over the gateway mesh.
//!
//! Wire layout, big-endian: `type: u16 | topicLen: u16 | topic[topicLen] |
//! data[..]`. The enclosing transport delimits the message, so the data runs
//! to the end of the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmopMsgType {
	/// Periodic advertisement of the local topic sequence.
	TopicSeq,
	/// Pull request for a peer's full topic snapshot.
	RequestTopic,
	/// Full topic snapshot, answering a pull.
	ResponseTopic,
	/// Unicast request routed to one subscriber.
	Request,
	/// Fire-and-forget fan-out to every subscriber.
	Broadcast,
	/// Response to a unicast request.
	Response,
}

impl AmopMsgType {
	pub fn code(&self) -> u16 {
		match self {
			AmopMsgType::TopicSeq => 0x1,
			AmopMsgType::RequestTopic => 0x2,
			AmopMsgType::ResponseTopic => 0x3,
			AmopMsgType::Request => 0x4,
			AmopMsgType::Broadcast => 0x5,
			AmopMsgType::Response => 0x6,
		}
	}

	pub fn from_code(code: u16) -> Option<AmopMsgType> {
		match code {
			0x1 => Some(AmopMsgType::TopicSeq),
			0x2 => Some(AmopMsgType::RequestTopic),
			0x3 => Some(AmopMsgType::ResponseTopic),
			0x4 => Some(AmopMsgType::Request),
			0x5 => Some(AmopMsgType::Broadcast),
			0x6 => Some(AmopMsgType::Response),
			_ => None,
		}
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmopCodecError {
	#[error("message truncated")]
	Truncated,
	#[error("unknown message type {0:#x}")]
	UnknownType(u16),
	#[error("topic is not valid utf-8")]
	InvalidTopic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmopMessage {
	pub msg_type: AmopMsgType,
	pub topic: String,
	pub data: Vec<u8>,
}

impl AmopMessage {
	pub fn new(msg_type: AmopMsgType, topic: impl Into<String>, data: Vec<u8>) -> Self {
		AmopMessage {
			msg_type,
			topic: topic.into(),
			data,
		}
	}

	pub fn topic_seq(sequence: u32) -> Self {
		AmopMessage::new(
			AmopMsgType::TopicSeq,
			"",
			sequence.to_string().into_bytes(),
		)
	}

	pub fn encode(&self) -> Bytes {
		let mut buffer = BytesMut::with_capacity(4 + self.topic.len() + self.data.len());
		buffer.put_u16(self.msg_type.code());
		buffer.put_u16(self.topic.len() as u16);
		buffer.put_slice(self.topic.as_bytes());
		buffer.put_slice(&self.data);
		buffer.freeze()
	}

	pub fn decode(mut input: &[u8]) -> Result<AmopMessage, AmopCodecError> {
		if input.remaining() < 4 {
			return Err(AmopCodecError::Truncated);
		}
		let code = input.get_u16();
		let msg_type = AmopMsgType::from_code(code).ok_or(AmopCodecError::UnknownType(code))?;
		let topic_len = input.get_u16() as usize;
		if input.remaining() < topic_len {
			return Err(AmopCodecError::Truncated);
		}
		let topic = String::from_utf8(input.copy_to_bytes(topic_len).to_vec())
			.map_err(|_| AmopCodecError::InvalidTopic)?;
		let data = input.copy_to_bytes(input.remaining()).to_vec();

		Ok(AmopMessage {
			msg_type,
			topic,
			data,
		})
	}
}
