//! Per-connection session state for the framed duplex channel.
//!
//! A session owns the outbound queue and the pending-response table of one
//! client connection. Writes never interleave: encoded frames go through an
//! unbounded queue drained by a single writer task, so submission order is
//! preserved and at most one write is in flight.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::message::Frame;
use crate::types::GatewayError;

pub mod registry;

pub use registry::SessionRegistry;

/// Default timeout of requests expecting a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

type PendingResponse = oneshot::Sender<Result<Frame, GatewayError>>;

#[derive(Clone)]
pub struct Session {
	inner: Arc<SessionInner>,
}

struct SessionInner {
	endpoint: String,
	connected: AtomicBool,
	outbound: mpsc::UnboundedSender<Bytes>,
	pending: Mutex<HashMap<Vec<u8>, PendingResponse>>,
}

impl Session {
	/// Creates the session and hands back the outbound queue end to be
	/// drained by the connection's writer task.
	pub fn new(endpoint: impl Into<String>) -> (Session, mpsc::UnboundedReceiver<Bytes>) {
		let (outbound, receiver) = mpsc::unbounded_channel();
		let session = Session {
			inner: Arc::new(SessionInner {
				endpoint: endpoint.into(),
				connected: AtomicBool::new(true),
				outbound,
				pending: Mutex::new(HashMap::new()),
			}),
		};
		(session, receiver)
	}

	pub fn endpoint(&self) -> &str {
		&self.inner.endpoint
	}

	pub fn is_connected(&self) -> bool {
		self.inner.connected.load(Ordering::SeqCst)
	}

	/// Enqueues a frame; the writer task issues the actual write.
	pub fn send(&self, frame: &Frame) -> Result<(), GatewayError> {
		if !self.is_connected() {
			return Err(GatewayError::Disconnected);
		}
		self.inner
			.outbound
			.send(frame.encode())
			.map_err(|_| GatewayError::Disconnected)
	}

	/// Sends a frame and waits for the response matching its `seq`.
	///
	/// The pending entry is finalized exactly once: by the matching inbound
	/// frame, by the timeout, or by the disconnect drain — whichever removes
	/// the entry delivers the outcome.
	pub async fn request(&self, frame: &Frame, timeout: Duration) -> Result<Frame, GatewayError> {
		let seq = frame.seq.clone();
		let (sender, mut receiver) = oneshot::channel();
		{
			let mut pending = self.inner.pending.lock().expect("lock poisoned");
			pending.insert(seq.clone(), sender);
		}

		if let Err(error) = self.send(frame) {
			self.inner.pending.lock().expect("lock poisoned").remove(&seq);
			return Err(error);
		}

		match tokio::time::timeout(timeout, &mut receiver).await {
			Ok(Ok(outcome)) => outcome,
			Ok(Err(_)) => Err(GatewayError::Disconnected),
			Err(_) => {
				let removed = self
					.inner
					.pending
					.lock()
					.expect("lock poisoned")
					.remove(&seq)
					.is_some();
				if removed {
					warn!(endpoint = self.inner.endpoint, seq = frame.seq_string(), "Request timed out");
					Err(GatewayError::Timeout)
				} else {
					// the inbound matcher removed the entry first; its
					// outcome is already on the channel
					receiver.await.unwrap_or(Err(GatewayError::Disconnected))
				}
			},
		}
	}

	/// Routes an inbound frame to the pending entry matching its `seq`.
	/// Frames with no pending entry are returned for the general dispatch.
	pub fn handle_inbound(&self, frame: Frame) -> Option<Frame> {
		let pending = {
			let mut pending = self.inner.pending.lock().expect("lock poisoned");
			pending.remove(&frame.seq)
		};
		match pending {
			Some(sender) => {
				debug!(
					endpoint = self.inner.endpoint,
					seq = frame.seq_string(),
					"Matched response to pending request"
				);
				let _ = sender.send(Ok(frame));
				None
			},
			None => Some(frame),
		}
	}

	/// Transitions to disconnected and completes every pending entry with a
	/// disconnect error; idempotent.
	pub fn close(&self) {
		if !self.inner.connected.swap(false, Ordering::SeqCst) {
			return;
		}
		let drained: Vec<PendingResponse> = {
			let mut pending = self.inner.pending.lock().expect("lock poisoned");
			pending.drain().map(|(_, sender)| sender).collect()
		};
		for sender in drained {
			let _ = sender.send(Err(GatewayError::Disconnected));
		}
		debug!(endpoint = self.inner.endpoint, "Session closed");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::message::FrameType;
	use crate::types::StatusCode;

	fn request_frame(seq: &[u8]) -> Frame {
		Frame::with_seq(FrameType::AmopRequest, seq.to_vec(), b"ping".to_vec())
	}

	#[tokio::test]
	async fn outbound_frames_preserve_submission_order() {
		let (session, mut receiver) = Session::new("127.0.0.1:1");
		for index in 0..3u8 {
			let frame = Frame::with_seq(FrameType::BlockNotify, vec![index], vec![]);
			session.send(&frame).unwrap();
		}
		for index in 0..3u8 {
			let encoded = receiver.recv().await.unwrap();
			let frame = Frame::decode(&encoded).unwrap();
			assert_eq!(frame.seq, vec![index]);
		}
	}

	#[tokio::test]
	async fn request_resolves_with_matching_response() {
		let (session, _receiver) = Session::new("127.0.0.1:1");
		let frame = request_frame(b"s1");
		let response = frame.reply(StatusCode::Success, b"pong".to_vec());

		let waiter = tokio::spawn({
			let session = session.clone();
			let frame = frame.clone();
			async move { session.request(&frame, Duration::from_secs(1)).await }
		});
		tokio::task::yield_now().await;

		// response with the same seq goes to the pending entry, not dispatch
		assert!(session.handle_inbound(response).is_none());
		let outcome = waiter.await.unwrap().unwrap();
		assert_eq!(outcome.data, b"pong");
	}

	#[tokio::test]
	async fn request_times_out_exactly_once() {
		let (session, _receiver) = Session::new("127.0.0.1:1");
		let frame = request_frame(b"s1");

		let outcome = session.request(&frame, Duration::from_millis(10)).await;
		assert!(matches!(outcome, Err(GatewayError::Timeout)));

		// the entry is gone, so a late response falls through to dispatch
		let late = frame.reply(StatusCode::Success, vec![]);
		assert!(session.handle_inbound(late).is_some());
	}

	#[tokio::test]
	async fn close_completes_pending_with_disconnect() {
		let (session, _receiver) = Session::new("127.0.0.1:1");
		let frame = request_frame(b"s1");

		let waiter = tokio::spawn({
			let session = session.clone();
			let frame = frame.clone();
			async move { session.request(&frame, Duration::from_secs(5)).await }
		});
		tokio::task::yield_now().await;

		session.close();
		let outcome = waiter.await.unwrap();
		assert!(matches!(outcome, Err(GatewayError::Disconnected)));
	}

	#[tokio::test]
	async fn close_is_idempotent_and_stops_sends() {
		let (session, _receiver) = Session::new("127.0.0.1:1");
		session.close();
		session.close();
		assert!(!session.is_connected());
		assert!(matches!(
			session.send(&request_frame(b"s1")),
			Err(GatewayError::Disconnected)
		));
		assert!(matches!(
			session.request(&request_frame(b"s2"), Duration::from_secs(1)).await,
			Err(GatewayError::Disconnected)
		));
	}

	#[tokio::test]
	async fn unrelated_frames_fall_through_to_dispatch() {
		let (session, _receiver) = Session::new("127.0.0.1:1");
		let frame = request_frame(b"nobody-waits");
		assert!(session.handle_inbound(frame).is_some());
	}
}
