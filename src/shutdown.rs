//! Shutdown controller for graceful shutdowns in async code.
//!
//! The controller can be cloned and is thread-safe. A shutdown triggers at
//! most once; every observer obtained before or after the trigger resolves
//! with the recorded reason.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Clone)]
pub struct Controller<T: Clone> {
	inner: Arc<Inner<T>>,
}

struct Inner<T> {
	sender: watch::Sender<Option<T>>,
	receiver: watch::Receiver<Option<T>>,
}

/// Error returned when the shutdown is triggered more than once.
#[derive(Debug, Error)]
#[error("shutdown has already commenced")]
pub struct ShutdownHasStarted<T> {
	/// The reason of the already started shutdown.
	pub reason: T,
	/// The reason that was ignored because the shutdown had started.
	pub ignored: T,
}

impl<T: Clone + Send + Sync + 'static> Controller<T> {
	pub fn new() -> Self {
		let (sender, receiver) = watch::channel(None);
		Controller {
			inner: Arc::new(Inner { sender, receiver }),
		}
	}

	pub fn is_shutdown_triggered(&self) -> bool {
		self.inner.receiver.borrow().is_some()
	}

	pub fn shutdown_reason(&self) -> Option<T> {
		self.inner.receiver.borrow().clone()
	}

	/// Triggers the shutdown; later triggers return an error carrying both
	/// the original and the ignored reason.
	pub fn trigger_shutdown(&self, reason: T) -> Result<(), ShutdownHasStarted<T>> {
		let mut result = Ok(());
		self.inner.sender.send_if_modified(|current| match current {
			Some(original) => {
				result = Err(ShutdownHasStarted {
					reason: original.clone(),
					ignored: reason.clone(),
				});
				false
			},
			None => {
				*current = Some(reason.clone());
				true
			},
		});
		result
	}

	/// Resolves when the shutdown is triggered, with the recorded reason.
	pub fn triggered_shutdown(&self) -> impl std::future::Future<Output = T> + Send {
		let mut receiver = self.inner.receiver.clone();
		async move {
			let value = receiver
				.wait_for(Option::is_some)
				.await
				.expect("controller keeps the sender alive");
			value.clone().expect("checked by wait_for")
		}
	}
}

impl<T: Clone + Send + Sync + 'static> Default for Controller<T> {
	fn default() -> Self {
		Self::new()
	}
}
