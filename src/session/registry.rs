//! Registry of active sessions, keyed by remote endpoint.
//!
//! The registry owns sessions for their connected lifetime; other components
//! hold the endpoint key and look the session up per use. Eviction happens on
//! the single disconnect path, which also fans out to the registered hooks so
//! topic and subscription state can be released.

use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

use crate::session::Session;

type DisconnectHook = Box<dyn Fn(&str) + Send + Sync>;

pub struct SessionRegistry {
	sessions: RwLock<HashMap<String, Session>>,
	disconnect_hooks: RwLock<Vec<DisconnectHook>>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		SessionRegistry {
			sessions: RwLock::new(HashMap::new()),
			disconnect_hooks: RwLock::new(Vec::new()),
		}
	}

	pub fn register_disconnect_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
		self.disconnect_hooks
			.write()
			.expect("lock poisoned")
			.push(Box::new(hook));
	}

	pub fn add(&self, session: Session) {
		let endpoint = session.endpoint().to_string();
		self.sessions
			.write()
			.expect("lock poisoned")
			.insert(endpoint.clone(), session);
		info!(endpoint, "Session registered");
	}

	pub fn get(&self, endpoint: &str) -> Option<Session> {
		self.sessions
			.read()
			.expect("lock poisoned")
			.get(endpoint)
			.cloned()
	}

	/// Snapshot of the currently connected sessions.
	pub fn sessions(&self) -> Vec<Session> {
		self.sessions
			.read()
			.expect("lock poisoned")
			.values()
			.filter(|session| session.is_connected())
			.cloned()
			.collect()
	}

	pub fn len(&self) -> usize {
		self.sessions.read().expect("lock poisoned").len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Evicts and closes the session, then notifies the disconnect hooks.
	/// The hooks run once even if called concurrently with a second path,
	/// since only one caller finds the entry present.
	pub fn disconnect(&self, endpoint: &str) {
		let removed = self
			.sessions
			.write()
			.expect("lock poisoned")
			.remove(endpoint);
		let Some(session) = removed else {
			debug!(endpoint, "Disconnect for unknown session");
			return;
		};
		session.close();

		let hooks = self.disconnect_hooks.read().expect("lock poisoned");
		for hook in hooks.iter() {
			hook(endpoint);
		}
		info!(endpoint, "Session disconnected");
	}
}

impl Default for SessionRegistry {
	fn default() -> Self {
		Self::new()
	}
}
