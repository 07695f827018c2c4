//! Filter matching of receipt logs against a subscription.

use crate::event::EventFilterParams;
use crate::types::{Block, LogEntry};

/// Collects the log entries of `block` matching `params`.
///
/// A log matches when its address is in the address set (an empty set matches
/// every address) and its topic vector matches positionally: at position `i`
/// either the filter set is empty or the log's `i`-th topic is in it. Pure:
/// a fixed (params, block) pair always yields the same entries.
pub fn matches(params: &EventFilterParams, block: &Block) -> Vec<LogEntry> {
	let mut entries = Vec::new();
	for receipt in &block.receipts {
		for log in &receipt.logs {
			if !params.addresses.is_empty() && !params.addresses.contains(&log.address) {
				continue;
			}
			if !topics_match(&params.topics, &log.topics) {
				continue;
			}
			entries.push(LogEntry {
				address: log.address.clone(),
				topics: log.topics.clone(),
				data: log.data.clone(),
				block_number: block.number,
				transaction_hash: receipt.transaction_hash.clone(),
			});
		}
	}
	entries
}

fn topics_match(filter: &[Vec<String>], topics: &[String]) -> bool {
	filter.iter().enumerate().all(|(position, wanted)| {
		wanted.is_empty()
			|| topics
				.get(position)
				.is_some_and(|topic| wanted.contains(topic))
	})
}
