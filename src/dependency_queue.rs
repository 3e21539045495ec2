//! Causal ordering of remote updates
//!
//! An update may only be applied after its prerequisites: the containing
//! folder version, the previous version of the same file and, for the losing
//! side of a merge, the version it was merged into. Prerequisites that are not
//! part of the queue are assumed to be applied already.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::metadata::FileKey;
use crate::update::Update;

struct Node {
	update: Update,
	/// Resident prerequisites not yet polled
	waiting_on: HashSet<FileKey>,
	/// Resident nodes waiting on this one
	dependents: Vec<FileKey>,
}

/// Yields updates in an order respecting their structural dependencies
#[derive(Default)]
pub struct DependencyQueue {
	nodes: HashMap<FileKey, Node>,
	/// Declared prerequisite -> nodes that declared it
	wanted_by: HashMap<FileKey, Vec<FileKey>>,
	ready: BTreeSet<FileKey>,
	polled: HashSet<FileKey>,
}

/// Keys an update depends on, whether queued or not
pub fn prerequisites(update: &Update) -> Vec<FileKey> {
	let mut keys = Vec::with_capacity(3);
	if let Some(parent) = &update.parent {
		keys.push(parent.key());
	}
	if let Some(previous) = update.previous_key() {
		keys.push(previous);
	}
	if let Some(merged_to) = &update.merged_to {
		keys.push(merged_to.key());
	}
	let own = update.key();
	keys.retain(|k| *k != own);
	keys.dedup();
	keys
}

impl DependencyQueue {
	pub fn new() -> Self {
		DependencyQueue::default()
	}

	/// Queue an update. Returns false if it is already resident or was polled before.
	pub fn add(&mut self, update: Update) -> bool {
		let key = update.key();
		if self.nodes.contains_key(&key) || self.polled.contains(&key) {
			return false;
		}

		let mut waiting_on = HashSet::new();
		for prereq in prerequisites(&update) {
			self.wanted_by.entry(prereq).or_default().push(key);
			if let Some(node) = self.nodes.get_mut(&prereq) {
				node.dependents.push(key);
				waiting_on.insert(prereq);
			}
		}

		// Nodes queued earlier that were waiting for this key without knowing it
		let mut dependents = Vec::new();
		if let Some(waiters) = self.wanted_by.get(&key) {
			for waiter in waiters {
				if let Some(node) = self.nodes.get_mut(waiter) {
					if node.waiting_on.insert(key) {
						dependents.push(*waiter);
						self.ready.remove(waiter);
					}
				}
			}
		}

		if waiting_on.is_empty() {
			self.ready.insert(key);
		}
		self.nodes.insert(key, Node { update, waiting_on, dependents });
		true
	}

	/// Remove and return an update whose prerequisites have all been polled
	pub fn poll(&mut self) -> Option<Update> {
		let key = *self.ready.iter().next()?;
		self.ready.remove(&key);
		let node = self.nodes.remove(&key)?;
		self.polled.insert(key);

		for dependent in node.dependents {
			if let Some(waiter) = self.nodes.get_mut(&dependent) {
				waiter.waiting_on.remove(&key);
				if waiter.waiting_on.is_empty() {
					self.ready.insert(dependent);
				}
			}
		}
		Some(node.update)
	}

	/// Updates still queued
	pub fn len(&self) -> usize {
		self.nodes.len()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	/// Whether anything can be polled right now
	pub fn has_ready(&self) -> bool {
		!self.ready.is_empty()
	}

	/// Remove the updates that can never become ready (dependency cycles)
	pub fn drain_blocked(&mut self) -> Vec<Update> {
		self.ready.clear();
		self.wanted_by.clear();
		let mut blocked: Vec<Update> = self.nodes.drain().map(|(_, n)| n.update).collect();
		blocked.sort_by_key(|u| u.key());
		blocked
	}
}


// vim: ts=4
