//! Per-owner single flight.
//!
//! The engine keeps no state between passes, so two passes for the same owner
//! must not overlap. Callers take an [`OwnerGuard`] before starting a pass;
//! passes for different owners run freely.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
};

use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<Mutex<()>>>;

/// One async lock per owner key, created on demand.
#[derive(Debug, Clone, Default)]
pub struct OwnerLocks {
	locks: Arc<StdMutex<LockMap>>,
}

/// Exclusive right to reconcile one owner. Released on drop.
#[derive(Debug)]
pub struct OwnerGuard {
	guard: Option<OwnedMutexGuard<()>>,
	lock: Arc<Mutex<()>>,
	key: String,
	locks: Arc<StdMutex<LockMap>>,
}

fn locked(locks: &StdMutex<LockMap>) -> MutexGuard<'_, LockMap> {
	locks.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OwnerLocks {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
		locked(&self.locks)
			.entry(key.to_string())
			.or_default()
			.clone()
	}

	fn guard(&self, key: &str, lock: Arc<Mutex<()>>, guard: OwnedMutexGuard<()>) -> OwnerGuard {
		OwnerGuard {
			guard: Some(guard),
			lock,
			key: key.to_string(),
			locks: self.locks.clone(),
		}
	}

	/// Wait until no other pass holds `key`.
	pub async fn acquire(&self, key: &str) -> OwnerGuard {
		let lock = self.lock_for(key);
		let guard = lock.clone().lock_owned().await;
		self.guard(key, lock, guard)
	}

	/// Take `key` only if it is free right now.
	pub fn try_acquire(&self, key: &str) -> Option<OwnerGuard> {
		let lock = self.lock_for(key);
		let guard = lock.clone().try_lock_owned().ok();
		match guard {
			Some(guard) => Some(self.guard(key, lock, guard)),
			None => {
				drop(lock);
				self.release_unused(key);
				None
			}
		}
	}

	/// Number of owners with a held or awaited lock.
	pub fn len(&self) -> usize {
		locked(&self.locks).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn release_unused(&self, key: &str) {
		let mut locks = locked(&self.locks);
		if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
			locks.remove(key);
		}
	}
}

impl OwnerGuard {
	pub fn key(&self) -> &str {
		&self.key
	}
}

impl Drop for OwnerGuard {
	fn drop(&mut self) {
		self.guard.take();
		let mut locks = locked(&self.locks);
		// Only the map and this guard still reference the lock.
		if Arc::strong_count(&self.lock) == 2 {
			locks.remove(&self.key);
		}
	}
}
