//! Bounded worker pool for per-object backend work.

use std::{collections::HashMap, future::Future, sync::Arc};

use tokio::{
	sync::Semaphore,
	task::{Id, JoinSet},
};

use crate::object::ObjectKey;

/// A task that did not produce a result.
#[derive(Debug)]
pub(crate) struct Panicked {
	pub key: ObjectKey,
	pub message: String,
}

/// Runs one task per object with at most `limit` of them in flight.
///
/// Tasks are independent: a panicking task is reported against its object and
/// does not cancel its siblings.
pub(crate) struct BoundedPool<R> {
	semaphore: Arc<Semaphore>,
	tasks: JoinSet<R>,
	keys: HashMap<Id, ObjectKey>,
}

impl<R: Send + 'static> BoundedPool<R> {
	pub fn new(limit: usize) -> Self {
		Self {
			semaphore: Arc::new(Semaphore::new(limit.max(1))),
			tasks: JoinSet::new(),
			keys: HashMap::new(),
		}
	}

	pub fn spawn<F>(&mut self, key: ObjectKey, task: F)
	where
		F: Future<Output = R> + Send + 'static,
	{
		let semaphore = self.semaphore.clone();
		let handle = self.tasks.spawn(async move {
			// The semaphore is never closed, a failed acquire only lifts the bound.
			let _permit = semaphore.acquire_owned().await.ok();
			task.await
		});
		self.keys.insert(handle.id(), key);
	}

	/// Wait for every task to finish.
	pub async fn join(mut self) -> Vec<Result<R, Panicked>> {
		let mut results = Vec::with_capacity(self.keys.len());
		while let Some(joined) = self.tasks.join_next().await {
			match joined {
				Ok(result) => results.push(Ok(result)),
				Err(error) => {
					let Some(key) = self.keys.remove(&error.id()) else {
						tracing::error!(error = %error, "untracked task failed");
						continue;
					};
					results.push(Err(Panicked {
						key,
						message: error.to_string(),
					}));
				}
			}
		}
		results
	}
}
