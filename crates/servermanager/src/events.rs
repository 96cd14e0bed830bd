//! Observer lists with drop-to-unsubscribe handles.
//!
//! Callbacks are cloned out of the list before they run, so a callback may
//! subscribe, unsubscribe or emit on the same list without deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListenerList<E> {
	next: AtomicU64,
	slots: Mutex<Vec<(u64, Callback<E>)>>,
}

trait Unsubscribe: Send + Sync {
	fn remove(&self, id: u64);
}

impl<E> Unsubscribe for ListenerList<E> {
	fn remove(&self, id: u64) {
		self.slots.lock().retain(|(slot, _)| *slot != id);
	}
}

/// Observer list for events of type `E`.
pub struct Listeners<E> {
	inner: Arc<ListenerList<E>>,
}

impl<E> Default for Listeners<E> {
	fn default() -> Self {
		Self {
			inner: Arc::new(ListenerList {
				next: AtomicU64::new(1),
				slots: Mutex::new(Vec::new()),
			}),
		}
	}
}

impl<E: 'static> std::fmt::Debug for Listeners<E> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Listeners").field("len", &self.len()).finish()
	}
}

impl<E: 'static> Listeners<E> {
	/// Registers `callback`; it stays registered until the returned
	/// [`Subscription`] is dropped.
	#[must_use = "dropping the subscription unsubscribes immediately"]
	pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
		let id = self.inner.next.fetch_add(1, Ordering::Relaxed);
		self.inner.slots.lock().push((id, Arc::new(callback)));
		let list: Arc<dyn Unsubscribe> = self.inner.clone();
		Subscription {
			list: Arc::downgrade(&list),
			id,
		}
	}

	/// Invokes every registered callback with `event`.
	pub fn emit(&self, event: &E) {
		let callbacks: Vec<Callback<E>> =
			self.inner.slots.lock().iter().map(|(_, cb)| cb.clone()).collect();
		for callback in callbacks {
			callback(event);
		}
	}

	/// Number of registered callbacks.
	pub fn len(&self) -> usize {
		self.inner.slots.lock().len()
	}

	/// Returns `true` if nothing is registered.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Registration handle returned by [`Listeners::subscribe`].
pub struct Subscription {
	list: Weak<dyn Unsubscribe>,
	id: u64,
}

impl Subscription {
	/// Keeps the callback registered for the lifetime of the list.
	pub fn detach(mut self) {
		self.list = Weak::<ListenerList<()>>::new();
	}
}

impl std::fmt::Debug for Subscription {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Subscription").field("id", &self.id).finish()
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(list) = self.list.upgrade() {
			list.remove(self.id);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	#[test]
	fn dropping_subscription_unsubscribes() {
		let listeners = Listeners::<u32>::default();
		let hits = Arc::new(AtomicUsize::new(0));
		let counter = hits.clone();
		let sub = listeners.subscribe(move |v| {
			counter.fetch_add(*v as usize, Ordering::Relaxed);
		});
		listeners.emit(&2);
		drop(sub);
		listeners.emit(&5);
		assert_eq!(hits.load(Ordering::Relaxed), 2);
		assert!(listeners.is_empty());
	}

	#[test]
	fn callbacks_may_reenter_the_list() {
		let listeners = Arc::new(Listeners::<()>::default());
		let inner = listeners.clone();
		let _sub = listeners.subscribe(move |_| {
			assert_eq!(inner.len(), 1);
		});
		listeners.emit(&());
	}

	#[test]
	fn detached_subscription_outlives_handle() {
		let listeners = Listeners::<()>::default();
		listeners.subscribe(|_| {}).detach();
		assert_eq!(listeners.len(), 1);
	}
}
