use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Description of one shared texture, as requested by the host process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureDesc {
	pub width: u32,
	pub height: u32,
	pub format: u32,
	pub sample_count: u32,
}

/// Cross-process synchronization primitive on a shared texture, with the
/// acquire/release/timeout semantics of a GPU keyed mutex. Acquisition is
/// always bounded; a timed-out caller walks away and drops its work.
pub struct KeyedMutex<T> {
	held: Mutex<bool>,
	released: Condvar,
	value: UnsafeCell<T>,
}

// The `held` flag grants exclusive access to `value`.
unsafe impl<T: Send> Send for KeyedMutex<T> {}
unsafe impl<T: Send> Sync for KeyedMutex<T> {}

impl<T> KeyedMutex<T> {
	pub fn new(value: T) -> Self {
		Self {
			held: Mutex::new(false),
			released: Condvar::new(),
			value: UnsafeCell::new(value),
		}
	}

	/// Acquires the mutex, waiting at most `timeout`. Returns `None` when
	/// the deadline passes while another owner still holds it.
	pub fn acquire(&self, timeout: Duration) -> Option<KeyedGuard<'_, T>> {
		let deadline = Instant::now() + timeout;
		let mut held = self.held.lock().ok()?;
		while *held {
			let now = Instant::now();
			if now >= deadline {
				return None;
			}
			let (guard, result) = self.released.wait_timeout(held, deadline - now).ok()?;
			held = guard;
			if result.timed_out() && *held {
				return None;
			}
		}
		*held = true;

		Some(KeyedGuard { lock: self })
	}
}

pub struct KeyedGuard<'a, T> {
	lock: &'a KeyedMutex<T>,
}

impl<T> Deref for KeyedGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &T {
		unsafe { &*self.lock.value.get() }
	}
}

impl<T> DerefMut for KeyedGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		unsafe { &mut *self.lock.value.get() }
	}
}

impl<T> Drop for KeyedGuard<'_, T> {
	fn drop(&mut self) {
		if let Ok(mut held) = self.lock.held.lock() {
			*held = false;
		}
		self.lock.released.notify_one();
	}
}

/// One shared texture. The backing image is a CPU pixel buffer (RGBA8)
/// behind the keyed mutex; the host owns the handle, the core never
/// retains pixels past present completion.
pub struct SharedTexture {
	pub set_id: u64,
	pub owner_pid: u32,
	pub desc: TextureDesc,
	pixels: KeyedMutex<Vec<u8>>,
}

impl SharedTexture {
	fn new(set_id: u64, owner_pid: u32, desc: TextureDesc) -> Self {
		Self {
			set_id,
			owner_pid,
			desc,
			pixels: KeyedMutex::new(vec![0u8; desc.width as usize * desc.height as usize * 4]),
		}
	}

	pub fn acquire(&self, timeout: Duration) -> Option<KeyedGuard<'_, Vec<u8>>> {
		self.pixels.acquire(timeout)
	}
}

/// Table of all shared textures, keyed by handle. Entries are reference
/// counted so a texture stays alive while a present still reads it, even
/// if its owner tears the set down mid-frame.
#[derive(Default)]
pub struct SwapchainTable {
	inner: Mutex<TableInner>,
}

#[derive(Default)]
struct TableInner {
	textures: HashMap<u64, Arc<SharedTexture>>,
	next_handle: u64,
	next_set: u64,
}

impl SwapchainTable {
	pub fn new() -> Self {
		Default::default()
	}

	/// Allocates a triple-buffered set of shared textures and returns the
	/// handles published to the host.
	pub fn create_swap_texture_set(&self, owner_pid: u32, desc: TextureDesc) -> [u64; 3] {
		let mut inner = self.inner.lock().unwrap();
		inner.next_set += 1;
		let set_id = inner.next_set;

		let handles = [0u64; 3].map(|_| {
			inner.next_handle += 1;
			let handle = inner.next_handle;
			inner.textures.insert(handle, Arc::new(SharedTexture::new(set_id, owner_pid, desc)));
			handle
		});

		tracing::debug!(
			"Created swap texture set {set_id} for pid {owner_pid}: {}x{} format {} handles {handles:?}.",
			desc.width, desc.height, desc.format,
		);

		handles
	}

	/// Destroys the whole set the handle belongs to. Any one of the set's
	/// three handles suffices.
	pub fn destroy_swap_texture_set(&self, handle: u64) {
		let mut inner = self.inner.lock().unwrap();
		let Some(texture) = inner.textures.get(&handle) else {
			tracing::debug!("Requested to destroy unmanaged texture handle {handle}.");
			return;
		};

		let set_id = texture.set_id;
		inner.textures.retain(|_, texture| texture.set_id != set_id);
	}

	/// Purges every set owned by a host process. Must run on host-process
	/// exit so orphaned sets cannot accumulate.
	pub fn destroy_all_for(&self, owner_pid: u32) {
		let mut inner = self.inner.lock().unwrap();
		let before = inner.textures.len();
		inner.textures.retain(|_, texture| texture.owner_pid != owner_pid);
		tracing::debug!("Destroyed {} textures owned by pid {owner_pid}.", before - inner.textures.len());
	}

	pub fn get(&self, handle: u64) -> Option<Arc<SharedTexture>> {
		self.inner.lock().unwrap().textures.get(&handle).cloned()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().textures.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// Advances a pair of swapchain indices to the next buffer in each set.
pub fn next_swap_index(current: [u32; 2]) -> [u32; 2] {
	[(current[0] + 1) % 3, (current[1] + 1) % 3]
}

#[cfg(test)]
mod tests {
	use super::*;

	const DESC: TextureDesc = TextureDesc { width: 64, height: 64, format: 28, sample_count: 1 };

	#[test]
	fn create_and_destroy_by_any_handle() {
		let table = SwapchainTable::new();
		let handles = table.create_swap_texture_set(100, DESC);
		assert_eq!(table.len(), 3);

		table.destroy_swap_texture_set(handles[1]);
		assert!(table.is_empty());
	}

	#[test]
	fn destroy_all_for_pid_leaves_other_owners() {
		let table = SwapchainTable::new();
		table.create_swap_texture_set(100, DESC);
		let kept = table.create_swap_texture_set(200, DESC);

		table.destroy_all_for(100);
		assert_eq!(table.len(), 3);
		assert!(table.get(kept[0]).is_some());
	}

	#[test]
	fn texture_survives_table_removal_while_referenced() {
		let table = SwapchainTable::new();
		let handles = table.create_swap_texture_set(100, DESC);
		let texture = table.get(handles[0]).unwrap();

		table.destroy_swap_texture_set(handles[0]);
		// The present in progress still holds its reference.
		let guard = texture.acquire(Duration::from_millis(10)).unwrap();
		assert_eq!(guard.len(), 64 * 64 * 4);
	}

	#[test]
	fn keyed_mutex_times_out_while_held() {
		let mutex = Arc::new(KeyedMutex::new(0u32));
		let guard = mutex.acquire(Duration::from_millis(10)).unwrap();

		let contender = mutex.clone();
		let waiter = std::thread::spawn(move || contender.acquire(Duration::from_millis(20)).is_none());
		assert!(waiter.join().unwrap());
		drop(guard);

		assert!(mutex.acquire(Duration::from_millis(10)).is_some());
	}

	#[test]
	fn swap_indices_advance_modulo_three() {
		assert_eq!(next_swap_index([0, 1]), [1, 2]);
		assert_eq!(next_swap_index([2, 2]), [0, 0]);
	}
}
