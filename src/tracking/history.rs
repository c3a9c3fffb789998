use std::collections::VecDeque;
use std::sync::Mutex;

use glam::Mat3;

use super::DeviceMotion;

/// One remembered render pose. The rotation matrix is the orientation
/// quaternion expanded once at insertion so that matching is a plain
/// element-wise comparison per candidate.
#[derive(Clone, Copy, Debug)]
pub struct PoseRecord {
	pub frame_id: u64,
	pub target_timestamp_ns: u64,
	pub motion: DeviceMotion,
	pub rotation: Mat3,
}

/// Ring buffer mapping render poses to frame identifiers.
///
/// Written by the tracking ingestion path, read by the composition path.
/// The buffer is small (a few seconds of poses), so the best-match scan on
/// the submit hot path stays bounded.
pub struct PoseHistory {
	inner: Mutex<Inner>,
}

struct Inner {
	records: VecDeque<PoseRecord>,
	capacity: usize,
	next_frame_id: u64,
}

impl PoseHistory {
	pub fn new(capacity: usize) -> Self {
		Self {
			inner: Mutex::new(Inner {
				records: VecDeque::with_capacity(capacity),
				capacity: capacity.max(1),
				// Frame id 0 means "unknown pose" downstream.
				next_frame_id: 1,
			}),
		}
	}

	/// Appends a pose and returns the frame id assigned to it. A repeated
	/// timestamp (duplicate tracking packet) is not re-recorded; the id of
	/// the existing entry is returned so callers stay idempotent.
	pub fn record(&self, motion: DeviceMotion, target_timestamp_ns: u64) -> u64 {
		let mut inner = self.inner.lock().unwrap();

		if let Some(newest) = inner.records.back() {
			if target_timestamp_ns <= newest.target_timestamp_ns {
				return newest.frame_id;
			}
		}

		let frame_id = inner.next_frame_id;
		inner.next_frame_id += 1;

		let record = PoseRecord {
			frame_id,
			target_timestamp_ns,
			motion,
			rotation: Mat3::from_quat(motion.orientation),
		};
		inner.records.push_back(record);
		while inner.records.len() > inner.capacity {
			inner.records.pop_front();
		}

		frame_id
	}

	/// Returns the record whose rotation matrix is closest to `rotation`
	/// by Frobenius distance, preferring the most recent on ties.
	pub fn best_match(&self, rotation: &Mat3) -> Option<PoseRecord> {
		let inner = self.inner.lock().unwrap();

		let mut best: Option<(f32, PoseRecord)> = None;
		for record in &inner.records {
			let distance = frobenius_squared(&record.rotation, rotation);
			match best {
				// `<=` so that a later (newer) record wins a tie.
				Some((best_distance, _)) if distance > best_distance => {},
				_ => best = Some((distance, *record)),
			}
		}

		best.map(|(_, record)| record)
	}

	pub fn lookup(&self, frame_id: u64) -> Option<PoseRecord> {
		let inner = self.inner.lock().unwrap();
		inner.records.iter().find(|record| record.frame_id == frame_id).copied()
	}

	/// Drops records older than `target_timestamp_ns`. Run from the
	/// cadence tick to keep startup poses from lingering.
	pub fn evict_before(&self, target_timestamp_ns: u64) {
		let mut inner = self.inner.lock().unwrap();
		while let Some(oldest) = inner.records.front() {
			if oldest.target_timestamp_ns >= target_timestamp_ns {
				break;
			}
			inner.records.pop_front();
		}
	}

	/// Drops records more than `window_ns` older than the newest entry.
	pub fn evict_stale(&self, window_ns: u64) {
		let newest = {
			let inner = self.inner.lock().unwrap();
			match inner.records.back() {
				Some(record) => record.target_timestamp_ns,
				None => return,
			}
		};
		self.evict_before(newest.saturating_sub(window_ns));
	}

	pub fn clear(&self) {
		self.inner.lock().unwrap().records.clear();
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

fn frobenius_squared(a: &Mat3, b: &Mat3) -> f32 {
	a.to_cols_array()
		.iter()
		.zip(b.to_cols_array().iter())
		.map(|(x, y)| (x - y) * (x - y))
		.sum()
}
