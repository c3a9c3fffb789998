use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds of the encode-latency histogram buckets, in microseconds.
/// The last bucket is open-ended.
const LATENCY_BUCKETS_US: [u64; 7] = [500, 1_000, 2_000, 4_000, 8_000, 16_000, 32_000];

/// Rolling session counters. Written by the transport and encoder paths
/// with relaxed atomics, snapshotted lock-free by the control plane.
#[derive(Default)]
pub struct SessionStats {
	video_bytes_sent: AtomicU64,
	video_packets_sent: AtomicU64,
	audio_bytes_sent: AtomicU64,
	audio_packets_sent: AtomicU64,
	frames_encoded: AtomicU64,
	frames_dropped: AtomicU64,
	packets_dropped: AtomicU64,
	fec_failures: AtomicU64,
	encode_latency_buckets: [AtomicU64; 8],

	// Bytes accumulated since the current one-second window opened.
	window_video_bytes: AtomicU64,
	window_bitrate_bps: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
	pub video_bytes_sent: u64,
	pub video_packets_sent: u64,
	pub audio_bytes_sent: u64,
	pub audio_packets_sent: u64,
	pub frames_encoded: u64,
	pub frames_dropped: u64,
	pub packets_dropped: u64,
	pub fec_failures: u64,
	pub encode_latency_buckets: [u64; 8],
	pub window_bitrate_bps: u64,
}

impl SessionStats {
	pub fn new() -> Self {
		Default::default()
	}

	pub fn record_video_packet(&self, bytes: usize) {
		self.video_bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
		self.video_packets_sent.fetch_add(1, Ordering::Relaxed);
		self.window_video_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
	}

	pub fn record_audio_packet(&self, bytes: usize) {
		self.audio_bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
		self.audio_packets_sent.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_frame_encoded(&self, latency: Duration) {
		self.frames_encoded.fetch_add(1, Ordering::Relaxed);

		let latency_us = latency.as_micros() as u64;
		let bucket = LATENCY_BUCKETS_US
			.iter()
			.position(|&bound| latency_us <= bound)
			.unwrap_or(LATENCY_BUCKETS_US.len());
		self.encode_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_frame_dropped(&self) {
		self.frames_dropped.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_packet_dropped(&self) {
		self.packets_dropped.fetch_add(1, Ordering::Relaxed);
	}

	pub fn record_fec_failure(&self) {
		self.fec_failures.fetch_add(1, Ordering::Relaxed);
	}

	pub fn fec_failure_count(&self) -> u64 {
		self.fec_failures.load(Ordering::Relaxed)
	}

	/// Closes the current bitrate window and opens the next one. Called by
	/// the cadence tick once per second.
	pub fn roll_window(&self, elapsed: Duration) {
		let bytes = self.window_video_bytes.swap(0, Ordering::Relaxed);
		let seconds = elapsed.as_secs_f64().max(0.001);
		self.window_bitrate_bps.store((bytes as f64 * 8.0 / seconds) as u64, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> StatsSnapshot {
		StatsSnapshot {
			video_bytes_sent: self.video_bytes_sent.load(Ordering::Relaxed),
			video_packets_sent: self.video_packets_sent.load(Ordering::Relaxed),
			audio_bytes_sent: self.audio_bytes_sent.load(Ordering::Relaxed),
			audio_packets_sent: self.audio_packets_sent.load(Ordering::Relaxed),
			frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
			frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
			packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
			fec_failures: self.fec_failures.load(Ordering::Relaxed),
			encode_latency_buckets: std::array::from_fn(|i| self.encode_latency_buckets[i].load(Ordering::Relaxed)),
			window_bitrate_bps: self.window_bitrate_bps.load(Ordering::Relaxed),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn latency_lands_in_the_right_bucket() {
		let stats = SessionStats::new();
		stats.record_frame_encoded(Duration::from_micros(300));
		stats.record_frame_encoded(Duration::from_micros(3_000));
		stats.record_frame_encoded(Duration::from_millis(100));

		let snapshot = stats.snapshot();
		assert_eq!(snapshot.encode_latency_buckets[0], 1);
		assert_eq!(snapshot.encode_latency_buckets[3], 1);
		assert_eq!(snapshot.encode_latency_buckets[7], 1);
		assert_eq!(snapshot.frames_encoded, 3);
	}

	#[test]
	fn window_roll_reports_bitrate() {
		let stats = SessionStats::new();
		stats.record_video_packet(125_000);
		stats.roll_window(Duration::from_secs(1));
		assert_eq!(stats.snapshot().window_bitrate_bps, 1_000_000);

		// Next window starts empty.
		stats.roll_window(Duration::from_secs(1));
		assert_eq!(stats.snapshot().window_bitrate_bps, 0);
	}
}
