use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use tokio::sync::{broadcast, Notify};

use crate::config::{BitrateConfig, FecConfig};
use crate::stats::SessionStats;
use crate::tracking::PoseHistory;

/// Pose records older than this fall out on the cadence tick.
const POSE_RETENTION: Duration = Duration::from_secs(5);

/// FEC failures further apart than this are unrelated incidents.
const CONTINUOUS_FEC_FAILURE: Duration = Duration::from_secs(60);

/// Unrecoverable frames in a row before the parity overhead steps up.
const FEC_FAILURE_BURST: u32 = 3;

/// Coalesces IDR requests and enforces a minimum spacing between
/// keyframes so a storm of requests cannot flood the link.
pub struct IdrScheduler {
	inner: Mutex<IdrState>,
}

struct IdrState {
	pending: bool,
	last_idr: Option<Instant>,
	min_spacing: Duration,
}

impl IdrScheduler {
	pub fn new(refresh_rate: f32) -> Self {
		Self {
			inner: Mutex::new(IdrState {
				pending: false,
				last_idr: None,
				// Two frame intervals between keyframes at minimum.
				min_spacing: Duration::from_secs_f64(2.0 / refresh_rate.max(1.0) as f64),
			}),
		}
	}

	/// Notes that somebody wants a keyframe. Any number of requests
	/// within one frame collapse into a single IDR.
	pub fn request(&self) {
		self.inner.lock().unwrap().pending = true;
	}

	/// Polled by the encode loop once per frame: true when this frame
	/// should be an IDR.
	pub fn take_due(&self) -> bool {
		let mut state = self.inner.lock().unwrap();
		if !state.pending {
			return false;
		}
		if let Some(last) = state.last_idr {
			if last.elapsed() < state.min_spacing {
				return false;
			}
		}
		state.pending = false;
		state.last_idr = Some(Instant::now());
		true
	}

	/// Records an IDR the encoder produced on its own (the first frame of
	/// a stream), so the spacing clock covers it too.
	pub fn note_idr_sent(&self) {
		let mut state = self.inner.lock().unwrap();
		state.pending = false;
		state.last_idr = Some(Instant::now());
	}
}

/// Dynamic bitrate: a smoothed minimum of what the host requests and what
/// the link measurably carries, clamped to the configured bounds.
pub struct BitrateController {
	requested_bps: u64,
	min_bps: u64,
	max_bps: u64,
	smoothed_link_bps: Option<f64>,
	current_bps: u64,
}

/// Relative change below which a new target is not worth a reconfigure.
const BITRATE_DEADBAND: f64 = 0.05;

/// Smoothing factor for the link capacity estimate.
const LINK_EMA_ALPHA: f64 = 0.2;

impl BitrateController {
	pub fn new(config: &BitrateConfig) -> Self {
		Self {
			requested_bps: config.initial_bps,
			min_bps: config.min_bps,
			max_bps: config.max_bps,
			smoothed_link_bps: None,
			current_bps: config.initial_bps,
		}
	}

	pub fn current_bps(&self) -> u64 {
		self.current_bps
	}

	/// Host-side request, e.g. a settings change mid-stream.
	pub fn set_requested(&mut self, bitrate_bps: u64) {
		self.requested_bps = bitrate_bps;
	}

	/// Folds a client throughput observation into the link estimate.
	pub fn on_client_report(&mut self, observed_throughput_bps: u64) {
		if observed_throughput_bps == 0 {
			return;
		}
		let observed = observed_throughput_bps as f64;
		self.smoothed_link_bps = Some(match self.smoothed_link_bps {
			Some(smoothed) => smoothed + LINK_EMA_ALPHA * (observed - smoothed),
			None => observed,
		});
	}

	/// Recomputes the target; `Some` means the encoder should be retuned
	/// to the returned bitrate at its next frame boundary.
	pub fn sample(&mut self) -> Option<u64> {
		let link = self.smoothed_link_bps.unwrap_or(self.requested_bps as f64);
		let target = (self.requested_bps as f64).min(link);
		let target = (target as u64).clamp(self.min_bps, self.max_bps);

		let relative_change = (target as f64 - self.current_bps as f64).abs() / self.current_bps as f64;
		if relative_change <= BITRATE_DEADBAND {
			return None;
		}

		self.current_bps = target;
		Some(target)
	}
}

/// Steps the parity overhead between its configured bounds: up after a
/// burst of consecutive FEC failures, back down once the path has been
/// quiet for a while.
pub struct FecController {
	initial_percentage: u16,
	max_percentage: u16,
	current_percentage: u16,
	consecutive_failures: u32,
	last_failure: Option<Instant>,
}

impl FecController {
	pub fn new(config: &FecConfig) -> Self {
		Self {
			initial_percentage: config.initial_percentage,
			max_percentage: config.max_percentage,
			current_percentage: config.initial_percentage,
			consecutive_failures: 0,
			last_failure: None,
		}
	}

	pub fn percentage(&self) -> u16 {
		self.current_percentage
	}

	/// Reports one unrecoverable frame. Returns true when the overhead
	/// stepped up, which is also the moment to force an IDR.
	pub fn on_fec_failure(&mut self) -> bool {
		let now = Instant::now();
		let continuous = self
			.last_failure
			.is_some_and(|last| now.duration_since(last) < CONTINUOUS_FEC_FAILURE);
		self.consecutive_failures = if continuous { self.consecutive_failures + 1 } else { 1 };
		self.last_failure = Some(now);

		if self.consecutive_failures >= FEC_FAILURE_BURST && self.current_percentage < self.max_percentage {
			tracing::info!(
				"{} consecutive FEC failures, raising parity overhead to {}%.",
				self.consecutive_failures, self.max_percentage,
			);
			self.current_percentage = self.max_percentage;
			return true;
		}
		false
	}

	/// Called on the cadence tick: after a quiet window, the extra parity
	/// is wasted overhead and drops back to the initial level.
	pub fn on_tick(&mut self) {
		if self.current_percentage == self.initial_percentage {
			return;
		}
		let quiet = self
			.last_failure
			.map_or(true, |last| last.elapsed() >= CONTINUOUS_FEC_FAILURE);
		if quiet {
			tracing::info!("FEC failures quiet, lowering parity overhead to {}%.", self.initial_percentage);
			self.current_percentage = self.initial_percentage;
			self.consecutive_failures = 0;
		}
	}
}

/// Per-session pacing: a vsync timer at the negotiated refresh rate and
/// the once-a-second bookkeeping pass (statistics windows, pose
/// eviction, FEC decay).
pub struct Cadence {
	vsync_tx: broadcast::Sender<()>,
}

impl Cadence {
	pub fn spawn<R: Clone + Send + Sync + 'static>(
		refresh_rate: f32,
		stats: Arc<SessionStats>,
		pose_history: Arc<PoseHistory>,
		fec: Arc<Mutex<FecController>>,
		present_notify: Arc<Notify>,
		vsync_tx: broadcast::Sender<()>,
		stop_session_manager: ShutdownManager<R>,
	) -> Self {
		let handle = vsync_tx.clone();
		tokio::spawn(run_cadence(
			refresh_rate,
			stats,
			pose_history,
			fec,
			present_notify,
			vsync_tx,
			stop_session_manager,
		));

		Self { vsync_tx: handle }
	}

	/// The vsync event stream the host runtime paces itself with.
	pub fn subscribe_vsync(&self) -> broadcast::Receiver<()> {
		self.vsync_tx.subscribe()
	}
}

async fn run_cadence<R: Clone + Send + Sync + 'static>(
	refresh_rate: f32,
	stats: Arc<SessionStats>,
	pose_history: Arc<PoseHistory>,
	fec: Arc<Mutex<FecController>>,
	present_notify: Arc<Notify>,
	vsync_tx: broadcast::Sender<()>,
	stop_session_manager: ShutdownManager<R>,
) {
	let _delay_stop = stop_session_manager.delay_shutdown_token();

	let frame_interval = Duration::from_secs_f64(1.0 / refresh_rate.max(1.0) as f64);
	let mut vsync_timer = tokio::time::interval(frame_interval);
	vsync_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

	let mut last_roll = Instant::now();
	tracing::debug!("Cadence running at {refresh_rate} Hz.");

	while !stop_session_manager.is_shutdown_triggered() {
		tokio::select! {
			_ = vsync_timer.tick() => {},
			// A present landing early re-aligns the pulse to the host.
			_ = present_notify.notified() => {},
			_ = stop_session_manager.wait_shutdown_triggered() => break,
		}

		let _ = vsync_tx.send(());

		if last_roll.elapsed() >= Duration::from_secs(1) {
			let elapsed = last_roll.elapsed();
			last_roll = Instant::now();

			stats.roll_window(elapsed);
			fec.lock().unwrap().on_tick();
			let snapshot = stats.snapshot();
			tracing::debug!(
				"Streaming at {:.2} Mbps, {} frames encoded, {} frames dropped, {} FEC failures.",
				snapshot.window_bitrate_bps as f64 / 1e6,
				snapshot.frames_encoded,
				snapshot.frames_dropped,
				snapshot.fec_failures,
			);

			let retention = POSE_RETENTION.as_nanos() as u64;
			pose_history.evict_stale(retention);
		}
	}

	tracing::debug!("Cadence stopped.");
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn idr_requests_coalesce() {
		let scheduler = IdrScheduler::new(1000.0);
		scheduler.request();
		scheduler.request();
		scheduler.request();
		assert!(scheduler.take_due());
		assert!(!scheduler.take_due());
	}

	#[test]
	fn idr_spacing_is_enforced() {
		let scheduler = IdrScheduler::new(10.0);
		scheduler.note_idr_sent();
		scheduler.request();
		// 200 ms minimum spacing at 10 Hz; an immediate poll stays quiet
		// but the request remains pending.
		assert!(!scheduler.take_due());
		std::thread::sleep(Duration::from_millis(210));
		assert!(scheduler.take_due());
	}

	#[test]
	fn bitrate_tracks_the_smoothed_minimum() {
		let config = BitrateConfig { initial_bps: 30_000_000, min_bps: 5_000_000, max_bps: 100_000_000 };
		let mut controller = BitrateController::new(&config);

		// Link weaker than requested: converge downward.
		for _ in 0..30 {
			controller.on_client_report(10_000_000);
		}
		let target = controller.sample().unwrap();
		assert!(target < 12_000_000, "target {target} should approach the link estimate");

		// Link recovers beyond the request: capped by requested bitrate.
		for _ in 0..60 {
			controller.on_client_report(80_000_000);
		}
		assert_eq!(controller.sample(), Some(30_000_000));
	}

	#[test]
	fn bitrate_respects_bounds_and_deadband() {
		let config = BitrateConfig { initial_bps: 30_000_000, min_bps: 20_000_000, max_bps: 100_000_000 };
		let mut controller = BitrateController::new(&config);

		for _ in 0..60 {
			controller.on_client_report(1_000_000);
		}
		assert_eq!(controller.sample(), Some(20_000_000));

		// Unchanged conditions produce no further updates.
		assert_eq!(controller.sample(), None);
	}

	#[test]
	fn requested_change_propagates() {
		let config = BitrateConfig { initial_bps: 30_000_000, min_bps: 5_000_000, max_bps: 100_000_000 };
		let mut controller = BitrateController::new(&config);
		controller.set_requested(60_000_000);
		assert_eq!(controller.sample(), Some(60_000_000));
	}

	#[test]
	fn fec_failure_burst_raises_percentage() {
		let config = FecConfig { initial_percentage: 5, max_percentage: 10 };
		let mut controller = FecController::new(&config);

		assert!(!controller.on_fec_failure());
		assert!(!controller.on_fec_failure());
		assert!(controller.on_fec_failure());
		assert_eq!(controller.percentage(), 10);

		// Already at max: another failure does not re-trigger.
		assert!(!controller.on_fec_failure());
	}

	#[test]
	fn fec_percentage_stays_until_quiet() {
		let config = FecConfig { initial_percentage: 5, max_percentage: 10 };
		let mut controller = FecController::new(&config);
		for _ in 0..3 {
			controller.on_fec_failure();
		}
		assert_eq!(controller.percentage(), 10);

		// Failures are recent, the tick must not decay yet.
		controller.on_tick();
		assert_eq!(controller.percentage(), 10);
	}
}
