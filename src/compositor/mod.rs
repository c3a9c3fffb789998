use std::sync::{Arc, Mutex};
use std::time::Duration;

use glam::Mat3;
use tokio::sync::{mpsc, Notify};

use crate::config::VideoConfig;
use crate::stats::SessionStats;
use crate::tracking::{PoseHistory, PoseRecord};

pub use self::foveation::FoveationMap;
pub use self::swapchain::{next_swap_index, KeyedMutex, SharedTexture, SwapchainTable, TextureDesc};

pub mod convert;
pub mod foveation;
pub mod swapchain;

/// Layer pairs accepted per frame; anything beyond is dropped.
pub const MAX_LAYERS: usize = 10;

/// Ceiling on any GPU-side mutex wait. A frame is worth less than a stall.
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug)]
pub struct UvBounds {
	pub u_min: f32,
	pub v_min: f32,
	pub u_max: f32,
	pub v_max: f32,
}

impl Default for UvBounds {
	fn default() -> Self {
		Self { u_min: 0.0, v_min: 0.0, u_max: 1.0, v_max: 1.0 }
	}
}

#[derive(Clone, Copy, Debug)]
pub struct LayerView {
	pub texture_id: u64,
	pub bounds: UvBounds,
}

/// One composed stereo frame on its way to the encoder: side-by-side RGBA
/// at the encoded extent.
pub struct ComposedFrame {
	pub data: Vec<u8>,
	pub width: u32,
	pub height: u32,
	pub target_timestamp_ns: u64,
	pub tracking_frame_index: u64,
}

/// Handoff point between the submit thread and the encoder thread. The
/// session connects a channel while streaming; frames composed with no
/// consumer are dropped on the floor.
#[derive(Clone, Default)]
pub struct FrameSink {
	sender: Arc<Mutex<Option<mpsc::Sender<ComposedFrame>>>>,
}

impl FrameSink {
	pub fn new() -> Self {
		Default::default()
	}

	pub fn connect(&self, sender: mpsc::Sender<ComposedFrame>) {
		*self.sender.lock().unwrap() = Some(sender);
	}

	pub fn disconnect(&self) {
		*self.sender.lock().unwrap() = None;
	}

	/// Non-blocking push. Returns false when the frame was dropped,
	/// either because nothing consumes frames or the consumer is behind.
	pub fn push(&self, frame: ComposedFrame) -> bool {
		let sender = self.sender.lock().unwrap();
		match sender.as_ref() {
			Some(sender) => match sender.try_send(frame) {
				Ok(()) => true,
				Err(mpsc::error::TrySendError::Full(_)) => {
					tracing::trace!("Encoder is behind, dropping composed frame.");
					false
				},
				Err(mpsc::error::TrySendError::Closed(_)) => false,
			},
			None => false,
		}
	}
}

/// The per-eye extent the encoder sees: the target render extent, or the
/// foveated extent when foveation is configured. Both are also what the
/// composed side-by-side frame uses per eye.
pub fn encoded_extent(video: &VideoConfig) -> (u32, u32) {
	match &video.foveation {
		Some(foveation) => (
			foveation::output_extent(foveation.center_size_x, foveation.edge_ratio_x, video.width),
			foveation::output_extent(foveation.center_size_y, foveation.edge_ratio_y, video.height),
		),
		None => (video.width, video.height),
	}
}

/// Draws the host's layered stereo submission into one side-by-side
/// texture at the encoder's extent.
///
/// Owned by the submit thread; every entry point here is called from the
/// host runtime's layer callbacks and must never block past
/// [`ACQUIRE_TIMEOUT`].
pub struct FrameComposer {
	swapchains: Arc<SwapchainTable>,
	pose_history: Arc<PoseHistory>,
	sink: FrameSink,
	stats: Arc<SessionStats>,
	vsync: Arc<Notify>,

	eye_width: u32,
	eye_height: u32,
	foveation: Option<FoveationMap>,

	layers: Vec<[LayerView; 2]>,
	frame_pose: Option<PoseRecord>,
	previous_timestamp_ns: u64,
}

impl FrameComposer {
	pub fn new(
		video: &VideoConfig,
		swapchains: Arc<SwapchainTable>,
		pose_history: Arc<PoseHistory>,
		sink: FrameSink,
		stats: Arc<SessionStats>,
		vsync: Arc<Notify>,
	) -> Self {
		let foveation = video
			.foveation
			.as_ref()
			.map(|config| FoveationMap::new(config, video.width, video.height));

		Self {
			swapchains,
			pose_history,
			sink,
			stats,
			vsync,
			eye_width: video.width,
			eye_height: video.height,
			foveation,
			layers: Vec::with_capacity(MAX_LAYERS),
			frame_pose: None,
			previous_timestamp_ns: 0,
		}
	}

	pub fn create_swap_texture_set(&self, owner_pid: u32, desc: TextureDesc) -> [u64; 3] {
		self.swapchains.create_swap_texture_set(owner_pid, desc)
	}

	pub fn destroy_swap_texture_set(&self, handle: u64) {
		self.swapchains.destroy_swap_texture_set(handle);
	}

	pub fn destroy_all_for(&self, owner_pid: u32) {
		self.swapchains.destroy_all_for(owner_pid);
	}

	pub fn get_next_swap_index(&self, current: [u32; 2]) -> [u32; 2] {
		next_swap_index(current)
	}

	/// Accumulates one layer pair for the current frame. The first layer's
	/// pose identifies which tracking frame this submission renders.
	pub fn submit_layer(&mut self, per_eye: [LayerView; 2], pose: &Mat3) {
		if self.layers.is_empty() {
			self.frame_pose = self.pose_history.best_match(pose);
			if self.frame_pose.is_none() {
				tracing::trace!("No pose history yet, frame will carry an unknown pose.");
			}
		}

		if self.layers.len() >= MAX_LAYERS {
			tracing::warn!("Too many layers submitted, dropping layer beyond {MAX_LAYERS}.");
			return;
		}
		self.layers.push(per_eye);
	}

	/// Composites the accumulated layers, copies the result into the
	/// staging texture and queues the frame for encoding. Always leaves
	/// the composer ready for the next frame.
	pub fn present(&mut self, sync_texture_handle: u64) -> Result<(), ()> {
		let layers = std::mem::take(&mut self.layers);
		let frame_pose = self.frame_pose.take();

		if layers.is_empty() {
			tracing::trace!("Present without layers, nothing to compose.");
			return Ok(());
		}

		let (target_timestamp_ns, tracking_frame_index) = match frame_pose {
			Some(pose) => (pose.target_timestamp_ns, pose.frame_id),
			// Stale match on startup: downstream treats 0 as unknown.
			None => (0, 0),
		};

		if target_timestamp_ns != 0 && target_timestamp_ns == self.previous_timestamp_ns {
			tracing::trace!("Duplicate frame for timestamp {target_timestamp_ns}, skipping.");
			return Ok(());
		}

		let Some(sync_texture) = self.swapchains.get(sync_texture_handle) else {
			tracing::warn!("Present with unknown sync texture handle {sync_texture_handle}, dropping frame.");
			self.stats.record_frame_dropped();
			return Err(());
		};
		let Some(mut staging) = sync_texture.acquire(ACQUIRE_TIMEOUT) else {
			tracing::warn!("Timed out acquiring sync texture {sync_texture_handle}, dropping frame.");
			self.stats.record_frame_dropped();
			return Err(());
		};

		let frame = self.compose(&layers, target_timestamp_ns, tracking_frame_index);

		// Staging copy, so the host can read back the composited output.
		staging.clear();
		staging.extend_from_slice(&frame.data);
		drop(staging);

		self.previous_timestamp_ns = target_timestamp_ns;
		self.sink.push(frame);

		Ok(())
	}

	/// Signals the vsync pulse for pacing after the present completed.
	pub fn post_present(&self) {
		self.vsync.notify_waiters();
	}

	fn compose(&self, layers: &[[LayerView; 2]], target_timestamp_ns: u64, tracking_frame_index: u64) -> ComposedFrame {
		let eye_width = self.eye_width as usize;
		let eye_height = self.eye_height as usize;
		let mut eyes = [
			vec![0u8; eye_width * eye_height * 4],
			vec![0u8; eye_width * eye_height * 4],
		];

		for (layer_index, layer) in layers.iter().enumerate() {
			for (eye, buffer) in eyes.iter_mut().enumerate() {
				let view = &layer[eye];
				let Some(texture) = self.swapchains.get(view.texture_id) else {
					tracing::warn!("Layer references unknown texture {}, dropping layer.", view.texture_id);
					continue;
				};
				let Some(pixels) = texture.acquire(ACQUIRE_TIMEOUT) else {
					tracing::warn!("Timed out acquiring layer texture {}, dropping layer.", view.texture_id);
					continue;
				};

				blend_layer(
					buffer,
					eye_width,
					eye_height,
					&pixels,
					texture.desc,
					view.bounds,
					layer_index == 0,
				);
			}
		}

		let (frame_eye_width, frame_eye_height, eyes) = match &self.foveation {
			Some(map) => {
				let mut remapped = [Vec::new(), Vec::new()];
				for (eye, buffer) in eyes.iter().enumerate() {
					map.remap(buffer, &mut remapped[eye]);
				}
				(map.output_width() as usize, map.output_height() as usize, remapped)
			},
			None => (eye_width, eye_height, eyes),
		};

		// Side-by-side assembly: left eye in the left half.
		let width = frame_eye_width * 2;
		let mut data = vec![0u8; width * frame_eye_height * 4];
		for y in 0..frame_eye_height {
			for (eye, buffer) in eyes.iter().enumerate() {
				let src = &buffer[y * frame_eye_width * 4..(y + 1) * frame_eye_width * 4];
				let dst = (y * width + eye * frame_eye_width) * 4;
				data[dst..dst + frame_eye_width * 4].copy_from_slice(src);
			}
		}

		ComposedFrame {
			data,
			width: width as u32,
			height: frame_eye_height as u32,
			target_timestamp_ns,
			tracking_frame_index,
		}
	}
}

/// Samples the bounded region of a layer texture into the eye buffer.
/// The first layer lands with full opacity regardless of its alpha (some
/// hosts zero the alpha of their primary layer); later layers blend
/// source-alpha over the accumulated image.
fn blend_layer(
	eye: &mut [u8],
	eye_width: usize,
	eye_height: usize,
	texture: &[u8],
	desc: TextureDesc,
	bounds: UvBounds,
	first_layer: bool,
) {
	let texture_width = desc.width as usize;
	let texture_height = desc.height as usize;

	for out_y in 0..eye_height {
		let v = bounds.v_min + (out_y as f32 + 0.5) / eye_height as f32 * (bounds.v_max - bounds.v_min);
		let src_y = ((v * texture_height as f32) as usize).min(texture_height.saturating_sub(1));

		for out_x in 0..eye_width {
			let u = bounds.u_min + (out_x as f32 + 0.5) / eye_width as f32 * (bounds.u_max - bounds.u_min);
			let src_x = ((u * texture_width as f32) as usize).min(texture_width.saturating_sub(1));

			let src = &texture[(src_y * texture_width + src_x) * 4..(src_y * texture_width + src_x) * 4 + 4];
			let dst_index = (out_y * eye_width + out_x) * 4;
			let dst = &mut eye[dst_index..dst_index + 4];

			if first_layer {
				dst[..3].copy_from_slice(&src[..3]);
				dst[3] = 255;
			} else {
				let alpha = src[3] as f32 / 255.0;
				for channel in 0..3 {
					let blended = src[channel] as f32 * alpha + dst[channel] as f32 * (1.0 - alpha);
					dst[channel] = blended.round().clamp(0.0, 255.0) as u8;
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use glam::Quat;

	use crate::config::Config;
	use crate::tracking::DeviceMotion;

	use super::*;

	fn test_composer(width: u32, height: u32) -> (FrameComposer, mpsc::Receiver<ComposedFrame>, Arc<SwapchainTable>, Arc<PoseHistory>) {
		let mut config = Config::default();
		config.video.width = width;
		config.video.height = height;

		let swapchains = Arc::new(SwapchainTable::new());
		let pose_history = Arc::new(PoseHistory::new(16));
		let sink = FrameSink::new();
		let (frame_tx, frame_rx) = mpsc::channel(3);
		sink.connect(frame_tx);

		let composer = FrameComposer::new(
			&config.video,
			swapchains.clone(),
			pose_history.clone(),
			sink,
			Arc::new(SessionStats::new()),
			Arc::new(Notify::new()),
		);

		(composer, frame_rx, swapchains, pose_history)
	}

	fn fill_texture(table: &SwapchainTable, handle: u64, rgba: [u8; 4]) {
		let texture = table.get(handle).unwrap();
		let mut pixels = texture.acquire(ACQUIRE_TIMEOUT).unwrap();
		for pixel in pixels.chunks_exact_mut(4) {
			pixel.copy_from_slice(&rgba);
		}
	}

	fn layer(handle: u64) -> [LayerView; 2] {
		[
			LayerView { texture_id: handle, bounds: Default::default() },
			LayerView { texture_id: handle, bounds: Default::default() },
		]
	}

	#[test]
	fn composed_frame_is_side_by_side() {
		let (mut composer, mut frame_rx, swapchains, pose_history) = test_composer(64, 32);

		let motion = DeviceMotion {
			position: glam::Vec3::ZERO,
			orientation: Quat::from_rotation_y(0.4),
			linear_velocity: None,
			angular_velocity: None,
		};
		let frame_id = pose_history.record(motion, 1_000_000);

		let handles = swapchains.create_swap_texture_set(1, TextureDesc { width: 64, height: 32, format: 28, sample_count: 1 });
		fill_texture(&swapchains, handles[0], [200, 10, 10, 255]);
		let sync = swapchains.create_swap_texture_set(1, TextureDesc { width: 128, height: 32, format: 28, sample_count: 1 });

		composer.submit_layer(layer(handles[0]), &Mat3::from_quat(motion.orientation));
		composer.present(sync[0]).unwrap();

		let frame = frame_rx.try_recv().unwrap();
		assert_eq!(frame.width, 128);
		assert_eq!(frame.height, 32);
		assert_eq!(frame.tracking_frame_index, frame_id);
		assert_eq!(frame.target_timestamp_ns, 1_000_000);
		// Both eye halves carry the layer color at full opacity.
		assert_eq!(&frame.data[0..4], &[200, 10, 10, 255]);
		let right_eye = (64usize) * 4;
		assert_eq!(&frame.data[right_eye..right_eye + 4], &[200, 10, 10, 255]);
	}

	#[test]
	fn second_layer_blends_with_source_alpha() {
		let (mut composer, mut frame_rx, swapchains, pose_history) = test_composer(8, 8);
		pose_history.record(
			DeviceMotion {
				position: glam::Vec3::ZERO,
				orientation: Quat::IDENTITY,
				linear_velocity: None,
				angular_velocity: None,
			},
			500,
		);

		let base = swapchains.create_swap_texture_set(1, TextureDesc { width: 8, height: 8, format: 28, sample_count: 1 });
		let overlay = swapchains.create_swap_texture_set(1, TextureDesc { width: 8, height: 8, format: 28, sample_count: 1 });
		let sync = swapchains.create_swap_texture_set(1, TextureDesc { width: 16, height: 8, format: 28, sample_count: 1 });
		// Base layer with zeroed alpha still lands opaque.
		fill_texture(&swapchains, base[0], [100, 100, 100, 0]);
		// Half-transparent white overlay.
		fill_texture(&swapchains, overlay[0], [255, 255, 255, 128]);

		composer.submit_layer(layer(base[0]), &Mat3::IDENTITY);
		composer.submit_layer(layer(overlay[0]), &Mat3::IDENTITY);
		composer.present(sync[0]).unwrap();

		let frame = frame_rx.try_recv().unwrap();
		// 255 * 0.502 + 100 * 0.498 = 178.
		assert_eq!(frame.data[0], 178);
		assert_eq!(frame.data[3], 255);
	}

	#[test]
	fn unknown_layer_texture_drops_only_that_layer() {
		let (mut composer, mut frame_rx, swapchains, pose_history) = test_composer(8, 8);
		pose_history.record(
			DeviceMotion {
				position: glam::Vec3::ZERO,
				orientation: Quat::IDENTITY,
				linear_velocity: None,
				angular_velocity: None,
			},
			500,
		);

		let base = swapchains.create_swap_texture_set(1, TextureDesc { width: 8, height: 8, format: 28, sample_count: 1 });
		let sync = swapchains.create_swap_texture_set(1, TextureDesc { width: 16, height: 8, format: 28, sample_count: 1 });
		fill_texture(&swapchains, base[0], [50, 60, 70, 255]);

		composer.submit_layer(layer(base[0]), &Mat3::IDENTITY);
		composer.submit_layer(layer(9999), &Mat3::IDENTITY);
		composer.present(sync[0]).unwrap();

		let frame = frame_rx.try_recv().unwrap();
		assert_eq!(&frame.data[0..3], &[50, 60, 70]);
	}

	#[test]
	fn duplicate_timestamp_is_skipped() {
		let (mut composer, mut frame_rx, swapchains, pose_history) = test_composer(8, 8);
		let motion = DeviceMotion {
			position: glam::Vec3::ZERO,
			orientation: Quat::IDENTITY,
			linear_velocity: None,
			angular_velocity: None,
		};
		pose_history.record(motion, 700);

		let base = swapchains.create_swap_texture_set(1, TextureDesc { width: 8, height: 8, format: 28, sample_count: 1 });
		let sync = swapchains.create_swap_texture_set(1, TextureDesc { width: 16, height: 8, format: 28, sample_count: 1 });

		composer.submit_layer(layer(base[0]), &Mat3::IDENTITY);
		composer.present(sync[0]).unwrap();
		assert!(frame_rx.try_recv().is_ok());

		// Same pose matched again: same target timestamp, frame skipped.
		composer.submit_layer(layer(base[0]), &Mat3::IDENTITY);
		composer.present(sync[0]).unwrap();
		assert!(frame_rx.try_recv().is_err());
	}

	#[test]
	fn missing_sync_texture_drops_the_frame() {
		let (mut composer, mut frame_rx, swapchains, _pose_history) = test_composer(8, 8);
		let base = swapchains.create_swap_texture_set(1, TextureDesc { width: 8, height: 8, format: 28, sample_count: 1 });

		composer.submit_layer(layer(base[0]), &Mat3::IDENTITY);
		assert!(composer.present(4242).is_err());
		assert!(frame_rx.try_recv().is_err());

		// State was cleared: the next present has no leftover layers.
		let sync = swapchains.create_swap_texture_set(1, TextureDesc { width: 16, height: 8, format: 28, sample_count: 1 });
		composer.present(sync[0]).unwrap();
		assert!(frame_rx.try_recv().is_err());
	}

	#[test]
	fn excess_layers_are_dropped_with_a_warning() {
		let (mut composer, _frame_rx, swapchains, _pose_history) = test_composer(8, 8);
		let base = swapchains.create_swap_texture_set(1, TextureDesc { width: 8, height: 8, format: 28, sample_count: 1 });

		for _ in 0..MAX_LAYERS + 3 {
			composer.submit_layer(layer(base[0]), &Mat3::IDENTITY);
		}
		assert_eq!(composer.layers.len(), MAX_LAYERS);
	}

	#[test]
	fn encoded_extent_matches_foveation_math() {
		let mut config = Config::default();
		config.video.width = 1920;
		config.video.height = 1088;
		assert_eq!(encoded_extent(&config.video), (1920, 1088));

		config.video.foveation = Some(crate::config::FoveationConfig {
			center_size_x: 0.5,
			center_size_y: 0.5,
			edge_ratio_x: 2.0,
			edge_ratio_y: 2.0,
		});
		assert_eq!(encoded_extent(&config.video), (1440, 832));
	}
}
