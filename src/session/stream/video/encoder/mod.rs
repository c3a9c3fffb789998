use std::collections::VecDeque;

use crate::compositor::{convert, ComposedFrame};
use crate::config::{CodecName, ColorRange, RateControl, VideoConfig};
use crate::error::Error;

use super::nal;

pub use self::av1::Av1Backend;
pub use self::h264::H264Backend;
pub use self::hevc::HevcBackend;

pub mod av1;
pub mod h264;
pub mod hevc;

/// Frames buffered ahead of the engine. Latency beats completeness here;
/// when the engine falls behind, the oldest queued frame goes first.
const MAX_QUEUED_FRAMES: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodecKind {
	H264,
	Hevc,
	Av1,
}

impl From<CodecName> for CodecKind {
	fn from(name: CodecName) -> Self {
		match name {
			CodecName::H264 => Self::H264,
			CodecName::Hevc => Self::Hevc,
			CodecName::Av1 => Self::Av1,
		}
	}
}

impl std::fmt::Display for CodecKind {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::H264 => write!(f, "H.264"),
			Self::Hevc => write!(f, "HEVC"),
			Self::Av1 => write!(f, "AV1"),
		}
	}
}

/// Static encoder parameters, fixed at initialize time. Bitrate and
/// framerate may later move through [`DynamicParams`].
#[derive(Clone, Copy, Debug)]
pub struct EncoderSettings {
	pub width: u32,
	pub height: u32,
	pub refresh_rate: f32,
	pub bitrate_bps: u64,
	pub rate_control: RateControl,
	pub color_range: ColorRange,
}

impl EncoderSettings {
	pub fn from_config(video: &VideoConfig, width: u32, height: u32, refresh_rate: f32) -> Self {
		Self {
			width,
			height,
			refresh_rate,
			bitrate_bps: video.bitrate.initial_bps,
			rate_control: video.rate_control,
			color_range: video.color_range,
		}
	}
}

/// Bitrate/framerate update applied at the next frame boundary.
#[derive(Clone, Copy, Debug, Default)]
pub struct DynamicParams {
	pub updated: bool,
	pub bitrate_bps: u64,
	pub framerate: f32,
}

/// One encoded frame with its metadata, ready for packetization.
#[derive(Clone, Debug)]
pub struct FramePacket {
	pub data: Vec<u8>,
	pub pts_ns: u64,
	pub tracking_frame_index: u64,
	pub is_idr: bool,
}

#[derive(Debug)]
pub enum BackendError {
	/// This build carries no engine for the codec; the caller moves on to
	/// the next backend in preference order.
	Unsupported(CodecKind),
	Init(String),
	Encode(String),
}

impl std::fmt::Display for BackendError {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Self::Unsupported(codec) => write!(f, "no {codec} engine available"),
			Self::Init(message) => write!(f, "failed to initialize encoder: {message}"),
			Self::Encode(message) => write!(f, "failed to encode frame: {message}"),
		}
	}
}

/// Raw planar frame handed to a backend.
#[derive(Debug)]
pub struct I420Frame {
	pub width: u32,
	pub height: u32,
	pub data: Vec<u8>,
}

/// The contract every codec backend implements. Backends are configured
/// for ultra low latency: no B-frames, no reordering, zero lookahead,
/// infinite GOP, keyframes only on request.
pub trait EncoderBackend {
	/// Encodes one frame, returning the raw (unfiltered) bitstream.
	fn encode(&mut self, frame: &I420Frame, force_idr: bool) -> Result<Vec<u8>, BackendError>;

	/// Retunes bitrate and framerate in place. Returns false when the
	/// engine cannot retune live and needs a teardown and rebuild.
	fn update_params(&mut self, bitrate_bps: u64, framerate: f32) -> bool;

	fn codec(&self) -> CodecKind;
}

/// Backend dispatch, resolved once at initialization.
#[derive(Debug)]
pub enum Codec {
	H264(H264Backend),
	Hevc(HevcBackend),
	Av1(Av1Backend),
}

impl Codec {
	fn open(kind: CodecKind, settings: &EncoderSettings) -> Result<Self, BackendError> {
		match kind {
			CodecKind::H264 => H264Backend::new(settings).map(Self::H264),
			CodecKind::Hevc => HevcBackend::new(settings).map(Self::Hevc),
			CodecKind::Av1 => Av1Backend::new(settings).map(Self::Av1),
		}
	}

	fn backend(&mut self) -> &mut dyn EncoderBackend {
		match self {
			Self::H264(backend) => backend,
			Self::Hevc(backend) => backend,
			Self::Av1(backend) => backend,
		}
	}

	fn kind(&self) -> CodecKind {
		match self {
			Self::H264(_) => CodecKind::H264,
			Self::Hevc(_) => CodecKind::Hevc,
			Self::Av1(_) => CodecKind::Av1,
		}
	}
}

/// Probes which backends initialize on this machine, so the handshake
/// never negotiates a codec no engine can produce.
pub fn probe_available(settings: EncoderSettings) -> Vec<CodecKind> {
	[CodecKind::H264, CodecKind::Hevc, CodecKind::Av1]
		.into_iter()
		.filter(|&kind| Codec::open(kind, &settings).is_ok())
		.collect()
}

#[derive(Debug)]
struct QueuedFrame {
	frame: I420Frame,
	target_timestamp_ns: u64,
	tracking_frame_index: u64,
	insert_idr: bool,
}

/// Codec-agnostic encoder front: a bounded input queue, dynamic parameter
/// application at frame boundaries, bitstream filtering, and IDR
/// bookkeeping shared by all backends.
#[derive(Debug)]
pub struct VideoEncoder {
	codec: Codec,
	settings: EncoderSettings,
	pending_params: Option<DynamicParams>,
	force_idr: bool,
	queue: VecDeque<QueuedFrame>,
	dropped_frames: u64,
}

impl VideoEncoder {
	/// Opens the first backend in `preference` that initializes. Only when
	/// every backend refuses does encoder setup count as fatal.
	pub fn initialize(preference: &[CodecKind], settings: EncoderSettings) -> Result<Self, Error> {
		for &kind in preference {
			match Codec::open(kind, &settings) {
				Ok(codec) => {
					tracing::info!("Using {kind} encoder at {}x{}.", settings.width, settings.height);
					return Ok(Self {
						codec,
						settings,
						pending_params: None,
						// The first frame of a stream is always an IDR.
						force_idr: true,
						queue: VecDeque::with_capacity(MAX_QUEUED_FRAMES),
						dropped_frames: 0,
					});
				},
				Err(error) => {
					tracing::info!("Encoder backend {kind} unavailable: {error}");
				},
			}
		}

		Err(Error::EncoderInit { tried: preference.to_vec() })
	}

	pub fn codec_id(&self) -> CodecKind {
		self.codec.kind()
	}

	pub fn dropped_frames(&self) -> u64 {
		self.dropped_frames
	}

	/// Queues a composed frame for encoding and returns immediately. The
	/// color-space conversion happens here so the backend only ever sees
	/// planar input.
	pub fn push_frame(&mut self, frame: &ComposedFrame, insert_idr: bool) {
		if frame.width != self.settings.width || frame.height != self.settings.height {
			tracing::warn!(
				"Dropping frame with extent {}x{}, encoder expects {}x{}.",
				frame.width, frame.height, self.settings.width, self.settings.height,
			);
			self.dropped_frames += 1;
			return;
		}

		if self.queue.len() >= MAX_QUEUED_FRAMES {
			tracing::trace!("Encoder queue full, dropping oldest frame.");
			self.queue.pop_front();
			self.dropped_frames += 1;
		}

		self.queue.push_back(QueuedFrame {
			frame: I420Frame {
				width: frame.width,
				height: frame.height,
				data: convert::rgba_to_i420(
					&frame.data,
					frame.width as usize,
					frame.height as usize,
					self.settings.color_range,
				),
			},
			target_timestamp_ns: frame.target_timestamp_ns,
			tracking_frame_index: frame.tracking_frame_index,
			insert_idr,
		});
	}

	/// Non-blocking: encodes the next queued frame if any, `None` when the
	/// backend has nothing to produce. `Err` is the persistent-failure
	/// case that stops streaming.
	pub fn pull_encoded(&mut self) -> Result<Option<FramePacket>, ()> {
		let Some(queued) = self.queue.pop_front() else {
			return Ok(None);
		};

		// Dynamic parameters land exactly here, between frames.
		if let Some(params) = self.pending_params.take() {
			self.apply_params(params)?;
		}

		let force_idr = queued.insert_idr || self.force_idr;
		let raw = match self.codec.backend().encode(&queued.frame, force_idr) {
			Ok(raw) => raw,
			Err(error) => {
				tracing::warn!("Encoder error, rebuilding backend: {error}");
				self.rebuild()?;
				// One retry after a rebuild; a second failure is persistent.
				self.codec.backend().encode(&queued.frame, true).map_err(|error| {
					tracing::error!("Encoder failed after rebuild: {error}");
				})?
			},
		};
		self.force_idr = false;

		let codec = self.codec.kind();
		let mut data = nal::filter_frame(codec, &raw);
		let is_idr = nal::is_idr_frame(codec, &data);
		if matches!(self.settings.rate_control, RateControl::Cbr) {
			pad_to_cbr_budget(codec, &mut data, &self.settings);
		}

		Ok(Some(FramePacket {
			data,
			pts_ns: queued.target_timestamp_ns,
			tracking_frame_index: queued.tracking_frame_index,
			is_idr,
		}))
	}

	/// Stages a parameter change; it takes effect at the next frame
	/// boundary and never mid-frame.
	pub fn set_params(&mut self, params: DynamicParams) {
		if params.updated {
			self.pending_params = Some(params);
		}
	}

	fn apply_params(&mut self, params: DynamicParams) -> Result<(), ()> {
		tracing::debug!(
			"Applying dynamic parameters: {} bps at {} Hz.",
			params.bitrate_bps, params.framerate,
		);
		self.settings.bitrate_bps = params.bitrate_bps;
		self.settings.refresh_rate = params.framerate;

		if !self.codec.backend().update_params(params.bitrate_bps, params.framerate) {
			self.rebuild()?;
		}

		Ok(())
	}

	fn rebuild(&mut self) -> Result<(), ()> {
		self.codec = Codec::open(self.codec.kind(), &self.settings)
			.map_err(|error| tracing::error!("Failed to rebuild encoder: {error}"))?;
		self.force_idr = true;
		Ok(())
	}
}

/// Constant-bitrate filler: pads a small frame toward the per-frame byte
/// budget with a filler unit the wire format tolerates (H.264 type 12,
/// HEVC type 38). AV1 padding OBUs are stripped by the filter, so AV1
/// rate control stays inside the engine.
fn pad_to_cbr_budget(codec: CodecKind, data: &mut Vec<u8>, settings: &EncoderSettings) {
	let budget = (settings.bitrate_bps as f32 / 8.0 / settings.refresh_rate.max(1.0)) as usize;
	if data.len() + 16 >= budget {
		return;
	}

	let filler_size = budget - data.len();
	match codec {
		CodecKind::H264 => {
			data.extend_from_slice(&[0, 0, 0, 1, 12]);
			data.extend(std::iter::repeat(0xff).take(filler_size.saturating_sub(5)));
		},
		CodecKind::Hevc => {
			data.extend_from_slice(&[0, 0, 0, 1, 38 << 1, 1]);
			data.extend(std::iter::repeat(0xff).take(filler_size.saturating_sub(6)));
		},
		CodecKind::Av1 => {},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn settings(width: u32, height: u32) -> EncoderSettings {
		EncoderSettings {
			width,
			height,
			refresh_rate: 72.0,
			bitrate_bps: 5_000_000,
			rate_control: RateControl::ConstrainedVbr,
			color_range: ColorRange::Full,
		}
	}

	fn composed(width: u32, height: u32, timestamp: u64) -> ComposedFrame {
		ComposedFrame {
			data: vec![128u8; width as usize * height as usize * 4],
			width,
			height,
			target_timestamp_ns: timestamp,
			tracking_frame_index: 7,
		}
	}

	#[test]
	fn fallback_lands_on_a_working_backend() {
		let encoder = VideoEncoder::initialize(
			&[CodecKind::Hevc, CodecKind::Av1, CodecKind::H264],
			settings(64, 64),
		)
		.unwrap();
		assert_eq!(encoder.codec_id(), CodecKind::H264);
	}

	#[test]
	fn no_usable_backend_is_fatal() {
		let error = VideoEncoder::initialize(&[CodecKind::Hevc, CodecKind::Av1], settings(64, 64)).unwrap_err();
		assert!(matches!(error, Error::EncoderInit { tried } if tried.len() == 2));
	}

	#[test]
	fn first_frame_is_idr_with_headers() {
		let mut encoder = VideoEncoder::initialize(&[CodecKind::H264], settings(64, 64)).unwrap();
		encoder.push_frame(&composed(64, 64, 1_000), false);

		let packet = encoder.pull_encoded().unwrap().unwrap();
		assert!(packet.is_idr);
		assert!(nal::has_codec_headers(CodecKind::H264, &packet.data));
		assert_eq!(packet.pts_ns, 1_000);
		assert_eq!(packet.tracking_frame_index, 7);
	}

	#[test]
	fn idr_on_request() {
		let mut encoder = VideoEncoder::initialize(&[CodecKind::H264], settings(64, 64)).unwrap();
		encoder.push_frame(&composed(64, 64, 1_000), false);
		assert!(encoder.pull_encoded().unwrap().unwrap().is_idr);

		encoder.push_frame(&composed(64, 64, 2_000), false);
		assert!(!encoder.pull_encoded().unwrap().unwrap().is_idr);

		encoder.push_frame(&composed(64, 64, 3_000), true);
		assert!(encoder.pull_encoded().unwrap().unwrap().is_idr);
	}

	#[test]
	fn pull_without_input_is_none() {
		let mut encoder = VideoEncoder::initialize(&[CodecKind::H264], settings(64, 64)).unwrap();
		assert!(encoder.pull_encoded().unwrap().is_none());
	}

	#[test]
	fn bitrate_change_applies_at_frame_boundary_and_forces_idr() {
		let mut encoder = VideoEncoder::initialize(&[CodecKind::H264], settings(64, 64)).unwrap();
		encoder.push_frame(&composed(64, 64, 1_000), false);
		encoder.pull_encoded().unwrap().unwrap();

		encoder.set_params(DynamicParams { updated: true, bitrate_bps: 10_000_000, framerate: 72.0 });
		encoder.push_frame(&composed(64, 64, 2_000), false);
		let packet = encoder.pull_encoded().unwrap().unwrap();
		// The engine rebuild behind the parameter change forces an IDR.
		assert!(packet.is_idr);
		assert_eq!(encoder.settings.bitrate_bps, 10_000_000);
	}

	#[test]
	fn not_updated_params_are_ignored() {
		let mut encoder = VideoEncoder::initialize(&[CodecKind::H264], settings(64, 64)).unwrap();
		encoder.set_params(DynamicParams { updated: false, bitrate_bps: 1, framerate: 1.0 });
		assert!(encoder.pending_params.is_none());
	}

	#[test]
	fn mismatched_extent_is_dropped() {
		let mut encoder = VideoEncoder::initialize(&[CodecKind::H264], settings(64, 64)).unwrap();
		encoder.push_frame(&composed(128, 64, 1_000), false);
		assert_eq!(encoder.dropped_frames(), 1);
		assert!(encoder.pull_encoded().unwrap().is_none());
	}

	#[test]
	fn queue_overflow_drops_the_oldest() {
		let mut encoder = VideoEncoder::initialize(&[CodecKind::H264], settings(64, 64)).unwrap();
		for timestamp in [1_000, 2_000, 3_000] {
			encoder.push_frame(&composed(64, 64, timestamp), false);
		}
		assert_eq!(encoder.dropped_frames(), 1);
		assert_eq!(encoder.pull_encoded().unwrap().unwrap().pts_ns, 2_000);
	}

	#[test]
	fn cbr_pads_toward_the_frame_budget() {
		let mut settings = settings(64, 64);
		settings.rate_control = RateControl::Cbr;
		settings.bitrate_bps = 1_000_000;

		let mut data = vec![0, 0, 0, 1, 5, 1, 2, 3];
		pad_to_cbr_budget(CodecKind::H264, &mut data, &settings);
		// 1 Mbps at 72 Hz is ~1736 bytes per frame.
		let budget = (1_000_000f32 / 8.0 / 72.0) as usize;
		assert_eq!(data.len(), budget);
	}
}
