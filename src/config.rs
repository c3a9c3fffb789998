use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Top-level configuration blob.
///
/// The host hands this to the core as a single JSON document. Unknown fields
/// are ignored so newer hosts can feed older cores; missing required fields
/// fail initialization with an error naming the field.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	/// Name of the host, reported to clients during the handshake.
	#[serde(default = "default_name")]
	pub name: String,

	/// Address to bind the streaming socket to.
	#[serde(default = "default_address")]
	pub address: String,

	/// Port to bind the streaming socket to.
	#[serde(default = "default_port")]
	pub port: u16,

	/// Configuration for the video stream.
	pub video: VideoConfig,

	/// Configuration for the audio stream.
	pub audio: AudioConfig,

	/// Configuration for tracking input and pose matching.
	pub tracking: TrackingConfig,

	/// Connection housekeeping (keepalives, timeouts).
	#[serde(default)]
	pub connection: ConnectionConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VideoConfig {
	/// Target render width per eye, in pixels.
	pub width: u32,

	/// Target render height per eye, in pixels.
	pub height: u32,

	/// Refresh rates offered to clients, in preference order.
	pub refresh_rates: Vec<f32>,

	/// Codec preference order. The first backend that initializes wins.
	pub codec_preference: Vec<CodecName>,

	/// Bitrate bounds for the dynamic controller.
	pub bitrate: BitrateConfig,

	/// Forward error correction bounds.
	pub fec: FecConfig,

	/// Maximum datagram payload size in bytes. Shard payloads are this
	/// minus the video header overhead.
	pub mtu: usize,

	/// Foveated encoding parameters, or null to encode uniformly.
	pub foveation: Option<FoveationConfig>,

	/// Color range of the encoded stream.
	#[serde(default)]
	pub color_range: ColorRange,

	/// Rate control mode requested from the encoder backend.
	#[serde(default)]
	pub rate_control: RateControl,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateControl {
	/// Constant bitrate with filler data.
	#[default]
	Cbr,
	/// Latency-constrained variable bitrate.
	ConstrainedVbr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BitrateConfig {
	/// Bitrate offered in the CONNECT reply.
	pub initial_bps: u64,

	/// Lower bound for the dynamic controller.
	pub min_bps: u64,

	/// Upper bound for the dynamic controller.
	pub max_bps: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FecConfig {
	/// Parity overhead applied while the link is clean, in percent.
	pub initial_percentage: u16,

	/// Parity overhead after repeated FEC failures, in percent.
	pub max_percentage: u16,
}

/// Partition of the render plane for foveated encoding: a full-density
/// center region and edge regions shrunk by the given ratios.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FoveationConfig {
	/// Horizontal extent of the center region, as a fraction of the plane.
	pub center_size_x: f32,

	/// Vertical extent of the center region, as a fraction of the plane.
	pub center_size_y: f32,

	/// Horizontal shrink ratio applied to the edge regions.
	pub edge_ratio_x: f32,

	/// Vertical shrink ratio applied to the edge regions.
	pub edge_ratio_y: f32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorRange {
	#[default]
	Full,
	Studio,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecName {
	H264,
	Hevc,
	Av1,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudioConfig {
	/// Output sample rate. The client decodes a fixed 48 kHz stream, so
	/// any other value is rejected at load time.
	pub sample_rate: u32,

	/// Duration of one PCM packet in milliseconds.
	#[serde(default = "default_audio_frame_ms")]
	pub frame_duration_ms: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackingConfig {
	/// Interpupillary distance in meters, forwarded to the host runtime.
	pub ipd_m: f32,

	/// Which hand each reported controller maps to.
	pub controller_hands: [Hand; 2],

	/// Number of pose records kept for frame matching.
	#[serde(default = "default_pose_history_size")]
	pub pose_history_size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hand {
	Left,
	Right,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Keepalive interval in seconds. A peer is declared lost after five
	/// intervals of silence.
	pub keepalive_interval_s: u64,

	/// Optional cap on packets sent per throttling slot.
	#[serde(default)]
	pub packet_limit_per_slot: Option<usize>,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			keepalive_interval_s: 1,
			packet_limit_per_slot: None,
		}
	}
}

fn default_name() -> String {
	"Skylight".to_string()
}

fn default_address() -> String {
	"0.0.0.0".to_string()
}

fn default_port() -> u16 {
	9944
}

fn default_audio_frame_ms() -> u32 {
	10
}

fn default_pose_history_size() -> usize {
	360
}

impl Config {
	pub fn read_from_file<P: AsRef<Path>>(file: P) -> anyhow::Result<Config> {
		let blob = std::fs::read_to_string(&file)
			.with_context(|| format!("Failed to open configuration file {}", file.as_ref().display()))?;
		let config: Config = serde_json::from_str(&blob)
			.with_context(|| format!("Failed to parse configuration file {}", file.as_ref().display()))?;
		config.validate().map_err(anyhow::Error::from)?;

		Ok(config)
	}

	/// Cross-field checks that serde cannot express.
	pub fn validate(&self) -> Result<(), Error> {
		if self.audio.sample_rate != 48_000 {
			return Err(Error::Config(format!(
				"audio.sample_rate must be 48000, got {}",
				self.audio.sample_rate,
			)));
		}
		if self.video.codec_preference.is_empty() {
			return Err(Error::Config("video.codec_preference must not be empty".to_string()));
		}
		if self.video.refresh_rates.is_empty() {
			return Err(Error::Config("video.refresh_rates must not be empty".to_string()));
		}
		let bitrate = &self.video.bitrate;
		if bitrate.min_bps == 0 || bitrate.min_bps > bitrate.initial_bps || bitrate.initial_bps > bitrate.max_bps {
			return Err(Error::Config(format!(
				"video.bitrate bounds must satisfy 0 < min <= initial <= max, got {}/{}/{}",
				bitrate.min_bps, bitrate.initial_bps, bitrate.max_bps,
			)));
		}
		let fec = &self.video.fec;
		if fec.initial_percentage > fec.max_percentage || fec.max_percentage > 50 {
			return Err(Error::Config(format!(
				"video.fec bounds must satisfy initial <= max <= 50, got {}/{}",
				fec.initial_percentage, fec.max_percentage,
			)));
		}
		if self.video.mtu < 256 || self.video.mtu > 65_000 {
			return Err(Error::Config(format!("video.mtu out of range: {}", self.video.mtu)));
		}
		if let Some(foveation) = &self.video.foveation {
			for (name, value) in [
				("center_size_x", foveation.center_size_x),
				("center_size_y", foveation.center_size_y),
			] {
				if !(0.0..=1.0).contains(&value) {
					return Err(Error::Config(format!("video.foveation.{name} must be in [0, 1], got {value}")));
				}
			}
			for (name, value) in [
				("edge_ratio_x", foveation.edge_ratio_x),
				("edge_ratio_y", foveation.edge_ratio_y),
			] {
				if value < 1.0 {
					return Err(Error::Config(format!("video.foveation.{name} must be >= 1, got {value}")));
				}
			}
		}
		if self.tracking.controller_hands[0] == self.tracking.controller_hands[1] {
			return Err(Error::Config("tracking.controller_hands must name both hands".to_string()));
		}
		if self.connection.keepalive_interval_s == 0 {
			return Err(Error::Config("connection.keepalive_interval_s must be positive".to_string()));
		}

		Ok(())
	}
}

impl Default for Config {
	fn default() -> Self {
		Self {
			name: default_name(),
			address: default_address(),
			port: default_port(),
			video: VideoConfig {
				width: 1920,
				height: 1080,
				refresh_rates: vec![72.0, 90.0],
				codec_preference: vec![CodecName::Hevc, CodecName::H264],
				bitrate: BitrateConfig {
					initial_bps: 30_000_000,
					min_bps: 5_000_000,
					max_bps: 100_000_000,
				},
				fec: FecConfig {
					initial_percentage: 5,
					max_percentage: 10,
				},
				mtu: 1442,
				foveation: None,
				color_range: ColorRange::Full,
				rate_control: RateControl::Cbr,
			},
			audio: AudioConfig {
				sample_rate: 48_000,
				frame_duration_ms: default_audio_frame_ms(),
			},
			tracking: TrackingConfig {
				ipd_m: 0.063,
				controller_hands: [Hand::Left, Hand::Right],
				pose_history_size: default_pose_history_size(),
			},
			connection: Default::default(),
		}
	}
}
