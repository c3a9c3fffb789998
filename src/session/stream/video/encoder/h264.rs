use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::YUVSource;
use openh264::OpenH264API;

use super::{BackendError, CodecKind, EncoderBackend, EncoderSettings, I420Frame};

/// H.264 backend on the openh264 engine. The engine is zero-lookahead and
/// B-frame free by construction, so the low-latency contract holds
/// without further tuning; keyframes are produced only on request.
pub struct H264Backend {
	encoder: Encoder,
	width: u32,
	height: u32,
}

impl std::fmt::Debug for H264Backend {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("H264Backend")
			.field("width", &self.width)
			.field("height", &self.height)
			.finish()
	}
}

impl H264Backend {
	pub fn new(settings: &EncoderSettings) -> Result<Self, BackendError> {
		let api = OpenH264API::from_source();
		let config = EncoderConfig::new(settings.width, settings.height)
			.max_frame_rate(settings.refresh_rate)
			.set_bitrate_bps(settings.bitrate_bps.min(u32::MAX as u64) as u32);

		let encoder = Encoder::with_config(api, config)
			.map_err(|e| BackendError::Init(e.to_string()))?;

		Ok(Self {
			encoder,
			width: settings.width,
			height: settings.height,
		})
	}
}

impl EncoderBackend for H264Backend {
	fn encode(&mut self, frame: &I420Frame, force_idr: bool) -> Result<Vec<u8>, BackendError> {
		let expected = self.width as usize * self.height as usize * 3 / 2;
		if frame.data.len() < expected {
			return Err(BackendError::Encode(format!(
				"frame has {} bytes, expected {expected}",
				frame.data.len(),
			)));
		}

		if force_idr {
			unsafe {
				self.encoder.raw_api().force_intra_frame(true);
			}
		}

		let yuv = PlanarFrame {
			data: &frame.data,
			width: self.width as usize,
			height: self.height as usize,
		};
		let bitstream = self.encoder.encode(&yuv)
			.map_err(|e| BackendError::Encode(e.to_string()))?;

		// The engine emits Annex-B units with start codes; concatenating
		// the layers yields the raw frame bitstream.
		let mut raw = Vec::new();
		for layer_index in 0..bitstream.num_layers() {
			let Some(layer) = bitstream.layer(layer_index) else {
				continue;
			};
			for nal_index in 0..layer.nal_count() {
				if let Some(nal_unit) = layer.nal_unit(nal_index) {
					raw.extend_from_slice(nal_unit);
				}
			}
		}

		Ok(raw)
	}

	fn update_params(&mut self, _bitrate_bps: u64, _framerate: f32) -> bool {
		// The engine has no live retune path; the front rebuilds us.
		false
	}

	fn codec(&self) -> CodecKind {
		CodecKind::H264
	}
}

/// Borrowed I420 planes in the layout the engine expects.
struct PlanarFrame<'a> {
	data: &'a [u8],
	width: usize,
	height: usize,
}

impl YUVSource for PlanarFrame<'_> {
	fn width(&self) -> i32 {
		self.width as i32
	}

	fn height(&self) -> i32 {
		self.height as i32
	}

	fn y(&self) -> &[u8] {
		&self.data[..self.width * self.height]
	}

	fn u(&self) -> &[u8] {
		let luma = self.width * self.height;
		&self.data[luma..luma + luma / 4]
	}

	fn v(&self) -> &[u8] {
		let luma = self.width * self.height;
		&self.data[luma + luma / 4..luma + luma / 2]
	}

	fn y_stride(&self) -> i32 {
		self.width as i32
	}

	fn u_stride(&self) -> i32 {
		(self.width / 2) as i32
	}

	fn v_stride(&self) -> i32 {
		(self.width / 2) as i32
	}
}
