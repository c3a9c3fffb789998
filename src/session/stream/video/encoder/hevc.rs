use super::{BackendError, CodecKind, EncoderBackend, EncoderSettings, I420Frame};

/// HEVC backend. The engine is a platform hardware session (VAAPI, NVENC
/// or AMF) loaded by the host build; a build without one refuses to
/// initialize and the caller falls through to the next codec in
/// preference order.
#[derive(Debug)]
pub struct HevcBackend {
	_private: (),
}

impl HevcBackend {
	pub fn new(settings: &EncoderSettings) -> Result<Self, BackendError> {
		tracing::debug!(
			"Probing for an HEVC engine at {}x{}.",
			settings.width, settings.height,
		);
		Err(BackendError::Unsupported(CodecKind::Hevc))
	}
}

impl EncoderBackend for HevcBackend {
	fn encode(&mut self, _frame: &I420Frame, _force_idr: bool) -> Result<Vec<u8>, BackendError> {
		Err(BackendError::Encode("no HEVC engine".to_string()))
	}

	fn update_params(&mut self, _bitrate_bps: u64, _framerate: f32) -> bool {
		false
	}

	fn codec(&self) -> CodecKind {
		CodecKind::Hevc
	}
}
