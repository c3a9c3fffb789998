use super::{BackendError, CodecKind, EncoderBackend, EncoderSettings, I420Frame};

/// AV1 backend. Like HEVC this is a platform hardware session; builds
/// without one refuse to initialize so the preference-order fallback can
/// proceed.
#[derive(Debug)]
pub struct Av1Backend {
	_private: (),
}

impl Av1Backend {
	pub fn new(settings: &EncoderSettings) -> Result<Self, BackendError> {
		tracing::debug!(
			"Probing for an AV1 engine at {}x{}.",
			settings.width, settings.height,
		);
		Err(BackendError::Unsupported(CodecKind::Av1))
	}
}

impl EncoderBackend for Av1Backend {
	fn encode(&mut self, _frame: &I420Frame, _force_idr: bool) -> Result<Vec<u8>, BackendError> {
		Err(BackendError::Encode("no AV1 engine".to_string()))
	}

	fn update_params(&mut self, _bitrate_bps: u64, _framerate: f32) -> bool {
		false
	}

	fn codec(&self) -> CodecKind {
		CodecKind::Av1
	}
}
