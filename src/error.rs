use crate::session::stream::video::encoder::CodecKind;

/// Fatal errors surfaced to the host. Everything below this level is
/// absorbed where it is observed (logged transient errors, frame-drop
/// counters) or reported as a session event.
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("failed to bind streaming socket: {0}")]
	Bind(#[from] std::io::Error),

	#[error("no usable encoder backend, tried {tried:?}")]
	EncoderInit { tried: Vec<CodecKind> },

	#[error("invalid configuration: {0}")]
	Config(String),
}
