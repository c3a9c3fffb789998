use std::sync::{Arc, Mutex};

use async_shutdown::ShutdownManager;
use tokio::sync::{broadcast, mpsc, Notify};

use crate::cadence::{Cadence, FecController, IdrScheduler};
use crate::compositor::FrameSink;
use crate::config::Config;
use crate::stats::SessionStats;
use crate::tracking::PoseHistory;
use crate::transport::TransportSender;

use self::manager::SessionShutdownReason;
use self::stream::audio::{AudioInput, AudioStream};
use self::stream::control::StreamNegotiation;
use self::stream::video::encoder::{DynamicParams, EncoderSettings};
use self::stream::video::packetizer::VIDEO_WIRE_OVERHEAD;
use self::stream::video::{VideoStream, VideoStreamContext};

pub use self::manager::SessionManager;

pub mod manager;
pub mod stream;

/// One streaming session: the per-client video and audio pipelines plus
/// the cadence that paces them, created by the manager after a completed
/// handshake and torn down on disconnect.
pub struct Session {
	video_stream: VideoStream,
	audio_stream: AudioStream,
	_cadence: Cadence,
	frame_sink: FrameSink,
	running: bool,
}

impl Session {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: &Config,
		negotiation: StreamNegotiation,
		frame_sink: FrameSink,
		transport: TransportSender,
		idr_scheduler: Arc<IdrScheduler>,
		fec: Arc<Mutex<FecController>>,
		pose_history: Arc<PoseHistory>,
		stats: Arc<SessionStats>,
		present_notify: Arc<Notify>,
		vsync_tx: broadcast::Sender<()>,
		stop_session_manager: ShutdownManager<SessionShutdownReason>,
	) -> Self {
		// Composed frames flow from the submit thread into the encoder
		// through this channel for as long as the session lives.
		let (frame_tx, frame_rx) = mpsc::channel(3);
		frame_sink.connect(frame_tx);

		let mut settings = EncoderSettings::from_config(
			&config.video,
			negotiation.width,
			negotiation.height,
			negotiation.refresh_rate,
		);
		settings.bitrate_bps = negotiation.initial_bitrate_bps;

		let video_stream = VideoStream::new(
			VideoStreamContext {
				settings,
				// The wire codec was settled in the handshake; there is
				// nothing to fall back to past this point.
				codec_preference: vec![negotiation.codec],
				payload_size: negotiation.mtu.saturating_sub(VIDEO_WIRE_OVERHEAD),
			},
			frame_rx,
			transport.clone(),
			idr_scheduler,
			fec.clone(),
			stats.clone(),
			stop_session_manager.clone(),
		);

		let audio_stream = AudioStream::new(
			&config.audio,
			transport,
			stop_session_manager.clone(),
		);

		let cadence = Cadence::spawn(
			negotiation.refresh_rate,
			stats,
			pose_history,
			fec,
			present_notify,
			vsync_tx,
			stop_session_manager,
		);

		Self {
			video_stream,
			audio_stream,
			_cadence: cadence,
			frame_sink,
			running: false,
		}
	}

	pub async fn start(&mut self) -> Result<(), ()> {
		if self.running {
			tracing::warn!("Can't start a session twice.");
			return Ok(());
		}
		self.running = true;
		self.video_stream.start().await
	}

	pub fn is_running(&self) -> bool {
		self.running
	}

	pub async fn set_params(&self, params: DynamicParams) -> Result<(), ()> {
		self.video_stream.set_params(params).await
	}

	pub async fn request_idr_frame(&self) -> Result<(), ()> {
		self.video_stream.request_idr_frame().await
	}

	pub fn audio_input(&self) -> AudioInput {
		self.audio_stream.input()
	}
}

impl Drop for Session {
	fn drop(&mut self) {
		// Frames composed after this point have no consumer.
		self.frame_sink.disconnect();
	}
}
