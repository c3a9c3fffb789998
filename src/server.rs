use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_shutdown::ShutdownManager;
use tokio::sync::{broadcast, mpsc, watch, Notify};

use crate::cadence::{FecController, IdrScheduler};
use crate::compositor::{self, FrameComposer, FrameSink, SwapchainTable};
use crate::config::Config;
use crate::error::Error;
use crate::session::manager::SessionManager;
use crate::session::stream::audio::AudioInput;
use crate::session::stream::control::{ControlStream, TimeSyncEstimator};
use crate::session::stream::video::encoder::{self, EncoderSettings};
use crate::session::stream::{tagged_buffer, HapticsPacket, PacketType};
use crate::stats::{SessionStats, StatsSnapshot};
use crate::tracking::{PoseHistory, TrackingIngest, TrackingUpdate};
use crate::transport::{PacketClass, Transport, TransportDispatch};

/// The assembled streaming core. The host keeps this alive for the
/// server's lifetime, drives the [`FrameComposer`] from its submit
/// thread, feeds PCM through the audio input, and paces itself on the
/// vsync events.
pub struct Server {
	transport: Arc<Transport>,
	session_manager: SessionManager,
	control: ControlStream,
	composer: Option<FrameComposer>,
	tracking_updates: watch::Receiver<Option<TrackingUpdate>>,
	vsync_tx: broadcast::Sender<()>,
	stats: Arc<SessionStats>,
	time_sync: Arc<TimeSyncEstimator>,
}

impl Server {
	pub async fn new(config: Config, shutdown: ShutdownManager<i32>) -> Result<Self, Error> {
		config.validate()?;

		let stats = Arc::new(SessionStats::new());
		let pose_history = Arc::new(PoseHistory::new(config.tracking.pose_history_size));
		let swapchains = Arc::new(SwapchainTable::new());
		let frame_sink = FrameSink::new();
		let present_notify = Arc::new(Notify::new());
		let (vsync_tx, _) = broadcast::channel(4);

		let (tracking_tx, tracking_rx) = mpsc::channel(64);
		let (control_tx, control_rx) = mpsc::channel(64);
		let transport = Arc::new(
			Transport::bind(
				&config.address,
				config.port,
				config.connection.packet_limit_per_slot,
				TransportDispatch { tracking_tx, control_tx },
				stats.clone(),
				shutdown.clone(),
			)
			.await?,
		);

		let ingest = TrackingIngest::new(pose_history.clone(), config.tracking.controller_hands);
		let tracking_updates = ingest.subscribe();
		tokio::spawn(ingest.run(tracking_rx, shutdown.clone()));

		let refresh_rate = config.video.refresh_rates[0];
		let idr_scheduler = Arc::new(IdrScheduler::new(refresh_rate));
		let fec = Arc::new(Mutex::new(FecController::new(&config.video.fec)));
		let time_sync = Arc::new(TimeSyncEstimator::new());

		let (eye_width, eye_height) = compositor::encoded_extent(&config.video);
		let available_codecs = encoder::probe_available(EncoderSettings::from_config(
			&config.video,
			eye_width * 2,
			eye_height,
			refresh_rate,
		));
		if available_codecs.is_empty() {
			return Err(Error::EncoderInit {
				tried: config.video.codec_preference.iter().map(|&name| name.into()).collect(),
			});
		}
		tracing::info!("Available encoder backends: {available_codecs:?}.");

		let (event_tx, event_rx) = mpsc::channel(16);
		let control = ControlStream::new(
			config.clone(),
			transport.clone(),
			available_codecs,
			control_rx,
			event_tx,
			idr_scheduler.clone(),
			fec.clone(),
			pose_history.clone(),
			time_sync.clone(),
			stats.clone(),
			shutdown.clone(),
		);

		let session_manager = SessionManager::new(
			config.clone(),
			frame_sink.clone(),
			transport.sender(),
			control.clone(),
			event_rx,
			idr_scheduler,
			fec,
			pose_history.clone(),
			stats.clone(),
			present_notify.clone(),
			vsync_tx.clone(),
			shutdown,
		);

		let composer = FrameComposer::new(
			&config.video,
			swapchains,
			pose_history,
			frame_sink,
			stats.clone(),
			present_notify,
		);

		Ok(Self {
			transport,
			session_manager,
			control,
			composer: Some(composer),
			tracking_updates,
			vsync_tx,
			stats,
			time_sync,
		})
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.transport.local_addr()
	}

	/// Hands the composer to the host's submit thread. The composer is
	/// single-owner; this returns `None` on a second call.
	pub fn take_composer(&mut self) -> Option<FrameComposer> {
		self.composer.take()
	}

	pub fn subscribe_vsync(&self) -> broadcast::Receiver<()> {
		self.vsync_tx.subscribe()
	}

	/// Latest head and controller state from the client, for the host's
	/// pose update path.
	pub fn tracking_updates(&self) -> watch::Receiver<Option<TrackingUpdate>> {
		self.tracking_updates.clone()
	}

	/// The audio input of the active session, if a client is streaming.
	pub async fn audio_input(&self) -> Option<AudioInput> {
		self.session_manager.audio_input().await.ok().flatten()
	}

	pub async fn send_haptics(&self, haptics: HapticsPacket) -> Result<(), ()> {
		let mut datagram = tagged_buffer(PacketType::Haptics, 20);
		haptics.serialize(&mut datagram);
		self.transport.sender().send(PacketClass::Control, datagram).await
	}

	/// Host-side bitrate request; takes effect at the next frame boundary.
	pub async fn set_requested_bitrate(&self, bitrate_bps: u64) -> Result<(), ()> {
		self.control.set_requested_bitrate(bitrate_bps).await
	}

	pub async fn stop_session(&self) -> Result<(), ()> {
		self.session_manager.stop_session().await
	}

	pub fn stats_snapshot(&self) -> StatsSnapshot {
		self.stats.snapshot()
	}

	pub fn time_sync(&self) -> Arc<TimeSyncEstimator> {
		self.time_sync.clone()
	}
}
