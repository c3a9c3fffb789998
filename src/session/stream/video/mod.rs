use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_shutdown::ShutdownManager;
use tokio::sync::mpsc;

use crate::cadence::{FecController, IdrScheduler};
use crate::compositor::ComposedFrame;
use crate::session::manager::SessionShutdownReason;
use crate::stats::SessionStats;
use crate::transport::{now_ns, PacketClass, TransportSender};

use self::encoder::{CodecKind, DynamicParams, EncoderSettings, VideoEncoder};
use self::packetizer::Packetizer;

pub mod encoder;
pub mod nal;
pub mod packetizer;
pub mod receiver;

#[derive(Debug)]
enum VideoStreamCommand {
	Start,
	RequestIdrFrame,
	SetParams(DynamicParams),
}

/// Everything the video stream needs that came out of the handshake.
#[derive(Clone, Debug)]
pub struct VideoStreamContext {
	pub settings: EncoderSettings,
	pub codec_preference: Vec<CodecKind>,
	/// Shard payload bytes per datagram: the negotiated MTU minus the
	/// video wire overhead.
	pub payload_size: usize,
}

/// Server-side video pipeline: drains composed frames, encodes them and
/// hands FEC-protected shards to the transport.
#[derive(Clone)]
pub struct VideoStream {
	command_tx: mpsc::Sender<VideoStreamCommand>,
}

impl VideoStream {
	pub fn new(
		context: VideoStreamContext,
		frame_rx: mpsc::Receiver<ComposedFrame>,
		transport: TransportSender,
		idr_scheduler: Arc<IdrScheduler>,
		fec: Arc<Mutex<FecController>>,
		stats: Arc<SessionStats>,
		stop_session_manager: ShutdownManager<SessionShutdownReason>,
	) -> Self {
		let (command_tx, command_rx) = mpsc::channel(10);
		let inner = VideoStreamInner {
			context,
			transport,
			idr_scheduler,
			fec,
			stats,
		};
		tokio::spawn(inner.run(command_rx, frame_rx, stop_session_manager));

		Self { command_tx }
	}

	pub async fn start(&self) -> Result<(), ()> {
		tracing::debug!("Starting video stream.");
		self.command_tx.send(VideoStreamCommand::Start).await
			.map_err(|e| tracing::warn!("Failed to send Start command: {e}"))
	}

	pub async fn request_idr_frame(&self) -> Result<(), ()> {
		self.command_tx.send(VideoStreamCommand::RequestIdrFrame).await
			.map_err(|e| tracing::warn!("Failed to send RequestIdrFrame command: {e}"))
	}

	pub async fn set_params(&self, params: DynamicParams) -> Result<(), ()> {
		self.command_tx.send(VideoStreamCommand::SetParams(params)).await
			.map_err(|e| tracing::warn!("Failed to send SetParams command: {e}"))
	}
}

struct VideoStreamInner {
	context: VideoStreamContext,
	transport: TransportSender,
	idr_scheduler: Arc<IdrScheduler>,
	fec: Arc<Mutex<FecController>>,
	stats: Arc<SessionStats>,
}

impl VideoStreamInner {
	async fn run(
		self,
		mut command_rx: mpsc::Receiver<VideoStreamCommand>,
		frame_rx: mpsc::Receiver<ComposedFrame>,
		stop_session_manager: ShutdownManager<SessionShutdownReason>,
	) {
		// Trigger session shutdown if we exit unexpectedly.
		let _session_stop_token =
			stop_session_manager.trigger_shutdown_token(SessionShutdownReason::VideoStreamStopped);
		let _delay_stop = stop_session_manager.delay_shutdown_token();

		// Parameter handoff into the blocking encode loop.
		let pending_params: Arc<Mutex<Option<DynamicParams>>> = Arc::new(Mutex::new(None));

		let mut frame_rx = Some(frame_rx);
		while let Ok(Some(command)) = stop_session_manager.wrap_cancel(command_rx.recv()).await {
			match command {
				VideoStreamCommand::Start => {
					let Some(frame_rx) = frame_rx.take() else {
						tracing::warn!("Can't start streaming twice.");
						continue;
					};

					let worker = EncodeWorker {
						context: self.context.clone(),
						transport: self.transport.clone(),
						idr_scheduler: self.idr_scheduler.clone(),
						fec: self.fec.clone(),
						stats: self.stats.clone(),
						pending_params: pending_params.clone(),
					};
					let stop = stop_session_manager.clone();
					tokio::task::spawn_blocking(move || {
						let _stop_token =
							stop.trigger_shutdown_token(SessionShutdownReason::VideoStreamStopped);
						let _delay = stop.delay_shutdown_token();
						if worker.run(frame_rx, &stop).is_err() {
							tracing::error!("Encoder pipeline failed, stopping session.");
						}
					});
				},
				VideoStreamCommand::RequestIdrFrame => {
					tracing::debug!("IDR frame requested.");
					self.idr_scheduler.request();
				},
				VideoStreamCommand::SetParams(params) => {
					*pending_params.lock().unwrap() = Some(params);
				},
			}
		}

		tracing::debug!("Video stream stopped.");
	}
}

struct EncodeWorker {
	context: VideoStreamContext,
	transport: TransportSender,
	idr_scheduler: Arc<IdrScheduler>,
	fec: Arc<Mutex<FecController>>,
	stats: Arc<SessionStats>,
	pending_params: Arc<Mutex<Option<DynamicParams>>>,
}

impl EncodeWorker {
	/// The blocking produce loop. Returns `Err` only on the persistent
	/// failures that stop streaming.
	fn run(
		&self,
		mut frame_rx: mpsc::Receiver<ComposedFrame>,
		stop: &ShutdownManager<SessionShutdownReason>,
	) -> Result<(), ()> {
		let mut encoder = VideoEncoder::initialize(&self.context.codec_preference, self.context.settings)
			.map_err(|e| tracing::error!("{e}"))?;
		let mut packetizer = Packetizer::new();

		tracing::info!("Video pipeline running with the {} encoder.", encoder.codec_id());

		while !stop.is_shutdown_triggered() {
			let Some(frame) = frame_rx.blocking_recv() else {
				tracing::debug!("Composed frame channel closed.");
				break;
			};

			if let Some(params) = self.pending_params.lock().unwrap().take() {
				encoder.set_params(params);
			}

			let insert_idr = self.idr_scheduler.take_due();
			let encode_start = Instant::now();
			encoder.push_frame(&frame, insert_idr);

			while let Some(packet) = encoder.pull_encoded()? {
				self.stats.record_frame_encoded(encode_start.elapsed());
				if packet.is_idr {
					self.idr_scheduler.note_idr_sent();
				}

				let fec_percentage = self.fec.lock().unwrap().percentage();
				let datagrams =
					packetizer.packetize(&packet, self.context.payload_size, fec_percentage, now_ns())?;
				for datagram in datagrams {
					if self.transport.blocking_send(PacketClass::Video, datagram).is_err() {
						tracing::info!("Transport closed, stopping video pipeline.");
						return Ok(());
					}
				}
			}
		}

		tracing::debug!("Encode worker stopped.");
		Ok(())
	}
}
