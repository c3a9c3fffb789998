use std::sync::{Arc, Mutex};

use async_shutdown::ShutdownManager;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};

use crate::cadence::{FecController, IdrScheduler};
use crate::compositor::FrameSink;
use crate::config::Config;
use crate::stats::SessionStats;
use crate::tracking::PoseHistory;
use crate::transport::TransportSender;

use super::stream::audio::AudioInput;
use super::stream::control::{ControlEvent, ControlStream};
use super::Session;

/// Why a session's shutdown manager fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionShutdownReason {
	SessionStopped,
	VideoStreamStopped,
	Disconnected,
	ServerShutdown,
}

pub enum SessionManagerCommand {
	GetAudioInput(oneshot::Sender<Option<AudioInput>>),
	StopSession,
}

/// Owns the active session and drives its lifecycle from control-plane
/// events: a completed handshake creates it, the client's ready signal
/// starts the streams, a disconnect tears everything down and returns
/// the server to its listening state.
#[derive(Clone)]
pub struct SessionManager {
	command_tx: mpsc::Sender<SessionManagerCommand>,
}

impl SessionManager {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Config,
		frame_sink: FrameSink,
		transport: TransportSender,
		control: ControlStream,
		event_rx: mpsc::Receiver<ControlEvent>,
		idr_scheduler: Arc<IdrScheduler>,
		fec: Arc<Mutex<FecController>>,
		pose_history: Arc<PoseHistory>,
		stats: Arc<SessionStats>,
		present_notify: Arc<Notify>,
		vsync_tx: broadcast::Sender<()>,
		shutdown: ShutdownManager<i32>,
	) -> Self {
		let (command_tx, command_rx) = mpsc::channel(10);
		let inner = SessionManagerInner {
			config,
			frame_sink,
			transport,
			control,
			idr_scheduler,
			fec,
			pose_history,
			stats,
			present_notify,
			vsync_tx,
		};
		tokio::spawn(inner.run(event_rx, command_rx, shutdown));

		Self { command_tx }
	}

	/// The audio input of the active session, if any.
	pub async fn audio_input(&self) -> Result<Option<AudioInput>, ()> {
		let (reply_tx, reply_rx) = oneshot::channel();
		self.command_tx.send(SessionManagerCommand::GetAudioInput(reply_tx)).await
			.map_err(|e| tracing::error!("Failed to send GetAudioInput command: {e}"))?;
		reply_rx.await
			.map_err(|e| tracing::error!("Failed to wait for GetAudioInput response: {e}"))
	}

	pub async fn stop_session(&self) -> Result<(), ()> {
		self.command_tx.send(SessionManagerCommand::StopSession).await
			.map_err(|e| tracing::error!("Failed to send StopSession command: {e}"))
	}
}

struct ActiveSession {
	session: Session,
	stop: ShutdownManager<SessionShutdownReason>,
}

struct SessionManagerInner {
	config: Config,
	frame_sink: FrameSink,
	transport: TransportSender,
	control: ControlStream,
	idr_scheduler: Arc<IdrScheduler>,
	fec: Arc<Mutex<FecController>>,
	pose_history: Arc<PoseHistory>,
	stats: Arc<SessionStats>,
	present_notify: Arc<Notify>,
	vsync_tx: broadcast::Sender<()>,
}

impl SessionManagerInner {
	async fn run(
		self,
		mut event_rx: mpsc::Receiver<ControlEvent>,
		mut command_rx: mpsc::Receiver<SessionManagerCommand>,
		shutdown: ShutdownManager<i32>,
	) {
		let _delay_stop = shutdown.delay_shutdown_token();
		let mut active: Option<ActiveSession> = None;

		tracing::debug!("Session manager waiting for control events.");

		loop {
			let session_stop = active.as_ref().map(|active| active.stop.clone());

			tokio::select! {
				event = event_rx.recv() => {
					let Some(event) = event else {
						tracing::debug!("Control event channel closed.");
						break;
					};
					self.handle_event(event, &mut active).await;
				},
				command = command_rx.recv() => {
					let Some(command) = command else {
						break;
					};
					match command {
						SessionManagerCommand::GetAudioInput(reply_tx) => {
							let input = active.as_ref().map(|active| active.session.audio_input());
							if reply_tx.send(input).is_err() {
								tracing::error!("Failed to send audio input response.");
							}
						},
						SessionManagerCommand::StopSession => {
							if active.is_some() {
								let _ = self.control.disconnect("session stopped by host".to_string()).await;
								stop_session(&mut active, SessionShutdownReason::SessionStopped).await;
							} else {
								tracing::debug!("Trying to stop session, but no session is active.");
							}
						},
					}
				},
				reason = wait_session_death(session_stop) => {
					tracing::warn!("Session ended on its own: {reason:?}.");
					let _ = self.control.disconnect("streaming pipeline stopped".to_string()).await;
					stop_session(&mut active, reason).await;
				},
				_ = shutdown.wait_shutdown_triggered() => break,
			}
		}

		stop_session(&mut active, SessionShutdownReason::ServerShutdown).await;
		tracing::debug!("Session manager stopped.");
	}

	async fn handle_event(&self, event: ControlEvent, active: &mut Option<ActiveSession>) {
		match event {
			ControlEvent::Connected(negotiation) => {
				if active.is_some() {
					tracing::warn!("New connection while a session is active, replacing it.");
					stop_session(active, SessionShutdownReason::Disconnected).await;
				}

				let stop = ShutdownManager::new();
				let session = Session::new(
					&self.config,
					negotiation,
					self.frame_sink.clone(),
					self.transport.clone(),
					self.idr_scheduler.clone(),
					self.fec.clone(),
					self.pose_history.clone(),
					self.stats.clone(),
					self.present_notify.clone(),
					self.vsync_tx.clone(),
					stop.clone(),
				);
				*active = Some(ActiveSession { session, stop });
			},

			ControlEvent::Ready => {
				let Some(active) = active.as_mut() else {
					tracing::warn!("Client signaled ready without a session.");
					return;
				};
				let _ = active.session.start().await;
			},

			ControlEvent::ParamsChanged(params) => {
				let Some(active) = active.as_ref() else {
					return;
				};
				let _ = active.session.set_params(params).await;
			},

			ControlEvent::Disconnected(reason) => {
				tracing::info!("Tearing down session: {reason}.");
				stop_session(active, SessionShutdownReason::Disconnected).await;
			},
		}
	}
}

async fn wait_session_death(stop: Option<ShutdownManager<SessionShutdownReason>>) -> SessionShutdownReason {
	match stop {
		Some(stop) => stop.wait_shutdown_triggered().await,
		None => std::future::pending().await,
	}
}

async fn stop_session(active: &mut Option<ActiveSession>, reason: SessionShutdownReason) {
	let Some(ActiveSession { session, stop }) = active.take() else {
		return;
	};

	let _ = stop.trigger_shutdown(reason);
	// Dropping the session closes the composed-frame channel, which ends
	// the encode worker; then wait for every task to drain.
	drop(session);
	stop.wait_shutdown_complete().await;
	tracing::debug!("Session stopped ({reason:?}).");
}
