use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use tokio::sync::mpsc;

use crate::cadence::{BitrateController, FecController, IdrScheduler};
use crate::compositor;
use crate::config::Config;
use crate::session::stream::video::encoder::{CodecKind, DynamicParams};
use crate::session::stream::{tagged_buffer, PacketType};
use crate::stats::SessionStats;
use crate::tracking::PoseHistory;
use crate::transport::{ControlDatagram, PacketClass, Transport};

pub const PROTOCOL_VERSION: u32 = 1;

/// Cadence of CONNECT retransmissions until the client shows progress.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const CONNECT_RETRIES: u32 = 10;

/// Raw audio bitrate of the fixed 48 kHz s16 stereo stream, part of the
/// transport throttle budget.
const AUDIO_BPS: u64 = 48_000 * 2 * 2 * 8;

pub const HANDSHAKE_ERROR_VERSION: u32 = 1;
pub const HANDSHAKE_ERROR_NO_CODEC: u32 = 2;

const HANDSHAKE_KIND_HELLO: u32 = 1;
const HANDSHAKE_KIND_CONNECT: u32 = 2;
const HANDSHAKE_KIND_ERROR: u32 = 3;

/// Client hello: everything the server needs to pick stream parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct HelloMessage {
	pub protocol_version: u32,
	pub device_name: [u8; 32],
	pub supported_codecs: u32,
	pub preferred_width: u32,
	pub preferred_height: u32,
	pub refresh_rates: [f32; 4],
}

impl HelloMessage {
	pub fn device_name(&self) -> String {
		let end = self.device_name.iter().position(|&b| b == 0).unwrap_or(32);
		String::from_utf8_lossy(&self.device_name[..end]).into_owned()
	}

	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend(HANDSHAKE_KIND_HELLO.to_le_bytes());
		buffer.extend(self.protocol_version.to_le_bytes());
		buffer.extend(self.device_name);
		buffer.extend(self.supported_codecs.to_le_bytes());
		buffer.extend(self.preferred_width.to_le_bytes());
		buffer.extend(self.preferred_height.to_le_bytes());
		for rate in self.refresh_rates {
			buffer.extend(rate.to_le_bytes());
		}
	}

	fn parse(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < 64 {
			tracing::warn!("Hello message too short: {} bytes.", buffer.len());
			return Err(());
		}
		Ok(Self {
			protocol_version: u32::from_le_bytes(buffer[0..4].try_into().unwrap()),
			device_name: buffer[4..36].try_into().unwrap(),
			supported_codecs: u32::from_le_bytes(buffer[36..40].try_into().unwrap()),
			preferred_width: u32::from_le_bytes(buffer[40..44].try_into().unwrap()),
			preferred_height: u32::from_le_bytes(buffer[44..48].try_into().unwrap()),
			refresh_rates: std::array::from_fn(|i| {
				f32::from_le_bytes(buffer[48 + i * 4..52 + i * 4].try_into().unwrap())
			}),
		})
	}
}

/// Server reply that transitions the connection to streaming.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConnectMessage {
	pub codec: CodecKind,
	pub width: u32,
	pub height: u32,
	pub refresh_rate: f32,
	pub mtu: u32,
	pub initial_bitrate_bps: u64,
}

impl ConnectMessage {
	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend(HANDSHAKE_KIND_CONNECT.to_le_bytes());
		buffer.extend(codec_bit(self.codec).to_le_bytes());
		buffer.extend(self.width.to_le_bytes());
		buffer.extend(self.height.to_le_bytes());
		buffer.extend(self.refresh_rate.to_le_bytes());
		buffer.extend(self.mtu.to_le_bytes());
		buffer.extend(self.initial_bitrate_bps.to_le_bytes());
	}

	pub fn parse(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < 28 {
			return Err(());
		}
		Ok(Self {
			codec: codec_from_bit(u32::from_le_bytes(buffer[0..4].try_into().unwrap())).ok_or(())?,
			width: u32::from_le_bytes(buffer[4..8].try_into().unwrap()),
			height: u32::from_le_bytes(buffer[8..12].try_into().unwrap()),
			refresh_rate: f32::from_le_bytes(buffer[12..16].try_into().unwrap()),
			mtu: u32::from_le_bytes(buffer[16..20].try_into().unwrap()),
			initial_bitrate_bps: u64::from_le_bytes(buffer[20..28].try_into().unwrap()),
		})
	}
}

#[derive(Clone, Debug, PartialEq)]
pub enum HandshakeMessage {
	Hello(HelloMessage),
	Connect(ConnectMessage),
	Error(u32),
}

impl HandshakeMessage {
	pub fn parse(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < 4 {
			return Err(());
		}
		let kind = u32::from_le_bytes(buffer[0..4].try_into().unwrap());
		let body = &buffer[4..];
		match kind {
			HANDSHAKE_KIND_HELLO => Ok(Self::Hello(HelloMessage::parse(body)?)),
			HANDSHAKE_KIND_CONNECT => Ok(Self::Connect(ConnectMessage::parse(body)?)),
			HANDSHAKE_KIND_ERROR => {
				if body.len() < 4 {
					return Err(());
				}
				Ok(Self::Error(u32::from_le_bytes(body[0..4].try_into().unwrap())))
			},
			_ => {
				tracing::warn!("Unknown handshake kind {kind}.");
				Err(())
			},
		}
	}
}

pub fn codec_bit(codec: CodecKind) -> u32 {
	match codec {
		CodecKind::H264 => 1 << 0,
		CodecKind::Hevc => 1 << 1,
		CodecKind::Av1 => 1 << 2,
	}
}

fn codec_from_bit(bit: u32) -> Option<CodecKind> {
	match bit {
		x if x == 1 << 0 => Some(CodecKind::H264),
		x if x == 1 << 1 => Some(CodecKind::Hevc),
		x if x == 1 << 2 => Some(CodecKind::Av1),
		_ => None,
	}
}

/// Bidirectional clock sync carrier, also the vehicle for the client's
/// periodic link report.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimeSyncPacket {
	/// 0 = client request, 1 = server reply, 2 = client report.
	pub mode: u32,
	pub server_time_us: u64,
	pub client_time_us: u64,
	pub observed_throughput_bps: u64,
	pub packets_lost: u64,
	pub fec_failures: u64,
}

pub const TIME_SYNC_SIZE: usize = 44;

impl TimeSyncPacket {
	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend(self.mode.to_le_bytes());
		buffer.extend(self.server_time_us.to_le_bytes());
		buffer.extend(self.client_time_us.to_le_bytes());
		buffer.extend(self.observed_throughput_bps.to_le_bytes());
		buffer.extend(self.packets_lost.to_le_bytes());
		buffer.extend(self.fec_failures.to_le_bytes());
	}

	pub fn parse(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < TIME_SYNC_SIZE {
			tracing::warn!("Time sync packet too short: {} bytes.", buffer.len());
			return Err(());
		}
		Ok(Self {
			mode: u32::from_le_bytes(buffer[0..4].try_into().unwrap()),
			server_time_us: u64::from_le_bytes(buffer[4..12].try_into().unwrap()),
			client_time_us: u64::from_le_bytes(buffer[12..20].try_into().unwrap()),
			observed_throughput_bps: u64::from_le_bytes(buffer[20..28].try_into().unwrap()),
			packets_lost: u64::from_le_bytes(buffer[28..36].try_into().unwrap()),
			fec_failures: u64::from_le_bytes(buffer[36..44].try_into().unwrap()),
		})
	}
}

const STREAM_CONTROL_REQUEST_IDR: u32 = 1;
const STREAM_CONTROL_PACKET_LOSS: u32 = 2;
const STREAM_CONTROL_KEEPALIVE: u32 = 3;
const STREAM_CONTROL_DISCONNECT: u32 = 4;
const STREAM_CONTROL_STREAM_READY: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamControlMessage {
	RequestIdr,
	PacketLoss { begin_seq: u32, end_seq: u32 },
	Keepalive,
	Disconnect,
	StreamReady,
}

impl StreamControlMessage {
	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		match self {
			Self::RequestIdr => buffer.extend(STREAM_CONTROL_REQUEST_IDR.to_le_bytes()),
			Self::PacketLoss { begin_seq, end_seq } => {
				buffer.extend(STREAM_CONTROL_PACKET_LOSS.to_le_bytes());
				buffer.extend(begin_seq.to_le_bytes());
				buffer.extend(end_seq.to_le_bytes());
			},
			Self::Keepalive => buffer.extend(STREAM_CONTROL_KEEPALIVE.to_le_bytes()),
			Self::Disconnect => buffer.extend(STREAM_CONTROL_DISCONNECT.to_le_bytes()),
			Self::StreamReady => buffer.extend(STREAM_CONTROL_STREAM_READY.to_le_bytes()),
		}
	}

	pub fn parse(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < 4 {
			return Err(());
		}
		match u32::from_le_bytes(buffer[0..4].try_into().unwrap()) {
			STREAM_CONTROL_REQUEST_IDR => Ok(Self::RequestIdr),
			STREAM_CONTROL_PACKET_LOSS => {
				if buffer.len() < 12 {
					return Err(());
				}
				Ok(Self::PacketLoss {
					begin_seq: u32::from_le_bytes(buffer[4..8].try_into().unwrap()),
					end_seq: u32::from_le_bytes(buffer[8..12].try_into().unwrap()),
				})
			},
			STREAM_CONTROL_KEEPALIVE => Ok(Self::Keepalive),
			STREAM_CONTROL_DISCONNECT => Ok(Self::Disconnect),
			STREAM_CONTROL_STREAM_READY => Ok(Self::StreamReady),
			kind => {
				tracing::warn!("Unknown stream control kind {kind}.");
				Err(())
			},
		}
	}
}

/// Smoothed client/server clock offset derived from time sync reports.
#[derive(Default)]
pub struct TimeSyncEstimator {
	offset_ns: AtomicI64,
}

impl TimeSyncEstimator {
	pub fn new() -> Self {
		Default::default()
	}

	fn update(&self, observed_offset_ns: i64) {
		let smoothed = self.offset_ns.load(Ordering::Relaxed);
		let next = if smoothed == 0 {
			observed_offset_ns
		} else {
			smoothed + (observed_offset_ns - smoothed) / 8
		};
		self.offset_ns.store(next, Ordering::Relaxed);
	}

	pub fn client_to_server_time_ns(&self, client_time_ns: u64) -> u64 {
		(client_time_ns as i64).saturating_add(self.offset_ns.load(Ordering::Relaxed)) as u64
	}

	pub fn server_to_client_time_ns(&self, server_time_ns: u64) -> u64 {
		(server_time_ns as i64).saturating_sub(self.offset_ns.load(Ordering::Relaxed)) as u64
	}
}

/// What the handshake settled on, handed to the session manager.
#[derive(Clone, Copy, Debug)]
pub struct StreamNegotiation {
	pub peer: SocketAddr,
	pub codec: CodecKind,
	/// Full side-by-side stereo extent.
	pub width: u32,
	pub height: u32,
	pub refresh_rate: f32,
	pub mtu: usize,
	pub initial_bitrate_bps: u64,
}

/// Events the control plane raises toward the session manager.
#[derive(Debug)]
pub enum ControlEvent {
	Connected(StreamNegotiation),
	Ready,
	ParamsChanged(DynamicParams),
	Disconnected(String),
}

enum ControlStreamCommand {
	SetRequestedBitrate(u64),
	Disconnect(String),
}

/// The control plane: handshake, heartbeat, time sync, dynamic parameter
/// negotiation and IDR intake, all riding the shared transport socket.
#[derive(Clone)]
pub struct ControlStream {
	command_tx: mpsc::Sender<ControlStreamCommand>,
}

impl ControlStream {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Config,
		transport: Arc<Transport>,
		available_codecs: Vec<CodecKind>,
		control_rx: mpsc::Receiver<ControlDatagram>,
		event_tx: mpsc::Sender<ControlEvent>,
		idr_scheduler: Arc<IdrScheduler>,
		fec: Arc<Mutex<FecController>>,
		pose_history: Arc<PoseHistory>,
		time_sync: Arc<TimeSyncEstimator>,
		stats: Arc<SessionStats>,
		shutdown: ShutdownManager<i32>,
	) -> Self {
		let (command_tx, command_rx) = mpsc::channel(10);
		let bitrate = BitrateController::new(&config.video.bitrate);
		let inner = ControlStreamInner {
			config,
			transport,
			available_codecs,
			event_tx,
			idr_scheduler,
			bitrate,
			fec,
			pose_history,
			time_sync,
			stats,
			peer: None,
		};
		tokio::spawn(inner.run(control_rx, command_rx, shutdown));

		Self { command_tx }
	}

	/// Host-requested bitrate change, applied at the next frame boundary.
	pub async fn set_requested_bitrate(&self, bitrate_bps: u64) -> Result<(), ()> {
		self.command_tx.send(ControlStreamCommand::SetRequestedBitrate(bitrate_bps)).await
			.map_err(|e| tracing::warn!("Failed to send SetRequestedBitrate command: {e}"))
	}

	/// Server-initiated disconnect, e.g. when the streaming pipeline dies.
	pub async fn disconnect(&self, reason: String) -> Result<(), ()> {
		self.command_tx.send(ControlStreamCommand::Disconnect(reason)).await
			.map_err(|e| tracing::warn!("Failed to send Disconnect command: {e}"))
	}
}

struct PeerState {
	address: SocketAddr,
	negotiation: StreamNegotiation,
	last_seen: Instant,
	last_keepalive_sent: Instant,
	connect_retries_left: u32,
	last_connect_sent: Instant,
	acknowledged: bool,
	last_fec_failures: u64,
	last_packets_lost: u64,
}

struct ControlStreamInner {
	config: Config,
	transport: Arc<Transport>,
	available_codecs: Vec<CodecKind>,
	event_tx: mpsc::Sender<ControlEvent>,
	idr_scheduler: Arc<IdrScheduler>,
	bitrate: BitrateController,
	fec: Arc<Mutex<FecController>>,
	pose_history: Arc<PoseHistory>,
	time_sync: Arc<TimeSyncEstimator>,
	stats: Arc<SessionStats>,
	peer: Option<PeerState>,
}

impl ControlStreamInner {
	async fn run(
		mut self,
		mut control_rx: mpsc::Receiver<ControlDatagram>,
		mut command_rx: mpsc::Receiver<ControlStreamCommand>,
		shutdown: ShutdownManager<i32>,
	) {
		let _delay_stop = shutdown.delay_shutdown_token();

		let keepalive_interval = Duration::from_secs(self.config.connection.keepalive_interval_s);
		let timeout = keepalive_interval * 5;
		let mut housekeeping = tokio::time::interval(CONNECT_RETRY_INTERVAL);

		tracing::debug!("Control plane listening for handshakes.");

		loop {
			tokio::select! {
				datagram = control_rx.recv() => {
					match datagram {
						Some((tag, payload, from)) => self.handle_datagram(tag, &payload, from).await,
						None => {
							tracing::debug!("Control datagram channel closed.");
							break;
						},
					}
				},
				command = command_rx.recv() => {
					match command {
						Some(ControlStreamCommand::SetRequestedBitrate(bitrate_bps)) => {
							self.bitrate.set_requested(bitrate_bps);
							self.maybe_retune().await;
						},
						Some(ControlStreamCommand::Disconnect(reason)) => {
							if self.peer.is_some() {
								// Tell the client before unbinding it.
								let mut datagram = tagged_buffer(PacketType::StreamControl, 4);
								StreamControlMessage::Disconnect.serialize(&mut datagram);
								let _ = self.transport.sender().send(PacketClass::Control, datagram).await;
								self.disconnect(reason).await;
							}
						},
						None => break,
					}
				},
				_ = housekeeping.tick() => {
					self.housekeeping(keepalive_interval, timeout).await;
				},
				_ = shutdown.wait_shutdown_triggered() => break,
			}
		}

		tracing::debug!("Control plane stopped.");
	}

	async fn housekeeping(&mut self, keepalive_interval: Duration, timeout: Duration) {
		let (resend_connect, keepalive_due, timed_out) = {
			let Some(peer) = &mut self.peer else {
				return;
			};

			// Unacknowledged CONNECT replies are retransmitted; datagrams
			// get lost and the client cannot proceed without one.
			let resend = if !peer.acknowledged
				&& peer.connect_retries_left > 0
				&& peer.last_connect_sent.elapsed() >= CONNECT_RETRY_INTERVAL
			{
				peer.connect_retries_left -= 1;
				peer.last_connect_sent = Instant::now();
				Some((peer.negotiation, peer.address))
			} else {
				None
			};

			let keepalive_due = peer.last_keepalive_sent.elapsed() >= keepalive_interval;
			if keepalive_due {
				peer.last_keepalive_sent = Instant::now();
			}

			(resend, keepalive_due, peer.last_seen.elapsed() > timeout)
		};

		if let Some((negotiation, address)) = resend_connect {
			self.send_connect(&negotiation, address).await;
		}

		if keepalive_due {
			let mut datagram = tagged_buffer(PacketType::StreamControl, 4);
			StreamControlMessage::Keepalive.serialize(&mut datagram);
			let _ = self.transport.sender().send(PacketClass::Control, datagram).await;
		}

		if timed_out {
			let seconds = timeout.as_secs();
			self.disconnect(format!("no messages for {seconds} seconds")).await;
		}
	}

	async fn handle_datagram(&mut self, tag: PacketType, payload: &[u8], from: SocketAddr) {
		if let Some(peer) = &mut self.peer {
			if from == peer.address {
				peer.last_seen = Instant::now();
				if tag != PacketType::Handshake {
					peer.acknowledged = true;
				}
			}
		}

		match tag {
			PacketType::Handshake => self.handle_handshake(payload, from).await,
			PacketType::TimeSync => self.handle_time_sync(payload, from).await,
			PacketType::StreamControl => self.handle_stream_control(payload).await,
			_ => {},
		}
	}

	async fn handle_handshake(&mut self, payload: &[u8], from: SocketAddr) {
		let message = match HandshakeMessage::parse(payload) {
			Ok(message) => message,
			Err(()) => return,
		};

		let HandshakeMessage::Hello(hello) = message else {
			tracing::trace!("Ignoring non-hello handshake message from {from}.");
			return;
		};

		if let Some(peer) = &mut self.peer {
			let repeat = if peer.address == from {
				// The CONNECT reply got lost; answer the repeat hello.
				tracing::debug!("Repeated hello from {from}, resending connect.");
				peer.connect_retries_left = CONNECT_RETRIES;
				Some(peer.negotiation)
			} else {
				tracing::debug!("Ignoring hello from {from} while {} is connected.", peer.address);
				None
			};
			if let Some(negotiation) = repeat {
				self.send_connect(&negotiation, from).await;
			}
			return;
		}

		if hello.protocol_version != PROTOCOL_VERSION {
			tracing::info!(
				"Client {} speaks protocol {}, we speak {PROTOCOL_VERSION}; refusing.",
				hello.device_name(), hello.protocol_version,
			);
			self.send_handshake_error(HANDSHAKE_ERROR_VERSION, from).await;
			return;
		}

		let Some(codec) = self
			.config
			.video
			.codec_preference
			.iter()
			.map(|&name| CodecKind::from(name))
			.filter(|codec| self.available_codecs.contains(codec))
			.find(|&codec| hello.supported_codecs & codec_bit(codec) != 0)
		else {
			tracing::info!("No common codec with client {}; refusing.", hello.device_name());
			self.send_handshake_error(HANDSHAKE_ERROR_NO_CODEC, from).await;
			return;
		};

		let refresh_rate = self
			.config
			.video
			.refresh_rates
			.iter()
			.copied()
			.find(|&rate| hello.refresh_rates.iter().any(|&offered| (offered - rate).abs() < 0.1))
			.unwrap_or(self.config.video.refresh_rates[0]);

		let (eye_width, eye_height) = compositor::encoded_extent(&self.config.video);
		let negotiation = StreamNegotiation {
			peer: from,
			codec,
			width: eye_width * 2,
			height: eye_height,
			refresh_rate,
			mtu: self.config.video.mtu,
			initial_bitrate_bps: self.config.video.bitrate.initial_bps,
		};

		tracing::info!(
			"Client '{}' connected from {from}: {codec}, {}x{} at {refresh_rate} Hz.",
			hello.device_name(), negotiation.width, negotiation.height,
		);
		if hello.preferred_width != 0 && hello.preferred_width != negotiation.width {
			tracing::debug!(
				"Client preferred {}x{}, streaming configured {}x{}.",
				hello.preferred_width, hello.preferred_height,
				negotiation.width, negotiation.height,
			);
		}

		self.transport.set_peer(Some(from));
		self.transport.set_throttle(throttle_for(negotiation.initial_bitrate_bps));
		self.peer = Some(PeerState {
			address: from,
			negotiation,
			last_seen: Instant::now(),
			last_keepalive_sent: Instant::now(),
			connect_retries_left: CONNECT_RETRIES,
			last_connect_sent: Instant::now(),
			acknowledged: false,
			last_fec_failures: 0,
			last_packets_lost: 0,
		});

		self.send_connect(&negotiation, from).await;
		let _ = self.event_tx.send(ControlEvent::Connected(negotiation)).await;
	}

	async fn send_connect(&self, negotiation: &StreamNegotiation, to: SocketAddr) {
		let connect = ConnectMessage {
			codec: negotiation.codec,
			width: negotiation.width,
			height: negotiation.height,
			refresh_rate: negotiation.refresh_rate,
			mtu: negotiation.mtu as u32,
			initial_bitrate_bps: negotiation.initial_bitrate_bps,
		};
		let mut datagram = tagged_buffer(PacketType::Handshake, 32);
		connect.serialize(&mut datagram);
		let _ = self.transport.sender().send_to(PacketClass::Control, datagram, to).await;
	}

	async fn send_handshake_error(&self, code: u32, to: SocketAddr) {
		let mut datagram = tagged_buffer(PacketType::Handshake, 8);
		datagram.extend(HANDSHAKE_KIND_ERROR.to_le_bytes());
		datagram.extend(code.to_le_bytes());
		let _ = self.transport.sender().send_to(PacketClass::Control, datagram, to).await;
	}

	async fn handle_time_sync(&mut self, payload: &[u8], from: SocketAddr) {
		let Ok(packet) = TimeSyncPacket::parse(payload) else {
			return;
		};

		match packet.mode {
			0 => {
				// Clock probe: stamp our time and echo the client's.
				let reply = TimeSyncPacket {
					mode: 1,
					server_time_us: crate::transport::now_ns() / 1_000,
					client_time_us: packet.client_time_us,
					..Default::default()
				};
				let mut datagram = tagged_buffer(PacketType::TimeSync, TIME_SYNC_SIZE);
				reply.serialize(&mut datagram);
				let _ = self.transport.sender().send_to(PacketClass::Control, datagram, from).await;
			},
			2 => {
				let offset_us = packet.server_time_us as i64 - packet.client_time_us as i64;
				self.time_sync.update(offset_us.saturating_mul(1_000));
				self.ingest_client_report(&packet).await;
			},
			_ => {
				tracing::trace!("Ignoring time sync packet with mode {}.", packet.mode);
			},
		}
	}

	/// The dynamic-parameter input path: observed throughput drives the
	/// bitrate target, FEC failure counters drive parity overhead and
	/// keyframe recovery.
	async fn ingest_client_report(&mut self, packet: &TimeSyncPacket) {
		let Some(peer) = &mut self.peer else {
			return;
		};

		if packet.packets_lost > peer.last_packets_lost {
			tracing::debug!(
				"Client reports {} newly lost packets.",
				packet.packets_lost - peer.last_packets_lost,
			);
			peer.last_packets_lost = packet.packets_lost;
		}

		let new_failures = packet.fec_failures.saturating_sub(peer.last_fec_failures);
		peer.last_fec_failures = packet.fec_failures;
		for _ in 0..new_failures {
			self.stats.record_fec_failure();
			let stepped = self.fec.lock().unwrap().on_fec_failure();
			if stepped {
				self.idr_scheduler.request();
			}
		}
		if new_failures > 0 {
			// An unrecoverable frame leaves the decoder without a valid
			// reference either way.
			self.idr_scheduler.request();
		}

		self.bitrate.on_client_report(packet.observed_throughput_bps);
		self.maybe_retune().await;
	}

	async fn maybe_retune(&mut self) {
		let Some(peer) = &self.peer else {
			return;
		};
		if let Some(bitrate_bps) = self.bitrate.sample() {
			tracing::info!("Retuning stream to {:.2} Mbps.", bitrate_bps as f64 / 1e6);
			self.transport.set_throttle(throttle_for(bitrate_bps));
			// A reconfigured stream restarts from a keyframe, whether or
			// not the backend can retune in place.
			self.idr_scheduler.request();
			let params = DynamicParams {
				updated: true,
				bitrate_bps,
				framerate: peer.negotiation.refresh_rate,
			};
			let _ = self.event_tx.send(ControlEvent::ParamsChanged(params)).await;
		}
	}

	async fn handle_stream_control(&mut self, payload: &[u8]) {
		let Ok(message) = StreamControlMessage::parse(payload) else {
			return;
		};

		match message {
			StreamControlMessage::RequestIdr => {
				tracing::debug!("Client requested an IDR frame.");
				self.idr_scheduler.request();
			},
			StreamControlMessage::PacketLoss { begin_seq, end_seq } => {
				tracing::debug!("Client reports shard loss in [{begin_seq}, {end_seq}].");
			},
			StreamControlMessage::Keepalive => {},
			StreamControlMessage::StreamReady => {
				tracing::debug!("Client is ready for stream data.");
				let _ = self.event_tx.send(ControlEvent::Ready).await;
			},
			StreamControlMessage::Disconnect => {
				self.disconnect("client requested disconnect".to_string()).await;
			},
		}
	}

	async fn disconnect(&mut self, reason: String) {
		tracing::info!("Client disconnected: {reason}.");
		self.peer = None;
		self.transport.set_peer(None);
		self.transport.set_throttle(0);
		self.pose_history.clear();
		let _ = self.event_tx.send(ControlEvent::Disconnected(reason)).await;
	}
}

fn throttle_for(bitrate_bps: u64) -> u64 {
	bitrate_bps * 12 / 10 + AUDIO_BPS
}

#[cfg(test)]
mod tests {
	use super::*;

	fn hello() -> HelloMessage {
		let mut device_name = [0u8; 32];
		device_name[..7].copy_from_slice(b"Headset");
		HelloMessage {
			protocol_version: PROTOCOL_VERSION,
			device_name,
			supported_codecs: codec_bit(CodecKind::H264) | codec_bit(CodecKind::Hevc),
			preferred_width: 3840,
			preferred_height: 1080,
			refresh_rates: [72.0, 90.0, 0.0, 0.0],
		}
	}

	#[test]
	fn hello_round_trip() {
		let message = hello();
		let mut buffer = Vec::new();
		message.serialize(&mut buffer);
		let parsed = HandshakeMessage::parse(&buffer).unwrap();
		assert_eq!(parsed, HandshakeMessage::Hello(message.clone()));
		assert_eq!(message.device_name(), "Headset");
	}

	#[test]
	fn connect_round_trip() {
		let message = ConnectMessage {
			codec: CodecKind::H264,
			width: 3840,
			height: 1080,
			refresh_rate: 72.0,
			mtu: 1442,
			initial_bitrate_bps: 30_000_000,
		};
		let mut buffer = Vec::new();
		message.serialize(&mut buffer);
		assert_eq!(HandshakeMessage::parse(&buffer).unwrap(), HandshakeMessage::Connect(message));
	}

	#[test]
	fn time_sync_round_trip() {
		let packet = TimeSyncPacket {
			mode: 2,
			server_time_us: 10,
			client_time_us: 20,
			observed_throughput_bps: 42_000_000,
			packets_lost: 3,
			fec_failures: 1,
		};
		let mut buffer = Vec::new();
		packet.serialize(&mut buffer);
		assert_eq!(buffer.len(), TIME_SYNC_SIZE);
		assert_eq!(TimeSyncPacket::parse(&buffer).unwrap(), packet);
	}

	#[test]
	fn stream_control_round_trips() {
		for message in [
			StreamControlMessage::RequestIdr,
			StreamControlMessage::PacketLoss { begin_seq: 5, end_seq: 9 },
			StreamControlMessage::Keepalive,
			StreamControlMessage::Disconnect,
			StreamControlMessage::StreamReady,
		] {
			let mut buffer = Vec::new();
			message.serialize(&mut buffer);
			assert_eq!(StreamControlMessage::parse(&buffer).unwrap(), message);
		}
	}

	#[test]
	fn short_messages_are_rejected() {
		assert!(HandshakeMessage::parse(&[1, 0]).is_err());
		assert!(TimeSyncPacket::parse(&[0u8; 10]).is_err());
		assert!(StreamControlMessage::parse(&[]).is_err());
	}

	#[test]
	fn time_offset_is_smoothed_and_applied() {
		let estimator = TimeSyncEstimator::new();
		estimator.update(1_000_000);
		assert_eq!(estimator.client_to_server_time_ns(0), 1_000_000);
		assert_eq!(estimator.server_to_client_time_ns(1_000_000), 0);

		// New observations move the estimate an eighth of the way.
		estimator.update(9_000_000);
		assert_eq!(estimator.client_to_server_time_ns(0), 2_000_000);
	}

	#[test]
	fn throttle_budget_includes_audio() {
		assert_eq!(throttle_for(30_000_000), 36_000_000 + AUDIO_BPS);
	}

	mod handshake {
		use tokio::net::UdpSocket;

		use crate::transport::TransportDispatch;

		use super::super::*;
		use super::hello;

		struct Harness {
			transport: Arc<Transport>,
			control_tx: mpsc::Sender<ControlDatagram>,
			event_rx: mpsc::Receiver<ControlEvent>,
			scheduler: Arc<IdrScheduler>,
			control: ControlStream,
			_shutdown: ShutdownManager<i32>,
		}

		async fn harness() -> Harness {
			let config = Config::default();
			let shutdown = ShutdownManager::new();
			let (tracking_tx, _tracking_rx) = mpsc::channel(4);
			let (dispatch_tx, control_rx) = mpsc::channel(16);
			let transport = Arc::new(
				Transport::bind(
					"127.0.0.1",
					0,
					None,
					TransportDispatch { tracking_tx, control_tx: dispatch_tx.clone() },
					Arc::new(SessionStats::new()),
					shutdown.clone(),
				)
				.await
				.unwrap(),
			);

			let scheduler = Arc::new(IdrScheduler::new(72.0));
			let (event_tx, event_rx) = mpsc::channel(16);
			let control = ControlStream::new(
				config.clone(),
				transport.clone(),
				vec![CodecKind::H264],
				control_rx,
				event_tx,
				scheduler.clone(),
				Arc::new(Mutex::new(FecController::new(&config.video.fec))),
				Arc::new(PoseHistory::new(16)),
				Arc::new(TimeSyncEstimator::new()),
				Arc::new(SessionStats::new()),
				shutdown.clone(),
			);

			Harness {
				transport,
				control_tx: dispatch_tx,
				event_rx,
				scheduler,
				control,
				_shutdown: shutdown,
			}
		}

		async fn recv_handshake(client: &UdpSocket) -> HandshakeMessage {
			let mut buffer = [0u8; 256];
			let (length, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buffer))
				.await
				.unwrap()
				.unwrap();
			let (tag, payload) = crate::session::stream::split_tag(&buffer[..length]).unwrap();
			assert_eq!(tag, PacketType::Handshake);
			HandshakeMessage::parse(payload).unwrap()
		}

		#[tokio::test]
		async fn valid_hello_gets_a_connect_and_binds_the_peer() {
			let mut harness = harness().await;
			let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
			let client_addr = client.local_addr().unwrap();

			let mut payload = Vec::new();
			hello().serialize(&mut payload);
			harness.control_tx.send((PacketType::Handshake, payload, client_addr)).await.unwrap();

			let reply = recv_handshake(&client).await;
			let HandshakeMessage::Connect(connect) = reply else {
				panic!("expected a connect reply, got {reply:?}");
			};
			assert_eq!(connect.codec, CodecKind::H264);
			assert_eq!(connect.mtu, 1442);
			assert_eq!(connect.width, 3840);

			let event = harness.event_rx.recv().await.unwrap();
			assert!(matches!(event, ControlEvent::Connected(negotiation) if negotiation.peer == client_addr));
			assert_eq!(harness.transport.peer(), Some(client_addr));
		}

		#[tokio::test]
		async fn version_mismatch_is_refused() {
			let mut harness = harness().await;
			let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
			let client_addr = client.local_addr().unwrap();

			let mut bad_hello = hello();
			bad_hello.protocol_version = PROTOCOL_VERSION + 1;
			let mut payload = Vec::new();
			bad_hello.serialize(&mut payload);
			harness.control_tx.send((PacketType::Handshake, payload, client_addr)).await.unwrap();

			let reply = recv_handshake(&client).await;
			assert_eq!(reply, HandshakeMessage::Error(HANDSHAKE_ERROR_VERSION));
			// The connection was dropped, not bound.
			assert_eq!(harness.transport.peer(), None);
			assert!(harness.event_rx.try_recv().is_err());
		}

		#[tokio::test]
		async fn bitrate_reconfiguration_schedules_an_idr() {
			let mut harness = harness().await;
			let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
			let client_addr = client.local_addr().unwrap();

			let mut payload = Vec::new();
			hello().serialize(&mut payload);
			harness.control_tx.send((PacketType::Handshake, payload, client_addr)).await.unwrap();
			let event = harness.event_rx.recv().await.unwrap();
			assert!(matches!(event, ControlEvent::Connected(_)));

			harness.control.set_requested_bitrate(60_000_000).await.unwrap();

			let event = harness.event_rx.recv().await.unwrap();
			let ControlEvent::ParamsChanged(params) = event else {
				panic!("expected a params change, got {event:?}");
			};
			assert!(params.updated);
			assert_eq!(params.bitrate_bps, 60_000_000);
			// The keyframe request must come from the control plane itself,
			// not from a backend that happens to need a rebuild.
			assert!(harness.scheduler.take_due());
		}

		#[tokio::test]
		async fn no_common_codec_is_refused() {
			let mut harness = harness().await;
			let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
			let client_addr = client.local_addr().unwrap();

			let mut av1_only = hello();
			av1_only.supported_codecs = codec_bit(CodecKind::Av1);
			let mut payload = Vec::new();
			av1_only.serialize(&mut payload);
			harness.control_tx.send((PacketType::Handshake, payload, client_addr)).await.unwrap();

			let reply = recv_handshake(&client).await;
			assert_eq!(reply, HandshakeMessage::Error(HANDSHAKE_ERROR_NO_CODEC));
			assert!(harness.event_rx.try_recv().is_err());
		}

		#[tokio::test]
		async fn idr_request_reaches_the_scheduler() {
			let config = Config::default();
			let shutdown = ShutdownManager::new();
			let (tracking_tx, _tracking_rx) = mpsc::channel(4);
			let (control_tx, control_rx) = mpsc::channel(16);
			let transport = Arc::new(
				Transport::bind(
					"127.0.0.1",
					0,
					None,
					TransportDispatch { tracking_tx, control_tx: control_tx.clone() },
					Arc::new(SessionStats::new()),
					shutdown.clone(),
				)
				.await
				.unwrap(),
			);
			let scheduler = Arc::new(IdrScheduler::new(1000.0));
			let (event_tx, _event_rx) = mpsc::channel(16);
			let _control = ControlStream::new(
				config.clone(),
				transport,
				vec![CodecKind::H264],
				control_rx,
				event_tx,
				scheduler.clone(),
				Arc::new(Mutex::new(FecController::new(&config.video.fec))),
				Arc::new(PoseHistory::new(16)),
				Arc::new(TimeSyncEstimator::new()),
				Arc::new(SessionStats::new()),
				shutdown,
			);

			let from: SocketAddr = "127.0.0.1:9".parse().unwrap();
			let mut payload = Vec::new();
			StreamControlMessage::RequestIdr.serialize(&mut payload);
			control_tx.send((PacketType::StreamControl, payload, from)).await.unwrap();

			tokio::time::timeout(Duration::from_secs(1), async {
				while !scheduler.take_due() {
					tokio::time::sleep(Duration::from_millis(5)).await;
				}
			})
			.await
			.unwrap();
		}
	}
}
