use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_shutdown::ShutdownManager;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::error::Error;
use crate::session::stream::{split_tag, PacketType};
use crate::stats::SessionStats;

pub use self::throttle::{PacketClass, QueuedPacket, ThrottlingQueue, TIME_SLOT_US};

pub mod throttle;

/// Bytes the throttling queue may buffer before it sheds video packets.
const QUEUE_CAPACITY_BYTES: usize = 4 << 20;

/// Offset of `sent_time_ns` inside a video datagram: the type tag plus
/// packet counter, tracking index and video index.
const SENT_TIME_OFFSET: usize = 4 + 4 + 8 + 8;

/// A control-plane bound datagram along with where it came from.
pub type ControlDatagram = (PacketType, Vec<u8>, SocketAddr);

/// Channels the receive loop dispatches into, by packet type.
pub struct TransportDispatch {
	pub tracking_tx: mpsc::Sender<Vec<u8>>,
	pub control_tx: mpsc::Sender<ControlDatagram>,
}

/// Wall-clock nanoseconds, the timestamp base shared with clients.
pub fn now_ns() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|elapsed| elapsed.as_nanos() as u64)
		.unwrap_or(0)
}

/// Single-socket datagram transport: one send task draining a throttled
/// queue, one receive task dispatching by type tag, and a
/// legitimate-peer filter bound by the control plane after a completed
/// handshake.
pub struct Transport {
	packet_tx: mpsc::Sender<QueuedPacket>,
	peer_tx: watch::Sender<Option<SocketAddr>>,
	throttle_bps: Arc<AtomicU64>,
	local_addr: SocketAddr,
}

impl Transport {
	pub async fn bind(
		address: &str,
		port: u16,
		packet_limit_per_slot: Option<usize>,
		dispatch: TransportDispatch,
		stats: Arc<SessionStats>,
		shutdown: ShutdownManager<i32>,
	) -> Result<Self, Error> {
		let socket = Arc::new(UdpSocket::bind((address, port)).await?);
		let local_addr = socket.local_addr()?;
		tracing::info!("Streaming socket bound on {local_addr}.");

		let (packet_tx, packet_rx) = mpsc::channel(1024);
		let (peer_tx, peer_rx) = watch::channel(None);
		let throttle_bps = Arc::new(AtomicU64::new(0));

		tokio::spawn(run_send_loop(
			socket.clone(),
			packet_rx,
			peer_rx.clone(),
			throttle_bps.clone(),
			packet_limit_per_slot,
			stats.clone(),
			shutdown.clone(),
		));
		tokio::spawn(run_recv_loop(socket, dispatch, peer_rx, stats, shutdown));

		Ok(Self { packet_tx, peer_tx, throttle_bps, local_addr })
	}

	pub fn local_addr(&self) -> SocketAddr {
		self.local_addr
	}

	pub fn sender(&self) -> TransportSender {
		TransportSender { packet_tx: self.packet_tx.clone() }
	}

	/// Binds the legitimate peer after a completed handshake, or clears
	/// it on disconnect. Everything from other peers is discarded.
	pub fn set_peer(&self, peer: Option<SocketAddr>) {
		self.peer_tx.send_replace(peer);
	}

	pub fn peer(&self) -> Option<SocketAddr> {
		*self.peer_tx.borrow()
	}

	/// Updates the on-wire byte budget. Zero disables throttling.
	pub fn set_throttle(&self, bps: u64) {
		self.throttle_bps.store(bps, Ordering::Relaxed);
	}
}

/// Cloneable handle for enqueueing outgoing datagrams.
#[derive(Clone)]
pub struct TransportSender {
	packet_tx: mpsc::Sender<QueuedPacket>,
}

impl TransportSender {
	pub async fn send(&self, class: PacketClass, data: Vec<u8>) -> Result<(), ()> {
		self.packet_tx.send(QueuedPacket { class, data, destination: None }).await
			.map_err(|_| tracing::debug!("Transport send channel closed."))
	}

	/// Control replies that must reach a peer before it is bound.
	pub async fn send_to(&self, class: PacketClass, data: Vec<u8>, destination: SocketAddr) -> Result<(), ()> {
		self.packet_tx.send(QueuedPacket { class, data, destination: Some(destination) }).await
			.map_err(|_| tracing::debug!("Transport send channel closed."))
	}

	/// For the blocking encoder and packetizer thread.
	pub fn blocking_send(&self, class: PacketClass, data: Vec<u8>) -> Result<(), ()> {
		self.packet_tx.blocking_send(QueuedPacket { class, data, destination: None })
			.map_err(|_| tracing::debug!("Transport send channel closed."))
	}
}

async fn run_send_loop(
	socket: Arc<UdpSocket>,
	mut packet_rx: mpsc::Receiver<QueuedPacket>,
	peer_rx: watch::Receiver<Option<SocketAddr>>,
	throttle_bps: Arc<AtomicU64>,
	packet_limit_per_slot: Option<usize>,
	stats: Arc<SessionStats>,
	shutdown: ShutdownManager<i32>,
) {
	let _delay_stop = shutdown.delay_shutdown_token();

	let mut queue = ThrottlingQueue::new(QUEUE_CAPACITY_BYTES, packet_limit_per_slot);
	let mut reported_drops = 0u64;
	let started = Instant::now();
	let mut interval = tokio::time::interval(Duration::from_micros(TIME_SLOT_US));

	loop {
		tokio::select! {
			packet = packet_rx.recv() => {
				match packet {
					Some(packet) => queue.push(packet),
					None => {
						tracing::debug!("Transport packet channel closed.");
						break;
					},
				}
			},
			_ = interval.tick() => {},
			_ = shutdown.wait_shutdown_triggered() => break,
		}

		queue.set_rate(throttle_bps.load(Ordering::Relaxed));
		let now_us = started.elapsed().as_micros() as u64;
		while let Some(mut packet) = queue.pop_sendable(now_us) {
			let target = packet.destination.or(*peer_rx.borrow());
			let Some(peer) = target else {
				// No legitimate client; the queue must not back up.
				continue;
			};

			if packet.class == PacketClass::Video && packet.data.len() >= SENT_TIME_OFFSET + 8 {
				// Stamp emission time, after the throttling delay.
				packet.data[SENT_TIME_OFFSET..SENT_TIME_OFFSET + 8]
					.copy_from_slice(&now_ns().to_le_bytes());
			}

			match socket.send_to(&packet.data, peer).await {
				Ok(_) => match packet.class {
					PacketClass::Video => stats.record_video_packet(packet.data.len()),
					PacketClass::Audio => stats.record_audio_packet(packet.data.len()),
					PacketClass::Control => {},
				},
				Err(e) => {
					tracing::warn!("Failed to send packet to {peer}: {e}");
				},
			}
		}

		let dropped = queue.dropped_packets();
		while reported_drops < dropped {
			stats.record_packet_dropped();
			reported_drops += 1;
		}
	}

	tracing::debug!("Transport send loop stopped.");
}

async fn run_recv_loop(
	socket: Arc<UdpSocket>,
	dispatch: TransportDispatch,
	peer_rx: watch::Receiver<Option<SocketAddr>>,
	_stats: Arc<SessionStats>,
	shutdown: ShutdownManager<i32>,
) {
	let _delay_stop = shutdown.delay_shutdown_token();

	let mut buffer = vec![0u8; 65_536];
	loop {
		let (length, peer) = tokio::select! {
			received = socket.recv_from(&mut buffer) => {
				match received {
					Ok(received) => received,
					Err(e) => {
						tracing::warn!("Failed to receive datagram: {e}");
						continue;
					},
				}
			},
			_ = shutdown.wait_shutdown_triggered() => break,
		};

		let Ok((tag, payload)) = split_tag(&buffer[..length]) else {
			tracing::trace!("Discarding unparseable {length} byte datagram from {peer}.");
			continue;
		};

		// Handshakes may come from anyone; everything else only from the
		// bound peer.
		if tag != PacketType::Handshake {
			let bound = *peer_rx.borrow();
			if bound != Some(peer) {
				tracing::trace!("Discarding {tag:?} datagram from non-legitimate peer {peer}.");
				continue;
			}
		}

		match tag {
			PacketType::Tracking => {
				// Tracking is latest-wins; a full channel just sheds.
				let _ = dispatch.tracking_tx.try_send(payload.to_vec());
			},
			PacketType::TimeSync | PacketType::Handshake | PacketType::StreamControl => {
				if dispatch.control_tx.send((tag, payload.to_vec(), peer)).await.is_err() {
					tracing::debug!("Control channel closed, stopping receive loop.");
					break;
				}
			},
			PacketType::Video | PacketType::Audio | PacketType::Haptics => {
				tracing::warn!("Received server-bound {tag:?} packet from {peer}, ignoring.");
			},
		}
	}

	tracing::debug!("Transport receive loop stopped.");
}
