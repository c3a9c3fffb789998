use std::collections::VecDeque;

/// Length of one throttling window in microseconds.
pub const TIME_SLOT_US: u64 = 1_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketClass {
	Video,
	Audio,
	Control,
}

#[derive(Clone, Debug)]
pub struct QueuedPacket {
	pub class: PacketClass,
	pub data: Vec<u8>,
	/// Explicit target, for control replies to peers that are not bound
	/// yet. Everything else goes to the legitimate peer.
	pub destination: Option<std::net::SocketAddr>,
}

/// On-wire byte budget per time slot. Packets beyond the budget wait;
/// when the queue itself overflows, the oldest video packet goes first
/// and audio or control packets are never sacrificed.
pub struct ThrottlingQueue {
	queue: VecDeque<QueuedPacket>,
	buffered_bytes: usize,
	capacity_bytes: usize,
	throttle_bps: u64,
	packet_limit_per_slot: Option<usize>,

	current_slot: u64,
	slot_bytes_sent: usize,
	slot_packets_sent: usize,
	dropped_packets: u64,
}

impl ThrottlingQueue {
	pub fn new(capacity_bytes: usize, packet_limit_per_slot: Option<usize>) -> Self {
		Self {
			queue: VecDeque::new(),
			buffered_bytes: 0,
			capacity_bytes,
			throttle_bps: 0,
			packet_limit_per_slot,
			current_slot: 0,
			slot_bytes_sent: 0,
			slot_packets_sent: 0,
			dropped_packets: 0,
		}
	}

	/// Sets the throttle rate in bits per second. Zero disables the
	/// budget entirely.
	pub fn set_rate(&mut self, throttle_bps: u64) {
		self.throttle_bps = throttle_bps;
	}

	pub fn push(&mut self, packet: QueuedPacket) {
		self.buffered_bytes += packet.data.len();
		self.queue.push_back(packet);

		while self.buffered_bytes > self.capacity_bytes {
			let Some(position) = self.queue.iter().position(|queued| queued.class == PacketClass::Video) else {
				// Nothing expendable; audio and control ride out the burst.
				break;
			};
			let dropped = self.queue.remove(position).unwrap();
			self.buffered_bytes -= dropped.data.len();
			self.dropped_packets += 1;
			tracing::trace!("Throttling queue over capacity, dropped a video packet.");
		}
	}

	/// Pops the next packet if the current slot's budget allows it.
	pub fn pop_sendable(&mut self, now_us: u64) -> Option<QueuedPacket> {
		if !self.can_send(now_us) {
			return None;
		}

		let packet = self.queue.pop_front()?;
		self.buffered_bytes -= packet.data.len();
		self.slot_bytes_sent += packet.data.len();
		self.slot_packets_sent += 1;
		Some(packet)
	}

	fn can_send(&mut self, now_us: u64) -> bool {
		let Some(front) = self.queue.front() else {
			return false;
		};

		if self.throttle_bps == 0 {
			return true;
		}

		let slot = now_us / TIME_SLOT_US;
		if slot != self.current_slot {
			self.current_slot = slot;
			self.slot_bytes_sent = 0;
			self.slot_packets_sent = 0;
		}

		if let Some(limit) = self.packet_limit_per_slot {
			if self.slot_packets_sent >= limit {
				return false;
			}
		}

		let bytes_per_slot = (self.throttle_bps / 8 / (1_000_000 / TIME_SLOT_US)) as usize;
		// A packet larger than the whole slot budget still leaves, one
		// slot at a time, or it would starve forever.
		if self.slot_bytes_sent == 0 && front.data.len() >= bytes_per_slot {
			return true;
		}

		self.slot_bytes_sent + front.data.len() <= bytes_per_slot
	}

	pub fn is_empty(&self) -> bool {
		self.queue.is_empty()
	}

	pub fn buffered_bytes(&self) -> usize {
		self.buffered_bytes
	}

	pub fn dropped_packets(&self) -> u64 {
		self.dropped_packets
	}
}
