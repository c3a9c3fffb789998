use std::collections::{hash_map::Entry, HashMap};

use reed_solomon_erasure::{galois_8, ReedSolomon};

use crate::session::stream::{tagged_buffer, PacketType};

use super::encoder::FramePacket;

/// Maximum number of Reed-Solomon shards (data + parity) per frame, the
/// GF(2^8) code length limit.
pub const MAX_SHARDS: usize = 255;

/// Wire header carried by every video shard, after the packet type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoFrameHeader {
	pub packet_counter: u32,
	pub tracking_frame_index: u64,
	pub video_frame_index: u64,
	pub sent_time_ns: u64,
	pub frame_byte_size: u32,
	pub fec_index: u32,
	pub fec_percentage: u16,
}

pub const VIDEO_FRAME_HEADER_SIZE: usize = 38;

/// Tag plus header: the bytes of a video datagram that are not payload.
pub const VIDEO_WIRE_OVERHEAD: usize = 4 + VIDEO_FRAME_HEADER_SIZE;

impl VideoFrameHeader {
	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend(self.packet_counter.to_le_bytes());
		buffer.extend(self.tracking_frame_index.to_le_bytes());
		buffer.extend(self.video_frame_index.to_le_bytes());
		buffer.extend(self.sent_time_ns.to_le_bytes());
		buffer.extend(self.frame_byte_size.to_le_bytes());
		buffer.extend(self.fec_index.to_le_bytes());
		buffer.extend(self.fec_percentage.to_le_bytes());
	}

	pub fn parse(buffer: &[u8]) -> Result<(Self, &[u8]), ()> {
		if buffer.len() < VIDEO_FRAME_HEADER_SIZE {
			tracing::warn!("Video packet too short: {} bytes.", buffer.len());
			return Err(());
		}

		let header = Self {
			packet_counter: u32::from_le_bytes(buffer[0..4].try_into().unwrap()),
			tracking_frame_index: u64::from_le_bytes(buffer[4..12].try_into().unwrap()),
			video_frame_index: u64::from_le_bytes(buffer[12..20].try_into().unwrap()),
			sent_time_ns: u64::from_le_bytes(buffer[20..28].try_into().unwrap()),
			frame_byte_size: u32::from_le_bytes(buffer[28..32].try_into().unwrap()),
			fec_index: u32::from_le_bytes(buffer[32..36].try_into().unwrap()),
			fec_percentage: u16::from_le_bytes(buffer[36..38].try_into().unwrap()),
		};

		Ok((header, &buffer[VIDEO_FRAME_HEADER_SIZE..]))
	}
}

/// The shard geometry of one frame. Both ends derive this from the frame
/// byte size and the negotiated payload size, so it never travels on the
/// wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardLayout {
	/// Wire packets per Reed-Solomon shard. 1 until a frame is so large
	/// that 255 single-packet shards cannot cover it.
	pub packets_per_shard: usize,
	pub data_shards: usize,
	pub parity_shards: usize,
	pub payload_size: usize,
}

impl ShardLayout {
	pub fn compute(frame_byte_size: usize, payload_size: usize, fec_percentage: u16) -> Option<Self> {
		if frame_byte_size == 0 || payload_size == 0 || fec_percentage > 100 {
			return None;
		}

		let data_packets = frame_byte_size.div_ceil(payload_size);
		let mut packets_per_shard = 1;
		loop {
			let data_shards = data_packets.div_ceil(packets_per_shard);
			let parity_shards = parity_for(data_shards, fec_percentage);
			if data_shards + parity_shards <= MAX_SHARDS {
				return Some(Self { packets_per_shard, data_shards, parity_shards, payload_size });
			}
			packets_per_shard += 1;
		}
	}

	pub fn shard_size(&self) -> usize {
		self.packets_per_shard * self.payload_size
	}

	pub fn total_shards(&self) -> usize {
		self.data_shards + self.parity_shards
	}

	pub fn total_packets(&self) -> usize {
		self.total_shards() * self.packets_per_shard
	}
}

fn parity_for(data_shards: usize, fec_percentage: u16) -> usize {
	if fec_percentage == 0 || data_shards == 0 {
		return 0;
	}
	(data_shards * fec_percentage as usize).div_ceil(100).max(1)
}

/// Slices encoded frames into MTU-sized shards, adds Reed-Solomon parity
/// and emits ready-to-send datagrams in fec_index order.
pub struct Packetizer {
	fec_encoders: HashMap<(usize, usize), ReedSolomon<galois_8::Field>>,
	packet_counter: u32,
	video_frame_index: u64,
}

impl Packetizer {
	pub fn new() -> Self {
		Self {
			fec_encoders: HashMap::new(),
			packet_counter: 0,
			video_frame_index: 0,
		}
	}

	/// Emits one frame as datagrams. A malformed (empty) frame yields no
	/// packets; the packetizer itself does not fail.
	pub fn packetize(
		&mut self,
		frame: &FramePacket,
		payload_size: usize,
		fec_percentage: u16,
		sent_time_ns: u64,
	) -> Result<Vec<Vec<u8>>, ()> {
		let Some(layout) = ShardLayout::compute(frame.data.len(), payload_size, fec_percentage) else {
			tracing::warn!("Dropping malformed frame of {} bytes.", frame.data.len());
			return Ok(Vec::new());
		};

		self.video_frame_index += 1;
		tracing::trace!(
			"Packetizing frame {}: {} bytes, {} data + {} parity shards of {} packets.",
			self.video_frame_index, frame.data.len(),
			layout.data_shards, layout.parity_shards, layout.packets_per_shard,
		);

		// Data region, zero padded to whole shards.
		let shard_size = layout.shard_size();
		let mut shards: Vec<Vec<u8>> = Vec::with_capacity(layout.total_shards());
		for index in 0..layout.data_shards {
			let begin = index * shard_size;
			let end = ((index + 1) * shard_size).min(frame.data.len());
			let mut shard = vec![0u8; shard_size];
			if begin < frame.data.len() {
				shard[..end - begin].copy_from_slice(&frame.data[begin..end]);
			}
			shards.push(shard);
		}
		for _ in 0..layout.parity_shards {
			shards.push(vec![0u8; shard_size]);
		}

		if layout.parity_shards > 0 {
			let encoder = self.fec_encoder(layout.data_shards, layout.parity_shards)?;
			encoder.encode(&mut shards)
				.map_err(|e| tracing::error!("Failed to encode parity shards: {e}"))?;
		}

		let mut datagrams = Vec::with_capacity(layout.total_packets());
		for (packet_index, payload) in shards
			.iter()
			.flat_map(|shard| shard.chunks_exact(payload_size))
			.enumerate()
		{
			let header = VideoFrameHeader {
				packet_counter: self.packet_counter,
				tracking_frame_index: frame.tracking_frame_index,
				video_frame_index: self.video_frame_index,
				sent_time_ns,
				frame_byte_size: frame.data.len() as u32,
				fec_index: packet_index as u32,
				fec_percentage,
			};
			self.packet_counter = self.packet_counter.wrapping_add(1);

			let mut datagram = tagged_buffer(PacketType::Video, VIDEO_FRAME_HEADER_SIZE + payload_size);
			header.serialize(&mut datagram);
			datagram.extend_from_slice(payload);
			datagrams.push(datagram);
		}

		Ok(datagrams)
	}

	fn fec_encoder(
		&mut self,
		data_shards: usize,
		parity_shards: usize,
	) -> Result<&mut ReedSolomon<galois_8::Field>, ()> {
		Ok(match self.fec_encoders.entry((data_shards, parity_shards)) {
			Entry::Occupied(e) => e.into_mut(),
			Entry::Vacant(e) => {
				e.insert(ReedSolomon::<galois_8::Field>::new(data_shards, parity_shards)
					.map_err(|e| tracing::error!("Couldn't create error correction encoder: {e}"))?)
			},
		})
	}
}

impl Default for Packetizer {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashSet;

	use crate::session::stream::split_tag;

	use super::*;

	fn frame(size: usize) -> FramePacket {
		FramePacket {
			data: (0..size).map(|i| (i % 251) as u8).collect(),
			pts_ns: 1_000,
			tracking_frame_index: 42,
			is_idr: false,
		}
	}

	fn parse_all(datagrams: &[Vec<u8>]) -> Vec<(VideoFrameHeader, Vec<u8>)> {
		datagrams
			.iter()
			.map(|datagram| {
				let (tag, payload) = split_tag(datagram).unwrap();
				assert_eq!(tag, PacketType::Video);
				let (header, shard) = VideoFrameHeader::parse(payload).unwrap();
				(header, shard.to_vec())
			})
			.collect()
	}

	#[test]
	fn header_round_trip() {
		let header = VideoFrameHeader {
			packet_counter: 9,
			tracking_frame_index: 77,
			video_frame_index: 5,
			sent_time_ns: 123_456,
			frame_byte_size: 50_000,
			fec_index: 3,
			fec_percentage: 10,
		};
		let mut buffer = Vec::new();
		header.serialize(&mut buffer);
		assert_eq!(buffer.len(), VIDEO_FRAME_HEADER_SIZE);
		let (parsed, rest) = VideoFrameHeader::parse(&buffer).unwrap();
		assert_eq!(parsed, header);
		assert!(rest.is_empty());
	}

	#[test]
	fn fifty_kilobytes_at_ten_percent_is_36_plus_4() {
		let layout = ShardLayout::compute(50_000, 1_400, 10).unwrap();
		assert_eq!(layout.packets_per_shard, 1);
		assert_eq!(layout.data_shards, 36);
		assert_eq!(layout.parity_shards, 4);
	}

	#[test]
	fn huge_frames_group_packets_into_shards() {
		let layout = ShardLayout::compute(4 * 1024 * 1024, 1_400, 50).unwrap();
		assert!(layout.total_shards() <= MAX_SHARDS);
		assert!(layout.packets_per_shard > 1);
		// Every data byte is covered.
		assert!(layout.data_shards * layout.shard_size() >= 4 * 1024 * 1024);
	}

	#[test]
	fn zero_fec_has_no_parity() {
		let layout = ShardLayout::compute(10_000, 1_400, 0).unwrap();
		assert_eq!(layout.parity_shards, 0);
	}

	#[test]
	fn tiny_frame_with_fec_gets_at_least_one_parity_shard() {
		let layout = ShardLayout::compute(10, 1_400, 1).unwrap();
		assert_eq!(layout.data_shards, 1);
		assert_eq!(layout.parity_shards, 1);
	}

	#[test]
	fn shard_invariants_hold() {
		let mut packetizer = Packetizer::new();
		let datagrams = packetizer.packetize(&frame(50_000), 1_400, 10, 999).unwrap();
		let packets = parse_all(&datagrams);
		assert_eq!(packets.len(), 40);

		let indices: HashSet<u32> = packets.iter().map(|(header, _)| header.fec_index).collect();
		assert_eq!(indices, (0..40u32).collect());

		for (header, shard) in &packets {
			assert_eq!(header.video_frame_index, 1);
			assert_eq!(header.frame_byte_size, 50_000);
			assert_eq!(header.fec_percentage, 10);
			assert_eq!(header.tracking_frame_index, 42);
			assert_eq!(header.sent_time_ns, 999);
			assert_eq!(shard.len(), 1_400);
		}

		// Emission order is ascending fec_index.
		let ordered: Vec<u32> = packets.iter().map(|(header, _)| header.fec_index).collect();
		assert!(ordered.windows(2).all(|pair| pair[0] < pair[1]));
	}

	#[test]
	fn video_frame_index_is_strictly_increasing() {
		let mut packetizer = Packetizer::new();
		let mut last_index = 0;
		for _ in 0..5 {
			let datagrams = packetizer.packetize(&frame(3_000), 1_400, 5, 0).unwrap();
			let packets = parse_all(&datagrams);
			let index = packets[0].0.video_frame_index;
			assert!(index > last_index);
			last_index = index;
		}
	}

	#[test]
	fn packet_counter_spans_frames() {
		let mut packetizer = Packetizer::new();
		let first = parse_all(&packetizer.packetize(&frame(3_000), 1_400, 0, 0).unwrap());
		let second = parse_all(&packetizer.packetize(&frame(3_000), 1_400, 0, 0).unwrap());
		let last_of_first = first.last().unwrap().0.packet_counter;
		assert_eq!(second[0].0.packet_counter, last_of_first + 1);
	}

	#[test]
	fn empty_frame_is_dropped() {
		let mut packetizer = Packetizer::new();
		assert!(packetizer.packetize(&frame(0), 1_400, 10, 0).unwrap().is_empty());
	}

	#[test]
	fn data_shards_carry_the_frame_bytes_in_order() {
		let mut packetizer = Packetizer::new();
		let source = frame(3_000);
		let datagrams = packetizer.packetize(&source, 1_400, 10, 0).unwrap();
		let packets = parse_all(&datagrams);

		let mut reassembled = Vec::new();
		for (_, shard) in packets.iter().take(3) {
			reassembled.extend_from_slice(shard);
		}
		reassembled.truncate(3_000);
		assert_eq!(reassembled, source.data);
	}
}
