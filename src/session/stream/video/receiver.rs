use std::collections::{hash_map::Entry, BTreeMap, HashMap};

use reed_solomon_erasure::{galois_8, ReedSolomon};

use super::packetizer::{ShardLayout, VideoFrameHeader};

/// Frames kept in flight at once. Shards of older or newer frames than
/// the window allows are discarded.
const FRAME_WINDOW: usize = 4;

/// One reassembled video frame, in emission order.
#[derive(Clone, Debug)]
pub struct ReassembledFrame {
	pub video_frame_index: u64,
	pub tracking_frame_index: u64,
	pub sent_time_ns: u64,
	pub data: Vec<u8>,
}

struct FrameAccumulator {
	layout: ShardLayout,
	tracking_frame_index: u64,
	sent_time_ns: u64,
	frame_byte_size: usize,
	packets: Vec<Option<Vec<u8>>>,
}

impl FrameAccumulator {
	fn new(header: &VideoFrameHeader, layout: ShardLayout) -> Self {
		Self {
			layout,
			tracking_frame_index: header.tracking_frame_index,
			sent_time_ns: header.sent_time_ns,
			frame_byte_size: header.frame_byte_size as usize,
			packets: vec![None; layout.total_packets()],
		}
	}

	fn insert(&mut self, fec_index: usize, payload: &[u8]) {
		if fec_index >= self.packets.len() || payload.len() != self.layout.payload_size {
			tracing::warn!(
				"Inconsistent shard: index {fec_index} of {}, payload {} bytes.",
				self.packets.len(), payload.len(),
			);
			return;
		}
		if self.packets[fec_index].is_none() {
			self.packets[fec_index] = Some(payload.to_vec());
		}
	}

	/// A shard is usable only when every one of its packets arrived.
	fn present_shards(&self) -> Vec<bool> {
		(0..self.layout.total_shards())
			.map(|shard| {
				(0..self.layout.packets_per_shard).all(|packet| {
					self.packets[shard * self.layout.packets_per_shard + packet].is_some()
				})
			})
			.collect()
	}

	fn decodable(&self) -> bool {
		self.present_shards().iter().filter(|&&present| present).count() >= self.layout.data_shards
	}
}

/// Client-side mirror of the packetizer: accumulates shards per frame,
/// recovers erasures with the parity shards and yields whole frames in
/// order. An unrecoverable frame raises a sticky FEC failure flag that
/// only the next IDR clears.
pub struct FecReceiver {
	frames: BTreeMap<u64, FrameAccumulator>,
	last_emitted: u64,
	fec_failure: bool,
	fec_failures_total: u64,
	fec_decoders: HashMap<(usize, usize), ReedSolomon<galois_8::Field>>,
}

impl FecReceiver {
	pub fn new() -> Self {
		Self {
			frames: BTreeMap::new(),
			last_emitted: 0,
			fec_failure: false,
			fec_failures_total: 0,
			fec_decoders: HashMap::new(),
		}
	}

	pub fn fec_failure(&self) -> bool {
		self.fec_failure
	}

	/// Called when the decoder consumed an IDR frame; the failure state
	/// stops being interesting once the stream has a fresh reference.
	pub fn clear_fec_failure(&mut self) {
		self.fec_failure = false;
	}

	pub fn fec_failures_total(&self) -> u64 {
		self.fec_failures_total
	}

	/// Feeds one VIDEO payload (tag already stripped). Returns any frames
	/// that completed, oldest first.
	pub fn push_shard(&mut self, payload: &[u8]) -> Result<Vec<ReassembledFrame>, ()> {
		let (header, shard) = VideoFrameHeader::parse(payload)?;
		let index = header.video_frame_index;

		if index <= self.last_emitted {
			tracing::trace!("Late shard for already finished frame {index}.");
			return Ok(Vec::new());
		}

		let accumulator = match self.frames.entry(index) {
			std::collections::btree_map::Entry::Occupied(entry) => {
				let accumulator = entry.into_mut();
				// All shards of one frame share size and FEC settings.
				if accumulator.frame_byte_size != header.frame_byte_size as usize
					|| accumulator.layout.payload_size != shard.len()
				{
					tracing::warn!("Shard disagrees with frame {index} geometry, dropping shard.");
					return Ok(Vec::new());
				}
				accumulator
			},
			std::collections::btree_map::Entry::Vacant(entry) => {
				let Some(layout) = ShardLayout::compute(
					header.frame_byte_size as usize,
					shard.len(),
					header.fec_percentage,
				) else {
					tracing::warn!("Shard with impossible geometry for frame {index}, dropping.");
					return Ok(Vec::new());
				};
				entry.insert(FrameAccumulator::new(&header, layout))
			},
		};

		accumulator.insert(header.fec_index as usize, shard);

		let mut completed = Vec::new();
		if accumulator.decodable() {
			if let Some(frame) = self.finish_frame(index)? {
				// A completed frame declares every older unfinished frame
				// lost.
				self.declare_older_lost(index);
				self.frames.remove(&index);
				self.last_emitted = index;
				completed.push(frame);
			}
		}

		// Bound the window even when nothing completes.
		while self.frames.len() > FRAME_WINDOW {
			let (&oldest, _) = self.frames.iter().next().unwrap();
			tracing::debug!("Frame {oldest} pushed out of the reassembly window.");
			self.frames.remove(&oldest);
			self.mark_failure();
		}

		Ok(completed)
	}

	fn finish_frame(&mut self, index: u64) -> Result<Option<ReassembledFrame>, ()> {
		let accumulator = self.frames.get_mut(&index).ok_or(())?;
		let layout = accumulator.layout;

		// Reassemble shards from their packets, missing shards as holes.
		let mut shards: Vec<Option<Vec<u8>>> = (0..layout.total_shards())
			.map(|shard| {
				let begin = shard * layout.packets_per_shard;
				let parts = &accumulator.packets[begin..begin + layout.packets_per_shard];
				if parts.iter().all(Option::is_some) {
					let mut whole = Vec::with_capacity(layout.shard_size());
					for part in parts.iter().flatten() {
						whole.extend_from_slice(part);
					}
					Some(whole)
				} else {
					None
				}
			})
			.collect();

		let missing = shards.iter().filter(|shard| shard.is_none()).count();
		if missing > 0 {
			if layout.parity_shards == 0 {
				return Ok(None);
			}
			let decoder = match self.fec_decoders.entry((layout.data_shards, layout.parity_shards)) {
				Entry::Occupied(e) => e.into_mut(),
				Entry::Vacant(e) => e.insert(
					ReedSolomon::<galois_8::Field>::new(layout.data_shards, layout.parity_shards)
						.map_err(|e| tracing::error!("Couldn't create error correction decoder: {e}"))?,
				),
			};
			if let Err(error) = decoder.reconstruct(&mut shards) {
				tracing::debug!("FEC reconstruction of frame {index} failed: {error}");
				return Ok(None);
			}
		}

		let accumulator = self.frames.get(&index).ok_or(())?;
		let mut data = Vec::with_capacity(layout.data_shards * layout.shard_size());
		for shard in shards.iter().take(layout.data_shards).flatten() {
			data.extend_from_slice(shard);
		}
		data.truncate(accumulator.frame_byte_size);

		Ok(Some(ReassembledFrame {
			video_frame_index: index,
			tracking_frame_index: accumulator.tracking_frame_index,
			sent_time_ns: accumulator.sent_time_ns,
			data,
		}))
	}

	fn declare_older_lost(&mut self, index: u64) {
		let lost: Vec<u64> = self.frames.range(..index).map(|(&i, _)| i).collect();
		for frame in lost {
			tracing::debug!("Frame {frame} lost: a newer frame completed first.");
			self.frames.remove(&frame);
			self.mark_failure();
		}
	}

	fn mark_failure(&mut self) {
		self.fec_failure = true;
		self.fec_failures_total += 1;
	}
}

impl Default for FecReceiver {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use crate::session::stream::split_tag;
	use crate::session::stream::video::encoder::FramePacket;
	use crate::session::stream::video::packetizer::Packetizer;

	use super::*;

	fn frame(size: usize, seed: u8) -> FramePacket {
		FramePacket {
			data: (0..size).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect(),
			pts_ns: 0,
			tracking_frame_index: 3,
			is_idr: false,
		}
	}

	fn payloads(datagrams: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
		datagrams
			.into_iter()
			.map(|datagram| split_tag(&datagram).unwrap().1.to_vec())
			.collect()
	}

	fn feed(receiver: &mut FecReceiver, shards: &[Vec<u8>]) -> Vec<ReassembledFrame> {
		let mut out = Vec::new();
		for shard in shards {
			out.extend(receiver.push_shard(shard).unwrap());
		}
		out
	}

	#[test]
	fn clean_path_round_trips() {
		let mut packetizer = Packetizer::new();
		let mut receiver = FecReceiver::new();
		let source = frame(50_000, 1);

		let shards = payloads(packetizer.packetize(&source, 1_400, 10, 5_555).unwrap());
		let frames = feed(&mut receiver, &shards);

		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].data, source.data);
		assert_eq!(frames[0].tracking_frame_index, 3);
		assert_eq!(frames[0].sent_time_ns, 5_555);
		assert!(!receiver.fec_failure());
	}

	#[test]
	fn recovers_with_any_parity_sized_loss() {
		let mut packetizer = Packetizer::new();
		let source = frame(50_000, 2);
		let shards = payloads(packetizer.packetize(&source, 1_400, 10, 0).unwrap());
		assert_eq!(shards.len(), 40);

		// Drop any 4 shards (the parity budget).
		for dropped in [[0usize, 1, 2, 3], [0, 17, 35, 39], [36, 37, 38, 39], [5, 6, 21, 38]] {
			let mut receiver = FecReceiver::new();
			let kept: Vec<Vec<u8>> = shards
				.iter()
				.enumerate()
				.filter(|(i, _)| !dropped.contains(i))
				.map(|(_, shard)| shard.clone())
				.collect();
			let frames = feed(&mut receiver, &kept);
			assert_eq!(frames.len(), 1, "loss pattern {dropped:?} should recover");
			assert_eq!(frames[0].data, source.data);
		}
	}

	#[test]
	fn round_trip_across_sizes_and_percentages() {
		for (size, fec) in [(1usize, 0u16), (1, 50), (1_399, 5), (1_400, 5), (1_401, 25), (250_000, 50)] {
			let mut packetizer = Packetizer::new();
			let mut receiver = FecReceiver::new();
			let source = frame(size, 3);
			let shards = payloads(packetizer.packetize(&source, 1_400, fec, 0).unwrap());
			let frames = feed(&mut receiver, &shards);
			assert_eq!(frames.len(), 1, "size {size} fec {fec}");
			assert_eq!(frames[0].data, source.data, "size {size} fec {fec}");
		}
	}

	#[test]
	fn grouped_shard_frame_survives_shard_loss() {
		let mut packetizer = Packetizer::new();
		let mut receiver = FecReceiver::new();
		let source = frame(1_000_000, 4);
		let datagrams = packetizer.packetize(&source, 1_400, 20, 0).unwrap();
		let shards = payloads(datagrams);

		let layout = ShardLayout::compute(1_000_000, 1_400, 20).unwrap();
		assert!(layout.packets_per_shard > 1);
		// Drop one whole shard's worth of consecutive packets.
		let kept: Vec<Vec<u8>> = shards
			.iter()
			.enumerate()
			.filter(|(i, _)| *i / layout.packets_per_shard != 2)
			.map(|(_, shard)| shard.clone())
			.collect();

		let frames = feed(&mut receiver, &kept);
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].data, source.data);
	}

	#[test]
	fn unrecoverable_frame_is_declared_lost_by_the_next_frame() {
		let mut packetizer = Packetizer::new();
		let mut receiver = FecReceiver::new();

		let first = frame(20_000, 5);
		let second = frame(20_000, 6);
		let first_shards = payloads(packetizer.packetize(&first, 1_400, 10, 0).unwrap());
		let second_shards = payloads(packetizer.packetize(&second, 1_400, 10, 0).unwrap());

		// Deliver too few shards of the first frame to ever recover.
		let frames = feed(&mut receiver, &first_shards[0..5]);
		assert!(frames.is_empty());
		assert!(!receiver.fec_failure());

		// The second frame completes and flushes the first as lost.
		let frames = feed(&mut receiver, &second_shards);
		assert_eq!(frames.len(), 1);
		assert_eq!(frames[0].data, second.data);
		assert!(receiver.fec_failure());

		receiver.clear_fec_failure();
		assert!(!receiver.fec_failure());
		assert_eq!(receiver.fec_failures_total(), 1);
	}

	#[test]
	fn late_shards_for_finished_frames_are_ignored() {
		let mut packetizer = Packetizer::new();
		let mut receiver = FecReceiver::new();
		let source = frame(5_000, 7);
		let shards = payloads(packetizer.packetize(&source, 1_400, 10, 0).unwrap());

		assert_eq!(feed(&mut receiver, &shards).len(), 1);
		// Replay of the same shards produces nothing.
		assert!(feed(&mut receiver, &shards).is_empty());
	}

	#[test]
	fn frames_reassemble_out_of_order_within_the_window() {
		let mut packetizer = Packetizer::new();
		let mut receiver = FecReceiver::new();
		let first = frame(5_000, 8);
		let second = frame(5_000, 9);
		// No parity, so the second frame cannot complete early.
		let first_shards = payloads(packetizer.packetize(&first, 1_400, 0, 0).unwrap());
		let second_shards = payloads(packetizer.packetize(&second, 1_400, 0, 0).unwrap());

		// Interleave: all of frame 2's shards except one, then frame 1
		// completes, then frame 2 finishes.
		let mut frames = Vec::new();
		frames.extend(feed(&mut receiver, &second_shards[1..]));
		frames.extend(feed(&mut receiver, &first_shards));
		frames.extend(feed(&mut receiver, &second_shards[0..1]));

		// Frame 1 completed first and did not declare frame 2 lost.
		assert_eq!(frames.len(), 2);
		assert_eq!(frames[0].video_frame_index, 1);
		assert_eq!(frames[1].video_frame_index, 2);
		assert!(!receiver.fec_failure());
	}

	#[test]
	fn malformed_shard_is_an_error() {
		let mut receiver = FecReceiver::new();
		assert!(receiver.push_shard(&[1, 2, 3]).is_err());
	}
}
