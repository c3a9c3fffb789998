use async_shutdown::ShutdownManager;
use tokio::sync::mpsc;

use crate::config::AudioConfig;
use crate::session::manager::SessionShutdownReason;
use crate::session::stream::{tagged_buffer, PacketType};
use crate::transport::{PacketClass, TransportSender};

/// Wire header of one AUDIO packet, before the PCM payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioPacketHeader {
	pub packet_counter: u32,
	pub presentation_time_us: u64,
	pub packet_index: u32,
}

pub const AUDIO_PACKET_HEADER_SIZE: usize = 16;

impl AudioPacketHeader {
	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend(self.packet_counter.to_le_bytes());
		buffer.extend(self.presentation_time_us.to_le_bytes());
		buffer.extend(self.packet_index.to_le_bytes());
	}

	pub fn parse(buffer: &[u8]) -> Result<(Self, &[u8]), ()> {
		if buffer.len() < AUDIO_PACKET_HEADER_SIZE {
			tracing::warn!("Audio packet too short: {} bytes.", buffer.len());
			return Err(());
		}
		let header = Self {
			packet_counter: u32::from_le_bytes(buffer[0..4].try_into().unwrap()),
			presentation_time_us: u64::from_le_bytes(buffer[4..12].try_into().unwrap()),
			packet_index: u32::from_le_bytes(buffer[12..16].try_into().unwrap()),
		};
		Ok((header, &buffer[AUDIO_PACKET_HEADER_SIZE..]))
	}
}

/// PCM handed over by the host's audio capture path.
pub struct PcmChunk {
	/// Interleaved stereo samples.
	pub samples: Vec<i16>,
	pub presentation_time_us: u64,
}

/// Host-facing handle for feeding captured audio into the stream.
#[derive(Clone)]
pub struct AudioInput {
	pcm_tx: mpsc::Sender<PcmChunk>,
}

impl AudioInput {
	pub fn push_pcm(&self, samples: Vec<i16>, presentation_time_us: u64) {
		// Audio is real-time; when the stream is behind, shedding beats
		// buffering.
		let _ = self.pcm_tx.try_send(PcmChunk { samples, presentation_time_us });
	}
}

/// Frames host PCM into fixed-duration self-contained packets. The output
/// is always 48 kHz, 16-bit, stereo; the host capture path feeds exactly
/// that and there is deliberately no resampler here.
#[derive(Clone)]
pub struct AudioStream {
	input: AudioInput,
}

impl AudioStream {
	pub fn new(
		config: &AudioConfig,
		transport: TransportSender,
		stop_session_manager: ShutdownManager<SessionShutdownReason>,
	) -> Self {
		let (pcm_tx, pcm_rx) = mpsc::channel(64);
		let samples_per_packet = (config.sample_rate * config.frame_duration_ms / 1_000) as usize * 2;

		tokio::spawn(run_audio(pcm_rx, samples_per_packet, transport, stop_session_manager));

		Self { input: AudioInput { pcm_tx } }
	}

	pub fn input(&self) -> AudioInput {
		self.input.clone()
	}
}

async fn run_audio(
	mut pcm_rx: mpsc::Receiver<PcmChunk>,
	samples_per_packet: usize,
	transport: TransportSender,
	stop_session_manager: ShutdownManager<SessionShutdownReason>,
) {
	let _delay_stop = stop_session_manager.delay_shutdown_token();

	let mut framer = PcmFramer::new(samples_per_packet);
	while let Ok(Some(chunk)) = stop_session_manager.wrap_cancel(pcm_rx.recv()).await {
		for datagram in framer.push(&chunk) {
			if transport.send(PacketClass::Audio, datagram).await.is_err() {
				tracing::debug!("Transport closed, stopping audio stream.");
				return;
			}
		}
	}

	tracing::debug!("Audio stream stopped.");
}

/// Chops arbitrary PCM chunks into exact packet-sized frames, carrying
/// the presentation clock across chunk boundaries.
struct PcmFramer {
	samples_per_packet: usize,
	buffered: Vec<i16>,
	buffered_pts_us: u64,
	packet_counter: u32,
	packet_index: u32,
}

impl PcmFramer {
	fn new(samples_per_packet: usize) -> Self {
		Self {
			samples_per_packet: samples_per_packet.max(2),
			buffered: Vec::new(),
			buffered_pts_us: 0,
			packet_counter: 0,
			packet_index: 0,
		}
	}

	fn push(&mut self, chunk: &PcmChunk) -> Vec<Vec<u8>> {
		if self.buffered.is_empty() {
			self.buffered_pts_us = chunk.presentation_time_us;
		}
		self.buffered.extend_from_slice(&chunk.samples);

		let mut packets = Vec::new();
		while self.buffered.len() >= self.samples_per_packet {
			let frame: Vec<i16> = self.buffered.drain(..self.samples_per_packet).collect();

			let header = AudioPacketHeader {
				packet_counter: self.packet_counter,
				presentation_time_us: self.buffered_pts_us,
				packet_index: self.packet_index,
			};
			self.packet_counter = self.packet_counter.wrapping_add(1);
			self.packet_index = self.packet_index.wrapping_add(1);

			// Interleaved stereo at 48 kHz: samples/2 frames of 1/48 ms.
			self.buffered_pts_us += (self.samples_per_packet as u64 / 2) * 1_000_000 / 48_000;

			let mut datagram = tagged_buffer(PacketType::Audio, AUDIO_PACKET_HEADER_SIZE + frame.len() * 2);
			header.serialize(&mut datagram);
			for sample in frame {
				datagram.extend(sample.to_le_bytes());
			}
			packets.push(datagram);
		}

		packets
	}
}

#[cfg(test)]
mod tests {
	use crate::session::stream::split_tag;

	use super::*;

	#[test]
	fn header_round_trip() {
		let header = AudioPacketHeader {
			packet_counter: 3,
			presentation_time_us: 123_456,
			packet_index: 9,
		};
		let mut buffer = Vec::new();
		header.serialize(&mut buffer);
		assert_eq!(buffer.len(), AUDIO_PACKET_HEADER_SIZE);
		let (parsed, rest) = AudioPacketHeader::parse(&buffer).unwrap();
		assert_eq!(parsed, header);
		assert!(rest.is_empty());
	}

	#[test]
	fn pcm_is_framed_into_ten_millisecond_packets() {
		// 10 ms at 48 kHz stereo: 960 samples.
		let mut framer = PcmFramer::new(960);
		let chunk = PcmChunk { samples: vec![1i16; 2_400], presentation_time_us: 1_000_000 };

		let packets = framer.push(&chunk);
		assert_eq!(packets.len(), 2);

		let (tag, payload) = split_tag(&packets[0]).unwrap();
		assert_eq!(tag, PacketType::Audio);
		let (header, pcm) = AudioPacketHeader::parse(payload).unwrap();
		assert_eq!(header.presentation_time_us, 1_000_000);
		assert_eq!(header.packet_index, 0);
		assert_eq!(pcm.len(), 960 * 2);

		// Second packet is exactly 10 ms later.
		let (header, _) = AudioPacketHeader::parse(split_tag(&packets[1]).unwrap().1).unwrap();
		assert_eq!(header.presentation_time_us, 1_010_000);
		assert_eq!(header.packet_index, 1);

		// 480 samples remain buffered for the next chunk.
		let packets = framer.push(&PcmChunk { samples: vec![2i16; 1_440], presentation_time_us: 0 });
		assert_eq!(packets.len(), 2);
	}

	#[test]
	fn counters_increment_across_packets() {
		let mut framer = PcmFramer::new(4);
		let packets = framer.push(&PcmChunk { samples: vec![0i16; 12], presentation_time_us: 0 });
		assert_eq!(packets.len(), 3);
		let counters: Vec<u32> = packets
			.iter()
			.map(|packet| AudioPacketHeader::parse(split_tag(packet).unwrap().1).unwrap().0.packet_counter)
			.collect();
		assert_eq!(counters, vec![0, 1, 2]);
	}
}
