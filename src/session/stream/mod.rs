pub use self::{
	audio::AudioStream,
	control::ControlStream,
	video::VideoStream,
};

pub mod audio;
pub mod control;
pub mod video;

/// Every datagram starts with this 4-byte little-endian type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PacketType {
	Video = 1,
	Audio = 2,
	Haptics = 3,
	Tracking = 11,
	TimeSync = 12,
	Handshake = 13,
	StreamControl = 14,
}

impl TryFrom<u32> for PacketType {
	type Error = ();

	fn try_from(v: u32) -> Result<Self, Self::Error> {
		match v {
			x if x == Self::Video as u32 => Ok(Self::Video),
			x if x == Self::Audio as u32 => Ok(Self::Audio),
			x if x == Self::Haptics as u32 => Ok(Self::Haptics),
			x if x == Self::Tracking as u32 => Ok(Self::Tracking),
			x if x == Self::TimeSync as u32 => Ok(Self::TimeSync),
			x if x == Self::Handshake as u32 => Ok(Self::Handshake),
			x if x == Self::StreamControl as u32 => Ok(Self::StreamControl),
			_ => Err(()),
		}
	}
}

/// Splits a raw datagram into its type tag and payload.
pub fn split_tag(datagram: &[u8]) -> Result<(PacketType, &[u8]), ()> {
	if datagram.len() < 4 {
		return Err(());
	}
	let tag = u32::from_le_bytes(datagram[..4].try_into().unwrap());
	Ok((PacketType::try_from(tag)?, &datagram[4..]))
}

/// Starts a datagram buffer with the given type tag.
pub fn tagged_buffer(tag: PacketType, capacity: usize) -> Vec<u8> {
	let mut buffer = Vec::with_capacity(4 + capacity);
	buffer.extend((tag as u32).to_le_bytes());
	buffer
}

/// Haptics feedback forwarded to one controller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HapticsPacket {
	/// Hand path id, `LEFT_HAND_PATH` or `RIGHT_HAND_PATH`.
	pub path: u64,
	pub duration_s: f32,
	pub frequency: f32,
	pub amplitude: f32,
}

impl HapticsPacket {
	pub fn serialize(&self, buffer: &mut Vec<u8>) {
		buffer.extend(self.path.to_le_bytes());
		buffer.extend(self.duration_s.to_le_bytes());
		buffer.extend(self.frequency.to_le_bytes());
		buffer.extend(self.amplitude.to_le_bytes());
	}

	pub fn parse(buffer: &[u8]) -> Result<Self, ()> {
		if buffer.len() < 20 {
			tracing::warn!("Haptics packet too short: {} bytes.", buffer.len());
			return Err(());
		}
		Ok(Self {
			path: u64::from_le_bytes(buffer[0..8].try_into().unwrap()),
			duration_s: f32::from_le_bytes(buffer[8..12].try_into().unwrap()),
			frequency: f32::from_le_bytes(buffer[12..16].try_into().unwrap()),
			amplitude: f32::from_le_bytes(buffer[16..20].try_into().unwrap()),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tag_round_trip() {
		for tag in [
			PacketType::Video,
			PacketType::Audio,
			PacketType::Haptics,
			PacketType::Tracking,
			PacketType::TimeSync,
			PacketType::Handshake,
			PacketType::StreamControl,
		] {
			let buffer = tagged_buffer(tag, 0);
			assert_eq!(split_tag(&buffer).unwrap().0, tag);
		}
	}

	#[test]
	fn unknown_tag_is_rejected() {
		assert!(split_tag(&99u32.to_le_bytes()).is_err());
		assert!(split_tag(&[1, 2]).is_err());
	}

	#[test]
	fn haptics_round_trip() {
		let packet = HapticsPacket {
			path: crate::tracking::LEFT_HAND_PATH,
			duration_s: 0.25,
			frequency: 160.0,
			amplitude: 0.8,
		};
		let mut buffer = Vec::new();
		packet.serialize(&mut buffer);
		assert_eq!(HapticsPacket::parse(&buffer).unwrap(), packet);
	}
}
