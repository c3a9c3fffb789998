//! Bitstream framing for the three codecs the encoder abstraction can
//! carry: Annex-B NAL units for H.264/HEVC and OBUs for AV1.
//!
//! The wire format expects only parameter sets, IDR and slice units, so
//! producers run every encoded frame through [`filter_frame`] before
//! packetization. The receive path uses the same parsers to classify
//! reassembled frames.

use super::encoder::CodecKind;

// H.264 unit types.
const H264_NAL_IDR: u8 = 5;
const H264_NAL_SEI: u8 = 6;
const H264_NAL_SPS: u8 = 7;
const H264_NAL_PPS: u8 = 8;
const H264_NAL_AUD: u8 = 9;

// HEVC unit types.
const HEVC_NAL_IDR_W_RADL: u8 = 19;
const HEVC_NAL_IDR_N_LP: u8 = 20;
const HEVC_NAL_VPS: u8 = 32;
const HEVC_NAL_SPS: u8 = 33;
const HEVC_NAL_PPS: u8 = 34;
const HEVC_NAL_AUD: u8 = 35;
const HEVC_NAL_PREFIX_SEI: u8 = 39;

// AV1 OBU types.
const OBU_SEQUENCE_HEADER: u8 = 1;
const OBU_TEMPORAL_DELIMITER: u8 = 2;
const OBU_PADDING: u8 = 15;

/// Iterator over Annex-B units, yielded without their start codes.
pub struct AnnexBUnits<'a> {
	data: &'a [u8],
	cursor: usize,
}

impl<'a> AnnexBUnits<'a> {
	pub fn new(data: &'a [u8]) -> Self {
		Self { data, cursor: next_start_code(data, 0).unwrap_or(data.len()) }
	}
}

impl<'a> Iterator for AnnexBUnits<'a> {
	type Item = &'a [u8];

	fn next(&mut self) -> Option<&'a [u8]> {
		if self.cursor >= self.data.len() {
			return None;
		}

		// Skip the start code itself (00 00 01, optionally preceded by
		// one more zero byte).
		let mut begin = self.cursor + 3;
		if self.data[self.cursor..].starts_with(&[0, 0, 0, 1]) {
			begin += 1;
		}
		if begin > self.data.len() {
			self.cursor = self.data.len();
			return None;
		}

		let end = next_start_code(self.data, begin).unwrap_or(self.data.len());
		self.cursor = end;
		Some(&self.data[begin..end])
	}
}

fn next_start_code(data: &[u8], from: usize) -> Option<usize> {
	let mut i = from;
	while i + 3 <= data.len() {
		if data[i] == 0 && data[i + 1] == 0 {
			if data[i + 2] == 1 {
				// Fold a four-byte start code into one position.
				if i > from && data[i - 1] == 0 {
					return Some(i - 1);
				}
				return Some(i);
			}
			if data[i + 2] == 0 && i + 4 <= data.len() && data[i + 3] == 1 {
				return Some(i);
			}
		}
		i += 1;
	}
	None
}

fn h264_unit_type(unit: &[u8]) -> Option<u8> {
	unit.first().map(|byte| byte & 0x1f)
}

fn hevc_unit_type(unit: &[u8]) -> Option<u8> {
	unit.first().map(|byte| (byte >> 1) & 0x3f)
}

/// One AV1 open bitstream unit.
struct Obu<'a> {
	obu_type: u8,
	raw: &'a [u8],
}

/// Walks size-framed OBUs. Malformed trailing data ends the walk.
fn parse_obus(data: &[u8]) -> Vec<Obu<'_>> {
	let mut obus = Vec::new();
	let mut cursor = 0;

	while cursor < data.len() {
		let begin = cursor;
		let header = data[cursor];
		let obu_type = (header >> 3) & 0x0f;
		let has_extension = header & 0x04 != 0;
		let has_size = header & 0x02 != 0;
		cursor += 1;
		if has_extension {
			cursor += 1;
		}
		if cursor > data.len() {
			break;
		}

		let payload_size = if has_size {
			match read_leb128(data, &mut cursor) {
				Some(size) => size,
				None => break,
			}
		} else {
			// Unsized OBU extends to the end of the frame.
			(data.len() - cursor) as u64
		};

		let end = cursor.saturating_add(payload_size as usize);
		if end > data.len() {
			break;
		}
		obus.push(Obu { obu_type, raw: &data[begin..end] });
		cursor = end;
	}

	obus
}

fn read_leb128(data: &[u8], cursor: &mut usize) -> Option<u64> {
	let mut value = 0u64;
	for i in 0..8 {
		let byte = *data.get(*cursor)?;
		*cursor += 1;
		value |= u64::from(byte & 0x7f) << (i * 7);
		if byte & 0x80 == 0 {
			return Some(value);
		}
	}
	None
}

/// Strips the delimiter and filler units the wire format does not carry:
/// H.264 AUD/SEI, HEVC AUD/prefix-SEI, AV1 temporal delimiters and
/// padding. Everything else passes through unchanged, with four-byte
/// start codes for the NAL codecs.
pub fn filter_frame(codec: CodecKind, data: &[u8]) -> Vec<u8> {
	match codec {
		CodecKind::H264 => filter_annex_b(data, |unit| {
			!matches!(h264_unit_type(unit), Some(H264_NAL_AUD) | Some(H264_NAL_SEI))
		}),
		CodecKind::Hevc => filter_annex_b(data, |unit| {
			!matches!(hevc_unit_type(unit), Some(HEVC_NAL_AUD) | Some(HEVC_NAL_PREFIX_SEI))
		}),
		CodecKind::Av1 => {
			let mut out = Vec::with_capacity(data.len());
			for obu in parse_obus(data) {
				if obu.obu_type != OBU_TEMPORAL_DELIMITER && obu.obu_type != OBU_PADDING {
					out.extend_from_slice(obu.raw);
				}
			}
			out
		},
	}
}

fn filter_annex_b(data: &[u8], keep: impl Fn(&[u8]) -> bool) -> Vec<u8> {
	let mut out = Vec::with_capacity(data.len());
	for unit in AnnexBUnits::new(data) {
		if keep(unit) {
			out.extend_from_slice(&[0, 0, 0, 1]);
			out.extend_from_slice(unit);
		}
	}
	out
}

/// Whether a frame is an IDR (or the AV1 keyframe equivalent). IDR frames
/// always travel with their parameter sets, so for AV1 the sequence
/// header is the marker.
pub fn is_idr_frame(codec: CodecKind, data: &[u8]) -> bool {
	match codec {
		CodecKind::H264 => AnnexBUnits::new(data)
			.any(|unit| matches!(h264_unit_type(unit), Some(H264_NAL_IDR))),
		CodecKind::Hevc => AnnexBUnits::new(data)
			.any(|unit| matches!(hevc_unit_type(unit), Some(HEVC_NAL_IDR_W_RADL) | Some(HEVC_NAL_IDR_N_LP))),
		CodecKind::Av1 => parse_obus(data).iter().any(|obu| obu.obu_type == OBU_SEQUENCE_HEADER),
	}
}

/// Whether the frame carries the codec-specific decoder setup units:
/// SPS+PPS for H.264, VPS+SPS+PPS for HEVC, a sequence header for AV1.
pub fn has_codec_headers(codec: CodecKind, data: &[u8]) -> bool {
	match codec {
		CodecKind::H264 => {
			let mut sps = false;
			let mut pps = false;
			for unit in AnnexBUnits::new(data) {
				match h264_unit_type(unit) {
					Some(H264_NAL_SPS) => sps = true,
					Some(H264_NAL_PPS) => pps = true,
					_ => {},
				}
			}
			sps && pps
		},
		CodecKind::Hevc => {
			let mut vps = false;
			let mut sps = false;
			let mut pps = false;
			for unit in AnnexBUnits::new(data) {
				match hevc_unit_type(unit) {
					Some(HEVC_NAL_VPS) => vps = true,
					Some(HEVC_NAL_SPS) => sps = true,
					Some(HEVC_NAL_PPS) => pps = true,
					_ => {},
				}
			}
			vps && sps && pps
		},
		CodecKind::Av1 => parse_obus(data).iter().any(|obu| obu.obu_type == OBU_SEQUENCE_HEADER),
	}
}
