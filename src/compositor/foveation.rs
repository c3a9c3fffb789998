use crate::config::FoveationConfig;

/// Encoders want dimensions aligned to whole macroblocks.
const ALIGNMENT: u32 = 32;

/// Precomputed foveated remap for one eye: the render plane is split into
/// a full-density center region and peripheral bands shrunk by the edge
/// ratios, and every output coordinate is resolved to a source coordinate
/// once, up front. The per-frame remap is then a single gather pass.
pub struct FoveationMap {
	source_width: u32,
	source_height: u32,
	output_width: u32,
	output_height: u32,
	lut_x: Vec<u32>,
	lut_y: Vec<u32>,
}

impl FoveationMap {
	pub fn new(config: &FoveationConfig, source_width: u32, source_height: u32) -> Self {
		let output_width = output_extent(config.center_size_x, config.edge_ratio_x, source_width);
		let output_height = output_extent(config.center_size_y, config.edge_ratio_y, source_height);

		Self {
			source_width,
			source_height,
			output_width,
			output_height,
			lut_x: build_axis_lut(config.center_size_x, config.edge_ratio_x, source_width, output_width),
			lut_y: build_axis_lut(config.center_size_y, config.edge_ratio_y, source_height, output_height),
		}
	}

	pub fn output_width(&self) -> u32 {
		self.output_width
	}

	pub fn output_height(&self) -> u32 {
		self.output_height
	}

	/// Gathers `source` (RGBA8, source extent) into `output` (RGBA8,
	/// output extent).
	pub fn remap(&self, source: &[u8], output: &mut Vec<u8>) {
		output.clear();
		output.reserve(self.output_width as usize * self.output_height as usize * 4);

		for y in 0..self.output_height as usize {
			let source_row = self.lut_y[y] as usize * self.source_width as usize;
			for x in 0..self.output_width as usize {
				let source_index = (source_row + self.lut_x[x] as usize) * 4;
				output.extend_from_slice(&source[source_index..source_index + 4]);
			}
		}
	}
}

/// Output extent of one axis: the center keeps full density, the two edge
/// bands are shrunk by the edge ratio, and the result is rounded up to the
/// encoder alignment.
pub fn output_extent(center_size: f32, edge_ratio: f32, target: u32) -> u32 {
	let fraction = center_size + (1.0 - center_size) / edge_ratio;
	let extent = (fraction * target as f32 / ALIGNMENT as f32).ceil() as u32 * ALIGNMENT;
	extent.min(next_aligned(target))
}

fn next_aligned(value: u32) -> u32 {
	value.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// Maps every output coordinate of one axis back to a source coordinate.
/// Piecewise linear: edge band, center band, edge band; the center band is
/// an identity-density copy.
fn build_axis_lut(center_size: f32, edge_ratio: f32, source: u32, output: u32) -> Vec<u32> {
	let source_edge = (1.0 - center_size) / 2.0 * source as f32;
	let source_center = center_size * source as f32;

	let output_scale = output as f32 / (center_size + (1.0 - center_size) / edge_ratio) / source as f32;
	let output_edge = source_edge / edge_ratio * output_scale;
	let output_center = source_center * output_scale;

	(0..output)
		.map(|i| {
			let position = i as f32 + 0.5;
			let source_position = if position < output_edge {
				position / output_edge.max(1.0) * source_edge
			} else if position < output_edge + output_center {
				source_edge + (position - output_edge)
			} else {
				let along = (position - output_edge - output_center) / output_edge.max(1.0);
				source_edge + source_center + along * source_edge
			};
			(source_position as u32).min(source - 1)
		})
		.collect()
}
