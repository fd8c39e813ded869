//! Warp results: dense sample matrices.

use anyhow::{Result, ensure};
use byteorder::{LE, ReadBytesExt, WriteBytesExt};

/// Samples below this value are holes in the warped data.
pub const INVALID_VALUE: f64 = -1e10;

/// Returns true when a warped sample carries real data.
pub fn valid_sample(value: f64) -> bool {
	value >= -1e6
}

/// A warped raster: `channels` interleaved f64 samples per pixel, row-major
/// from the upper-left corner.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
	pub width: u32,
	pub height: u32,
	pub channels: u32,
	pub data: Vec<f64>,
}

impl Raster {
	pub fn new(width: u32, height: u32, channels: u32) -> Raster {
		Raster {
			width,
			height,
			channels,
			data: vec![INVALID_VALUE; (width * height * channels) as usize],
		}
	}

	pub fn sample(&self, x: u32, y: u32, channel: u32) -> f64 {
		self.data[((y * self.width + x) * self.channels + channel) as usize]
	}

	pub fn set_sample(&mut self, x: u32, y: u32, channel: u32, value: f64) {
		self.data[((y * self.width + x) * self.channels + channel) as usize] = value;
	}

	/// All channels of one pixel; only meaningful for 3-channel rasters.
	pub fn sample3(&self, x: u32, y: u32) -> [f64; 3] {
		[self.sample(x, y, 0), self.sample(x, y, 1), self.sample(x, y, 2)]
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut buffer = Vec::with_capacity(12 + self.data.len() * 8);
		buffer.write_u32::<LE>(self.width).unwrap();
		buffer.write_u32::<LE>(self.height).unwrap();
		buffer.write_u32::<LE>(self.channels).unwrap();
		for &value in &self.data {
			buffer.write_f64::<LE>(value).unwrap();
		}
		buffer
	}

	pub fn decode(bytes: &[u8]) -> Result<Raster> {
		let mut reader = bytes;
		let width = reader.read_u32::<LE>()?;
		let height = reader.read_u32::<LE>()?;
		let channels = reader.read_u32::<LE>()?;
		let count = (width as usize) * (height as usize) * (channels as usize);
		ensure!(reader.len() == count * 8, "raster payload size mismatch");
		let mut data = Vec::with_capacity(count);
		for _ in 0..count {
			data.push(reader.read_f64::<LE>()?);
		}
		Ok(Raster {
			width,
			height,
			channels,
			data,
		})
	}
}

/// Heightcoded vector payload; opaque serialized bytes plus the format tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Heightcoded {
	pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn new_raster_is_invalid() {
		let raster = Raster::new(4, 2, 3);
		assert!(!valid_sample(raster.sample(0, 0, 0)));
		assert!(!valid_sample(raster.sample(3, 1, 2)));
	}

	#[test]
	fn sample_round_trip() {
		let mut raster = Raster::new(4, 4, 1);
		raster.set_sample(2, 3, 0, 1234.5);
		assert_eq!(raster.sample(2, 3, 0), 1234.5);
	}

	#[test]
	fn encode_decode_round_trip() {
		let mut raster = Raster::new(3, 2, 3);
		raster.set_sample(1, 1, 0, 8.0);
		raster.set_sample(1, 1, 2, -8.0);
		let decoded = Raster::decode(&raster.encode()).unwrap();
		assert_eq!(decoded, raster);
	}

	#[test]
	fn decode_rejects_truncated_payload() {
		let raster = Raster::new(2, 2, 1);
		let mut bytes = raster.encode();
		bytes.pop();
		assert!(Raster::decode(&bytes).is_err());
	}

	#[test]
	fn validity_threshold() {
		assert!(valid_sample(0.0));
		assert!(valid_sample(-999_999.0));
		assert!(!valid_sample(-1_000_001.0));
		assert!(!valid_sample(INVALID_VALUE));
	}
}
