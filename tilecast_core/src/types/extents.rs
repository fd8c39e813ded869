//! Floating-point extents and sizes.
//!
//! [`Extents2`] and [`Extents3`] are axis-aligned boxes that start in an
//! inverted "invalid" state and grow point by point, mirroring how sampling
//! code accumulates geometry bounds.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Size2f {
	pub width: f64,
	pub height: f64,
}

impl Size2f {
	pub fn new(width: f64, height: f64) -> Size2f {
		Size2f { width, height }
	}

	pub fn area(&self) -> f64 {
		self.width * self.height
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extents2 {
	pub x_min: f64,
	pub y_min: f64,
	pub x_max: f64,
	pub y_max: f64,
}

impl Extents2 {
	pub fn new(x_min: f64, y_min: f64, x_max: f64, y_max: f64) -> Extents2 {
		Extents2 {
			x_min,
			y_min,
			x_max,
			y_max,
		}
	}

	pub fn empty() -> Extents2 {
		Extents2 {
			x_min: f64::INFINITY,
			y_min: f64::INFINITY,
			x_max: f64::NEG_INFINITY,
			y_max: f64::NEG_INFINITY,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.x_min > self.x_max || self.y_min > self.y_max
	}

	pub fn update(&mut self, p: [f64; 2]) {
		self.x_min = self.x_min.min(p[0]);
		self.y_min = self.y_min.min(p[1]);
		self.x_max = self.x_max.max(p[0]);
		self.y_max = self.y_max.max(p[1]);
	}

	pub fn size(&self) -> Size2f {
		Size2f::new(self.x_max - self.x_min, self.y_max - self.y_min)
	}

	pub fn center(&self) -> [f64; 2] {
		[(self.x_min + self.x_max) / 2.0, (self.y_min + self.y_max) / 2.0]
	}

	pub fn contains(&self, p: [f64; 2]) -> bool {
		p[0] >= self.x_min && p[0] <= self.x_max && p[1] >= self.y_min && p[1] <= self.y_max
	}

	/// Corners in `ll`, `ul`, `ur`, `lr` order.
	pub fn ll(&self) -> [f64; 2] {
		[self.x_min, self.y_min]
	}

	pub fn ul(&self) -> [f64; 2] {
		[self.x_min, self.y_max]
	}

	pub fn ur(&self) -> [f64; 2] {
		[self.x_max, self.y_max]
	}

	pub fn lr(&self) -> [f64; 2] {
		[self.x_max, self.y_min]
	}

	/// Extents grown by half a pixel on each side, for a raster of
	/// `width` x `height` pixels spanning these extents. Warping into the
	/// grown extents places sample points at grid intersections.
	pub fn plus_half_pixel(&self, width: u32, height: u32) -> Extents2 {
		let size = self.size();
		let hx = size.width / (2.0 * width as f64);
		let hy = size.height / (2.0 * height as f64);
		Extents2 {
			x_min: self.x_min - hx,
			y_min: self.y_min - hy,
			x_max: self.x_max + hx,
			y_max: self.y_max + hy,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extents3 {
	pub x_min: f64,
	pub y_min: f64,
	pub z_min: f64,
	pub x_max: f64,
	pub y_max: f64,
	pub z_max: f64,
}

impl Extents3 {
	pub fn empty() -> Extents3 {
		Extents3 {
			x_min: f64::INFINITY,
			y_min: f64::INFINITY,
			z_min: f64::INFINITY,
			x_max: f64::NEG_INFINITY,
			y_max: f64::NEG_INFINITY,
			z_max: f64::NEG_INFINITY,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.x_min > self.x_max || self.y_min > self.y_max || self.z_min > self.z_max
	}

	pub fn update(&mut self, p: [f64; 3]) {
		self.x_min = self.x_min.min(p[0]);
		self.y_min = self.y_min.min(p[1]);
		self.z_min = self.z_min.min(p[2]);
		self.x_max = self.x_max.max(p[0]);
		self.y_max = self.y_max.max(p[1]);
		self.z_max = self.z_max.max(p[2]);
	}
}
