//! Grid meshes built from DEM samples.
//!
//! A tile mesh is a regular grid of DEM samples in physical space,
//! triangulated over the cells that have enough valid corners. The binary
//! encoding is the proxy's own compact format; viewers treat it as opaque.

use anyhow::Result;
use byteorder::{LE, WriteBytesExt};
use std::io::Write;

/// Samples along one tile edge of a generated mesh grid.
pub const MESH_GRID_SIZE: u32 = 33;

const MAGIC: &[u8; 4] = b"TCME";
const VERSION: u16 = 1;

#[derive(Debug, Default)]
pub struct GridMesh {
	pub vertices: Vec<[f64; 3]>,
	pub faces: Vec<[u32; 3]>,
}

impl GridMesh {
	/// Triangulates a row-major point grid. Cells with all four corners
	/// produce two triangles, cells with exactly three produce one.
	pub fn from_grid(points: &[Option<[f64; 3]>], width: u32, height: u32) -> GridMesh {
		assert_eq!(points.len(), (width * height) as usize);

		let mut mesh = GridMesh::default();
		let mut vertex_index = vec![u32::MAX; points.len()];
		let mut index_of = |mesh: &mut GridMesh, i: u32, j: u32| -> Option<u32> {
			let flat = (j * width + i) as usize;
			let point = points[flat]?;
			if vertex_index[flat] == u32::MAX {
				vertex_index[flat] = mesh.vertices.len() as u32;
				mesh.vertices.push(point);
			}
			Some(vertex_index[flat])
		};

		for j in 1..height {
			for i in 1..width {
				let v00 = index_of(&mut mesh, i - 1, j - 1);
				let v01 = index_of(&mut mesh, i - 1, j);
				let v10 = index_of(&mut mesh, i, j - 1);
				let v11 = index_of(&mut mesh, i, j);

				match (v00, v01, v10, v11) {
					(Some(a), Some(b), Some(c), Some(d)) => {
						mesh.faces.push([a, c, d]);
						mesh.faces.push([a, d, b]);
					}
					(None, Some(b), Some(c), Some(d)) => mesh.faces.push([b, c, d]),
					(Some(a), None, Some(c), Some(d)) => mesh.faces.push([a, c, d]),
					(Some(a), Some(b), None, Some(d)) => mesh.faces.push([a, d, b]),
					(Some(a), Some(b), Some(c), None) => mesh.faces.push([a, c, b]),
					_ => {}
				}
			}
		}

		mesh
	}

	pub fn is_empty(&self) -> bool {
		self.faces.is_empty()
	}

	pub fn encode(&self) -> Result<Vec<u8>> {
		let mut buffer = Vec::with_capacity(16 + self.vertices.len() * 24 + self.faces.len() * 12);
		buffer.write_all(MAGIC)?;
		buffer.write_u16::<LE>(VERSION)?;
		buffer.write_u32::<LE>(self.vertices.len() as u32)?;
		for vertex in &self.vertices {
			for &value in vertex {
				buffer.write_f64::<LE>(value)?;
			}
		}
		buffer.write_u32::<LE>(self.faces.len() as u32)?;
		for face in &self.faces {
			for &index in face {
				buffer.write_u32::<LE>(index)?;
			}
		}
		Ok(buffer)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn full_grid_triangulates_every_cell() {
		let points: Vec<Option<[f64; 3]>> = (0..9)
			.map(|index| Some([f64::from(index % 3), f64::from(index / 3), 0.0]))
			.collect();
		let mesh = GridMesh::from_grid(&points, 3, 3);
		assert_eq!(mesh.vertices.len(), 9);
		assert_eq!(mesh.faces.len(), 8);
	}

	#[test]
	fn missing_corner_halves_the_cell() {
		let mut points: Vec<Option<[f64; 3]>> = (0..4)
			.map(|index| Some([f64::from(index % 2), f64::from(index / 2), 0.0]))
			.collect();
		points[0] = None;
		let mesh = GridMesh::from_grid(&points, 2, 2);
		assert_eq!(mesh.vertices.len(), 3);
		assert_eq!(mesh.faces.len(), 1);
	}

	#[test]
	fn empty_grid_produces_empty_mesh() {
		let points = vec![None; 4];
		let mesh = GridMesh::from_grid(&points, 2, 2);
		assert!(mesh.is_empty());
	}

	#[test]
	fn encoding_has_stable_header() {
		let points: Vec<Option<[f64; 3]>> = (0..4).map(|_| Some([0.0, 0.0, 0.0])).collect();
		let mesh = GridMesh::from_grid(&points, 2, 2);
		let bytes = mesh.encode().unwrap();
		assert_eq!(&bytes[0..4], b"TCME");
		assert_eq!(bytes.len(), 4 + 2 + 4 + 4 * 24 + 4 + 2 * 12);
	}
}
