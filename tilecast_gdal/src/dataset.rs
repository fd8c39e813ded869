//! Dataset probing.
//!
//! A [`DatasetDescriptor`] is everything the measurement and preparation
//! paths need to know about a GDAL dataset without keeping it open: size,
//! band layout, SRS and extents.

use anyhow::{Context, Result, ensure};
use gdal::Dataset;
use gdal::raster::GdalDataType;
use std::path::Path;
use tilecast_core::Extents2;

#[derive(Debug, Clone)]
pub struct DatasetDescriptor {
	pub path: String,
	/// (width, height) in pixels.
	pub size: (usize, usize),
	pub bands: usize,
	/// Data type of the first band.
	pub data_type: GdalDataType,
	/// SRS as a proj4 definition.
	pub srs: String,
	/// Extents in the dataset SRS.
	pub extents: Extents2,
	pub geo_transform: [f64; 6],
}

impl DatasetDescriptor {
	pub fn probe(path: &Path) -> Result<DatasetDescriptor> {
		let dataset = Dataset::open(path).with_context(|| format!("cannot open dataset {path:?}"))?;
		let size = dataset.raster_size();
		let bands = dataset.raster_count();
		ensure!(bands > 0, "dataset {path:?} has no raster bands");

		let data_type = dataset.rasterband(1)?.band_type();
		let srs = dataset
			.spatial_ref()
			.with_context(|| format!("dataset {path:?} has no spatial reference"))?
			.to_proj4()?;
		let geo_transform = dataset.geo_transform()?;

		let corner = |px: f64, py: f64| {
			[
				geo_transform[0] + px * geo_transform[1] + py * geo_transform[2],
				geo_transform[3] + px * geo_transform[4] + py * geo_transform[5],
			]
		};
		let mut extents = Extents2::empty();
		extents.update(corner(0.0, 0.0));
		extents.update(corner(size.0 as f64, 0.0));
		extents.update(corner(0.0, size.1 as f64));
		extents.update(corner(size.0 as f64, size.1 as f64));

		Ok(DatasetDescriptor {
			path: path.to_string_lossy().into_owned(),
			size,
			bands,
			data_type,
			srs,
			extents,
			geo_transform,
		})
	}

	/// Pixel size in dataset units.
	pub fn pixel_size(&self) -> (f64, f64) {
		let size = self.extents.size();
		(size.width / self.size.0 as f64, size.height / self.size.1 as f64)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::srs::parse_srs;
	use gdal::DriverManager;

	fn create_dataset(path: &Path, bands: usize, byte: bool) {
		crate::register_all();
		let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
		let mut dataset = if byte {
			driver
				.create_with_band_type::<u8, _>(path.to_str().unwrap(), 32, 16, bands)
				.unwrap()
		} else {
			driver
				.create_with_band_type::<f32, _>(path.to_str().unwrap(), 32, 16, bands)
				.unwrap()
		};
		dataset.set_spatial_ref(&parse_srs("EPSG:4326").unwrap()).unwrap();
		dataset
			.set_geo_transform(&[14.0, 1.0 / 32.0, 0.0, 50.0, 0.0, -1.0 / 16.0])
			.unwrap();
	}

	#[test]
	fn probe_reads_shape_and_extents() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("probe.tif");
		create_dataset(&path, 1, false);

		let descriptor = DatasetDescriptor::probe(&path).unwrap();
		assert_eq!(descriptor.size, (32, 16));
		assert_eq!(descriptor.bands, 1);
		assert_eq!(descriptor.data_type, GdalDataType::Float32);
		assert!((descriptor.extents.x_min - 14.0).abs() < 1e-9);
		assert!((descriptor.extents.x_max - 15.0).abs() < 1e-9);
		assert!((descriptor.extents.y_min - 49.0).abs() < 1e-9);
		assert!((descriptor.extents.y_max - 50.0).abs() < 1e-9);
	}

	#[test]
	fn probe_reports_byte_bands() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("mono.tif");
		create_dataset(&path, 1, true);

		let descriptor = DatasetDescriptor::probe(&path).unwrap();
		assert_eq!(descriptor.data_type, GdalDataType::UInt8);
	}

	#[test]
	fn probe_missing_file_fails() {
		crate::register_all();
		assert!(DatasetDescriptor::probe(Path::new("/nonexistent.tif")).is_err());
	}
}
