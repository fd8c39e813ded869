//! Calipers: measures a GDAL dataset within a reference frame.
//!
//! For every reference-frame node the dataset is sampled on a coarse grid,
//! the best lod is derived from the projected pixel area, the dataset
//! footprint is sharpened by recursive border refinement and the result is
//! the node's usable lod range plus the tile range at the bottom lod. Nodes
//! are measured independently and in parallel.

use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use tilecast_core::{
	Extents2, LodRange, ReferenceFrame, Registry, RfNode, TILE_SIZE, TileRange, tile_area, triangle_area_2d,
};
use tilecast_gdal::{CsConvertor, DatasetDescriptor, geographic_like, parse_srs, tmerc_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetType {
	Dem,
	Ophoto,
}

impl std::str::FromStr for DatasetType {
	type Err = anyhow::Error;

	fn from_str(value: &str) -> Result<DatasetType> {
		match value {
			"dem" => Ok(DatasetType::Dem),
			"ophoto" => Ok(DatasetType::Ophoto),
			other => bail!("invalid dataset type '{other}' (expected dem or ophoto)"),
		}
	}
}

#[derive(Debug, Clone)]
pub struct CalipersOptions {
	/// Overrides auto-detection.
	pub dataset_type: Option<DatasetType>,
	/// Inverse scale between a DEM's resolution and the most detailed
	/// orthophoto that can be draped on it.
	pub dem_to_ophoto_scale: f64,
	/// Fraction of a tile at which border refinement stops (inverse
	/// value; 4 means 1/4 of a tile).
	pub tile_fraction_limit: f64,
}

impl Default for CalipersOptions {
	fn default() -> CalipersOptions {
		CalipersOptions {
			dataset_type: None,
			dem_to_ophoto_scale: 3.0,
			tile_fraction_limit: 32.0,
		}
	}
}

/// Usable ranges of one reference-frame node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRanges {
	pub srs: String,
	/// Global lod range.
	pub lod_range: LodRange,
	/// Tile range at `lod_range.max`, in global tile coordinates.
	pub tile_range: TileRange,
}

impl NodeRanges {
	/// Tile range at any lod of the range, derived from the bottom.
	pub fn tile_range_at(&self, lod: u8) -> TileRange {
		self.tile_range.scaled_up(self.lod_range.max - lod)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
	pub gsd: f64,
	pub dataset_type: DatasetType,
	pub nodes: Vec<NodeRanges>,
}

impl Measurement {
	/// The calipers stdout format: the gsd line followed by one line per
	/// producing node.
	pub fn write(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
		writeln!(out, "gsd: {}", self.gsd)?;
		for node in &self.nodes {
			write!(out, "{}: {}", node.srs, node.lod_range)?;
			let mut separator = '/';
			for lod in node.lod_range.iter() {
				write!(out, "{}{}", separator, node.tile_range_at(lod))?;
				separator = ';';
			}
			writeln!(out)?;
		}
		Ok(())
	}
}

/// Dataset-type auto-detection: three or more bands are an orthophoto, a
/// single byte band is a monochromatic orthophoto, any other single band is
/// a DEM.
pub fn detect_type(descriptor: &DatasetDescriptor, forced: Option<DatasetType>) -> Result<DatasetType> {
	if let Some(forced) = forced {
		return Ok(forced);
	}

	if descriptor.bands >= 3 {
		return Ok(DatasetType::Ophoto);
	}
	if descriptor.bands != 1 {
		bail!(
			"cannot autodetect dataset type, unsupported number of bands ({})",
			descriptor.bands
		);
	}
	if descriptor.data_type == gdal::raster::GdalDataType::UInt8 {
		// probably monochromatic orthophoto
		return Ok(DatasetType::Ophoto);
	}
	Ok(DatasetType::Dem)
}

/// Ground sample distance: the linear size of the dataset's center pixel,
/// measured in a transverse mercator centered at the dataset centroid (on
/// the datum of the reference frame's navigation SRS).
pub fn compute_gsd(descriptor: &DatasetDescriptor, registry: &Registry, rf: &ReferenceFrame) -> Result<f64> {
	let navigation = &registry.srs_def(&rf.model.navigation_srs)?.def;

	let center = descriptor.extents.center();
	let to_geographic = CsConvertor::new(&descriptor.srs, &geographic_like(navigation))?;
	let geographic_center = to_geographic.convert_2d(center).context("dataset center is not projectable")?;

	let tmerc = tmerc_at(geographic_center[0], geographic_center[1], navigation)?;
	let dataset_srs = parse_srs(&descriptor.srs)?;
	let to_tmerc = CsConvertor::from_refs(&dataset_srs, &tmerc)?;

	// project the center pixel into the tmerc plane
	let (px_width, px_height) = descriptor.pixel_size();
	let (hx, hy) = (px_width / 2.0, px_height / 2.0);
	let corners = [
		to_tmerc.convert_2d([center[0] - hx, center[1] - hy])?,
		to_tmerc.convert_2d([center[0] - hx, center[1] + hy])?,
		to_tmerc.convert_2d([center[0] + hx, center[1] + hy])?,
		to_tmerc.convert_2d([center[0] + hx, center[1] - hy])?,
	];

	let px_area = triangle_area_2d(corners[0], corners[1], corners[2])
		+ triangle_area_2d(corners[2], corners[3], corners[0]);
	Ok(px_area.sqrt())
}

/// Measures the dataset in every node of the reference frame.
pub fn measure(
	descriptor: &DatasetDescriptor,
	registry: &Registry,
	rf: &ReferenceFrame,
	options: &CalipersOptions,
) -> Result<Measurement> {
	let dataset_type = detect_type(descriptor, options.dataset_type)?;
	let gsd = compute_gsd(descriptor, registry, rf)?;

	// inverse GSD scale
	let inv_gsd_scale = match dataset_type {
		DatasetType::Dem => options.dem_to_ophoto_scale,
		DatasetType::Ophoto => 1.0,
	};

	let nodes: Vec<&RfNode> = rf.nodes().collect();
	let mut measured: Vec<NodeRanges> = nodes
		.par_iter()
		.copied()
		.filter_map(|node| {
			NodeMeasurer::new(descriptor, registry, rf, node, inv_gsd_scale, options.tile_fraction_limit)
				.and_then(|mut measurer| measurer.run())
				.unwrap_or_else(|err| {
					log::warn!("cannot measure node <{}>: {err:#}", node.srs);
					None
				})
		})
		.collect();
	measured.sort_by(|a, b| a.srs.cmp(&b.srs));

	Ok(Measurement {
		gsd,
		dataset_type,
		nodes: measured,
	})
}

/// Division of the source dataset during sampling.
const STEPS: u32 = 255;

struct NodeMeasurer<'a> {
	descriptor: &'a DatasetDescriptor,
	node: &'a RfNode,
	rf: &'a ReferenceFrame,
	ds2node: CsConvertor,
	/// Dataset extents in the dataset SRS.
	extents: Extents2,
	step: (f64, f64),
	/// Valid marks of the (STEPS+1)^2 point grid.
	grid: Vec<bool>,
	projected: Vec<[f64; 2]>,
	local_extents: Extents2,
	step_in_pixels: (f64, f64),
	source_block_limit: (f64, f64),
	inv_gsd_scale: f64,
	tile_fraction_limit: f64,
	local_lod: u8,
	lod: u8,
}

impl<'a> NodeMeasurer<'a> {
	fn new(
		descriptor: &'a DatasetDescriptor,
		registry: &Registry,
		rf: &'a ReferenceFrame,
		node: &'a RfNode,
		inv_gsd_scale: f64,
		tile_fraction_limit: f64,
	) -> Result<NodeMeasurer<'a>> {
		let node_def = &registry.srs_def(&node.srs)?.def;
		let extents = descriptor.extents;
		let size = extents.size();
		Ok(NodeMeasurer {
			descriptor,
			node,
			rf,
			ds2node: CsConvertor::new(&descriptor.srs, node_def)?,
			extents,
			step: (size.width / f64::from(STEPS), size.height / f64::from(STEPS)),
			grid: vec![false; ((STEPS + 1) * (STEPS + 1)) as usize],
			projected: vec![[0.0; 2]; ((STEPS + 1) * (STEPS + 1)) as usize],
			local_extents: Extents2::empty(),
			step_in_pixels: (
				descriptor.size.0 as f64 / f64::from(STEPS),
				descriptor.size.1 as f64 / f64::from(STEPS),
			),
			source_block_limit: (0.0, 0.0),
			inv_gsd_scale,
			tile_fraction_limit,
			local_lod: 0,
			lod: 0,
		})
	}

	fn run(&mut self) -> Result<Option<NodeRanges>> {
		if !self.sample() {
			return Ok(None);
		}
		let tile_range = self.refine();
		let min_lod = self.min_lod();

		if tile_range.is_empty() {
			return Ok(None);
		}

		Ok(Some(NodeRanges {
			srs: self.node.srs.clone(),
			lod_range: LodRange::new(min_lod.min(self.lod), self.lod)?,
			tile_range,
		}))
	}

	/// Converts a dataset point into the node SRS; inside-node points
	/// grow the local extents.
	fn convert(&mut self, x: f64, y: f64) -> Option<[f64; 2]> {
		let point = self.ds2node.convert_2d([x, y]).ok()?;
		if !self.node.extents.contains(point) {
			return None;
		}
		self.local_extents.update(point);
		Some(point)
	}

	/// Coarse sampling: marks grid points landing inside the node and
	/// derives the best (deepest) lod from the projected pixel closest to
	/// the dataset center.
	fn sample(&mut self) -> bool {
		let pane = self.node.extents.size();
		let ds_center = self.extents.center();
		let (px_width, px_height) = self.descriptor.pixel_size();
		let (hx, hy) = (px_width / 2.0, px_height / 2.0);

		let mut best_lod: Option<f64> = None;
		let mut best_distance = f64::MAX;

		for j in 0..=STEPS {
			let y = self.extents.y_min + f64::from(j) * self.step.1;
			for i in 0..=STEPS {
				let x = self.extents.x_min + f64::from(i) * self.step.0;

				// try to convert grid point to node's SRS
				let Some(projected) = self.convert(x, y) else { continue };
				let index = (j * (STEPS + 1) + i) as usize;
				self.grid[index] = true;
				self.projected[index] = projected;

				// make the point a pixel center, fixing coordinates on
				// the boundary
				let mut p = [x, y];
				if i == 0 {
					p[0] += hx;
				} else if i == STEPS {
					p[0] -= hx;
				}
				if j == 0 {
					p[1] += hy;
				} else if j == STEPS {
					p[1] -= hy;
				}

				// convert the pixel around the grid point
				let Some(c0) = self.convert(p[0] - hx, p[1] - hy) else { continue };
				let Some(c1) = self.convert(p[0] - hx, p[1] + hy) else { continue };
				let Some(c2) = self.convert(p[0] + hx, p[1] + hy) else { continue };
				let Some(c3) = self.convert(p[0] + hx, p[1] - hy) else { continue };

				// distance between the pixel center and the dataset center
				let distance = ((p[0] - ds_center[0]).powi(2) + (p[1] - ds_center[1]).powi(2)).sqrt();
				if distance >= best_distance {
					continue;
				}

				// approximate projected pixel area
				let px_area = triangle_area_2d(c0, c1, c2) + triangle_area_2d(c2, c3, c0);
				if px_area <= 0.0 {
					continue;
				}

				// best lod: divide the node's pane area by the tile area,
				// square root for tiles per side, log2 for the lod;
				// NB: log2(sqrt(a)) = 0.5 * log2(a)
				// NB: calculated in two multiplications to overcome
				// precision loss on huge panes
				let tmp = (pane.width * self.inv_gsd_scale * self.inv_gsd_scale) / (px_area * tile_area());
				let lod = 0.5 * (tmp * pane.height).log2();

				// sanity check: no negative lod
				if lod >= 0.0 {
					best_lod = Some(lod);
					best_distance = distance;
				}
			}
		}

		let Some(best_lod) = best_lod else { return false };

		// round to an integral lod
		let computed = best_lod.ceil() as u8;
		if u32::from(self.node.id.lod) + u32::from(computed) > 31 {
			return false;
		}

		// the subtree root must be able to produce tiles at the computed
		// lod: its lowest descendant there must belong to this subtree
		let lowest_child = self.node.id.lowest_child(computed);
		match self.rf.find_node(lowest_child) {
			Some(owner) if owner.id == self.node.id => {}
			_ => return false,
		}

		self.local_lod = computed;
		self.lod = self.node.id.lod + computed;

		self.source_block_limit = (
			f64::from(TILE_SIZE) / (self.inv_gsd_scale * self.tile_fraction_limit),
			f64::from(TILE_SIZE) / (self.inv_gsd_scale * self.tile_fraction_limit),
		);

		true
	}

	/// Border refinement: cells with 1-3 valid corners are subdivided
	/// until the source-pixel span gets too small; every newly valid point
	/// grows the local extents. Returns the tile range of the local
	/// extents at the bottom lod (global coordinates).
	fn refine(&mut self) -> TileRange {
		for j in 1..=STEPS {
			let y = self.extents.y_min + f64::from(j - 1) * self.step.1;
			for i in 1..=STEPS {
				let x = self.extents.x_min + f64::from(i - 1) * self.step.0;

				let at = |grid: &Vec<bool>, jj: u32, ii: u32| grid[(jj * (STEPS + 1) + ii) as usize];
				let c00 = at(&self.grid, j - 1, i - 1);
				let c01 = at(&self.grid, j, i - 1);
				let c10 = at(&self.grid, j - 1, i);
				let c11 = at(&self.grid, j, i);

				let corners = usize::from(c00) + usize::from(c01) + usize::from(c10) + usize::from(c11);
				if corners == 0 || corners == 4 {
					continue;
				}

				// border cell
				let cell = Extents2::new(x, y, x + self.step.0, y + self.step.1);
				let point = |valid: bool, jj: u32, ii: u32| -> Option<[f64; 2]> {
					valid.then(|| self.projected[(jj * (STEPS + 1) + ii) as usize])
				};
				let corners = [
					point(c00, j - 1, i - 1),
					point(c01, j, i - 1),
					point(c11, j, i),
					point(c10, j - 1, i),
				];
				self.divide_border_block(self.step_in_pixels, cell, corners);
			}
		}

		// compose the tile range from all 4 corners of the local extents
		let pane = self.node.extents.size();
		let tiles = 1u32 << self.local_lod;
		let tile_size = (pane.width / f64::from(tiles), pane.height / f64::from(tiles));
		let origin = (self.node.extents.x_min, self.node.extents.y_max);

		let mut range = TileRange::empty();
		if self.local_extents.is_empty() {
			return range;
		}
		for corner in [
			self.local_extents.ll(),
			self.local_extents.ul(),
			self.local_extents.ur(),
			self.local_extents.lr(),
		] {
			let tx = ((corner[0] - origin.0) / tile_size.0).floor();
			let ty = ((origin.1 - corner[1]) / tile_size.1).floor();
			let clamp = |value: f64| (value.max(0.0) as u32).min(tiles - 1);
			range.update(clamp(tx), clamp(ty));
		}

		// make global
		TileRange {
			x_min: (self.node.id.x << self.local_lod) + range.x_min,
			y_min: (self.node.id.y << self.local_lod) + range.y_min,
			x_max: (self.node.id.x << self.local_lod) + range.x_max,
			y_max: (self.node.id.y << self.local_lod) + range.y_max,
		}
	}

	fn divide_border_block(&mut self, block_px: (f64, f64), extents: Extents2, corners: [Option<[f64; 2]>; 4]) {
		if block_px.0 < self.source_block_limit.0 && block_px.1 < self.source_block_limit.1 {
			// too little source
			return;
		}

		// halve the pixel size
		let block_px = (block_px.0 / 2.0, block_px.1 / 2.0);

		let center_point = extents.center();

		// try to transform the 5 points of the cross in the block center
		let center = self.convert(center_point[0], center_point[1]);
		let left = self.convert(extents.x_min, center_point[1]);
		let right = self.convert(extents.x_max, center_point[1]);
		let lower = self.convert(center_point[0], extents.y_min);
		let upper = self.convert(center_point[0], extents.y_max);

		let partial = |c: &[Option<[f64; 2]>; 4]| {
			let count = c.iter().filter(|corner| corner.is_some()).count();
			count > 0 && count < 4
		};

		// construct 4 sub-blocks and try again
		let ll = [corners[0], left, center, lower];
		if partial(&ll) {
			self.divide_border_block(
				block_px,
				Extents2::new(extents.x_min, extents.y_min, center_point[0], center_point[1]),
				ll,
			);
		}

		let ul = [left, corners[1], upper, center];
		if partial(&ul) {
			self.divide_border_block(
				block_px,
				Extents2::new(extents.x_min, center_point[1], center_point[0], extents.y_max),
				ul,
			);
		}

		let ur = [center, upper, corners[2], right];
		if partial(&ur) {
			self.divide_border_block(
				block_px,
				Extents2::new(center_point[0], center_point[1], extents.x_max, extents.y_max),
				ur,
			);
		}

		let lr = [lower, center, right, corners[3]];
		if partial(&lr) {
			self.divide_border_block(
				block_px,
				Extents2::new(center_point[0], extents.y_min, extents.x_max, center_point[1]),
				lr,
			);
		}
	}

	/// Top lod from the pane-to-footprint area ratio.
	fn min_lod(&self) -> u8 {
		let pane = self.node.extents.size();
		let local = self.local_extents.size();

		let mut lod = 0.5 * ((pane.width / local.width) * (pane.height / local.height)).log2();
		if lod < 0.0 {
			lod = 0.0;
		} else {
			lod = lod.floor();
		}

		self.node.id.lod + lod as u8
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use gdal::DriverManager;
	use std::path::Path;
	use tilecast_gdal::register_all;

	fn create_raster(path: &Path, bands: usize, byte: bool, pixel_deg: f64, center: (f64, f64)) {
		register_all();
		let size = 200usize;
		let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
		let mut dataset = if byte {
			driver
				.create_with_band_type::<u8, _>(path.to_str().unwrap(), size, size, bands)
				.unwrap()
		} else {
			driver
				.create_with_band_type::<f32, _>(path.to_str().unwrap(), size, size, bands)
				.unwrap()
		};
		dataset.set_spatial_ref(&parse_srs("EPSG:4326").unwrap()).unwrap();
		let half = pixel_deg * size as f64 / 2.0;
		dataset
			.set_geo_transform(&[center.0 - half, pixel_deg, 0.0, center.1 + half, 0.0, -pixel_deg])
			.unwrap();
	}

	fn probe(path: &Path) -> DatasetDescriptor {
		DatasetDescriptor::probe(path).unwrap()
	}

	#[test]
	fn auto_detection() {
		let dir = tempfile::tempdir().unwrap();

		let rgb = dir.path().join("rgb.tif");
		create_raster(&rgb, 3, false, 0.001, (14.0, 0.0));
		assert_eq!(detect_type(&probe(&rgb), None).unwrap(), DatasetType::Ophoto);

		let dem = dir.path().join("dem.tif");
		create_raster(&dem, 1, false, 0.001, (14.0, 0.0));
		assert_eq!(detect_type(&probe(&dem), None).unwrap(), DatasetType::Dem);

		let mono = dir.path().join("mono.tif");
		create_raster(&mono, 1, true, 0.001, (14.0, 0.0));
		assert_eq!(detect_type(&probe(&mono), None).unwrap(), DatasetType::Ophoto);

		// forced type wins
		assert_eq!(
			detect_type(&probe(&dem), Some(DatasetType::Ophoto)).unwrap(),
			DatasetType::Ophoto
		);
	}

	#[test]
	fn gsd_of_a_millidegree_pixel_at_the_equator() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("dem.tif");
		create_raster(&path, 1, false, 0.001, (14.0, 0.0));

		let registry = Registry::builtin();
		let rf = registry.reference_frame("webmerc").unwrap();
		let gsd = compute_gsd(&probe(&path), &registry, rf).unwrap();

		// 0.001 degree at the equator is about 111.32 m
		assert!((gsd - 111.32).abs() / 111.32 < 0.01, "gsd {gsd}");
	}

	#[test]
	fn measure_produces_sane_ranges() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("dem.tif");
		create_raster(&path, 1, false, 0.001, (14.0, 49.0));

		let registry = Registry::builtin();
		let rf = registry.reference_frame("webmerc").unwrap();
		let measurement = measure(&probe(&path), &registry, rf, &CalipersOptions::default()).unwrap();

		assert_eq!(measurement.dataset_type, DatasetType::Dem);
		assert_eq!(measurement.nodes.len(), 1);

		let node = &measurement.nodes[0];
		assert_eq!(node.srs, "pseudomerc");
		assert!(node.lod_range.min <= node.lod_range.max);
		// a 0.2 x 0.2 degree dataset is tiny: deep bottom lod
		assert!(node.lod_range.max > 8, "lod range {:?}", node.lod_range);

		// the tile range must lie within the bottom lod's grid
		let tiles = 1u64 << node.lod_range.max;
		assert!(u64::from(node.tile_range.x_max) < tiles);
		assert!(u64::from(node.tile_range.y_max) < tiles);
	}

	#[test]
	fn measure_is_idempotent() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("dem.tif");
		create_raster(&path, 1, false, 0.002, (14.0, 49.0));

		let registry = Registry::builtin();
		let rf = registry.reference_frame("webmerc").unwrap();
		let descriptor = probe(&path);
		let first = measure(&descriptor, &registry, rf, &CalipersOptions::default()).unwrap();
		let second = measure(&descriptor, &registry, rf, &CalipersOptions::default()).unwrap();
		assert_eq!(first, second);
	}

	#[test]
	fn identity_scale_is_accepted() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("dem.tif");
		create_raster(&path, 1, false, 0.002, (14.0, 49.0));

		let registry = Registry::builtin();
		let rf = registry.reference_frame("webmerc").unwrap();
		let options = CalipersOptions {
			dem_to_ophoto_scale: 1.0,
			..CalipersOptions::default()
		};
		let measurement = measure(&probe(&path), &registry, rf, &options).unwrap();
		assert_eq!(measurement.nodes.len(), 1);
	}

	#[test]
	fn dataset_outside_node_produces_nothing() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("dem.tif");
		// beyond the web-mercator latitude cutoff
		create_raster(&path, 1, false, 0.001, (14.0, 89.0));

		let registry = Registry::builtin();
		let rf = registry.reference_frame("webmerc").unwrap();
		let measurement = measure(&probe(&path), &registry, rf, &CalipersOptions::default()).unwrap();
		assert!(measurement.nodes.is_empty());
	}

	#[test]
	fn writer_formats_ranges() {
		let measurement = Measurement {
			gsd: 12.5,
			dataset_type: DatasetType::Dem,
			nodes: vec![NodeRanges {
				srs: "pseudomerc".to_owned(),
				lod_range: LodRange::new(10, 11).unwrap(),
				tile_range: TileRange::new(4, 6, 5, 7).unwrap(),
			}],
		};
		let mut out = Vec::new();
		measurement.write(&mut out).unwrap();
		let text = String::from_utf8(out).unwrap();
		assert_eq!(text, "gsd: 12.5\npseudomerc: 10,11/2,3:2,3;4,6:5,7\n");
	}
}
