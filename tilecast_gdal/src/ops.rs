//! GDAL operations executed inside worker processes.
//!
//! Everything here may leak, crash or corrupt its own process; that is why
//! it runs behind the fork boundary. The parent only ever sees the encoded
//! results.

use crate::raster::{INVALID_VALUE, Raster, valid_sample};
use crate::requests::{
	HeightcodeMode, HeightcodeRequest, NavHeightcodeRequest, RasterOperation, RasterRequest, Resampling,
};
use crate::srs::{CsConvertor, geoid_adjusted, parse_srs};
use anyhow::{Context, Result, bail, ensure};
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use gdal_sys::{CPLErr, CPLGetLastErrorMsg, GDALReprojectImage, GDALResampleAlg};
use std::ffi::CStr;
use std::ptr::{null, null_mut};

fn as_gdal_alg(resampling: Resampling) -> GDALResampleAlg::Type {
	use GDALResampleAlg::*;
	match resampling {
		Resampling::NearestNeighbour => GRA_NearestNeighbour,
		Resampling::Bilinear => GRA_Bilinear,
		Resampling::Cubic => GRA_Cubic,
		Resampling::CubicSpline => GRA_CubicSpline,
		Resampling::Lanczos => GRA_Lanczos,
		Resampling::Average => GRA_Average,
		Resampling::Min => GRA_Min,
		Resampling::Max => GRA_Max,
		Resampling::Dem => GRA_Bilinear,
	}
}

fn last_gdal_error() -> String {
	// SAFETY: CPLGetLastErrorMsg returns a borrowed, NUL-terminated string.
	unsafe { CStr::from_ptr(CPLGetLastErrorMsg()).to_string_lossy().into_owned() }
}

/// Warps `src` into a fresh f64 MEM dataset covering `request.extents` at
/// `request.size`, using the given algorithm. Pixels not covered by the
/// source keep [`INVALID_VALUE`].
fn warp_to_mem(
	src: &Dataset,
	request: &RasterRequest,
	dst_srs: &SpatialRef,
	bands: usize,
	alg: GDALResampleAlg::Type,
) -> Result<Dataset> {
	let (width, height) = (request.size.0 as usize, request.size.1 as usize);
	let driver = DriverManager::get_driver_by_name("MEM")?;
	let mut dst = driver.create_with_band_type::<f64, _>("", width, height, bands)?;
	dst.set_spatial_ref(dst_srs)?;
	dst.set_geo_transform(&[
		request.extents.x_min,
		(request.extents.x_max - request.extents.x_min) / width as f64,
		0.0,
		request.extents.y_max,
		0.0,
		(request.extents.y_min - request.extents.y_max) / height as f64,
	])?;
	for band_index in 1..=bands {
		let mut band = dst.rasterband(band_index)?;
		band.set_no_data_value(Some(INVALID_VALUE))?;
		band.fill(INVALID_VALUE, None)?;
	}

	// SAFETY: both datasets are valid for the duration of the call; the
	// simple entry point takes its SRSs from the datasets themselves.
	unsafe {
		let rv = GDALReprojectImage(
			src.c_dataset(),
			null(),
			dst.c_dataset(),
			null(),
			alg,
			0.0,
			0.0,
			None,
			null_mut(),
			null_mut(),
		);
		if rv != CPLErr::CE_None {
			bail!("warp failed: {}", last_gdal_error());
		}
	}

	Ok(dst)
}

fn read_band(dst: &Dataset, band_index: usize, raster: &mut Raster, channel: u32) -> Result<()> {
	let band = dst.rasterband(band_index)?;
	let buffer = band.read_band_as::<f64>()?;
	let data = buffer.data();
	ensure!(
		data.len() == (raster.width * raster.height) as usize,
		"band data length mismatch: expected {} but got {}",
		raster.width * raster.height,
		data.len()
	);
	for (index, &value) in data.iter().enumerate() {
		let x = index as u32 % raster.width;
		let y = index as u32 / raster.width;
		raster.set_sample(x, y, channel, value);
	}
	Ok(())
}

/// Applies an optional mask dataset: pixels where the warped mask is zero
/// or invalid are cleared to [`INVALID_VALUE`] in all channels.
fn apply_mask(request: &RasterRequest, dst_srs: &SpatialRef, raster: &mut Raster) -> Result<()> {
	let Some(mask_path) = &request.mask else {
		return Ok(());
	};
	let mask_src = Dataset::open(mask_path).with_context(|| format!("cannot open mask dataset {mask_path}"))?;
	let mask_ds = warp_to_mem(&mask_src, request, dst_srs, 1, GDALResampleAlg::GRA_NearestNeighbour)?;
	let mut mask = Raster::new(request.size.0, request.size.1, 1);
	read_band(&mask_ds, 1, &mut mask, 0)?;
	for y in 0..raster.height {
		for x in 0..raster.width {
			let value = mask.sample(x, y, 0);
			if !valid_sample(value) || value == 0.0 {
				for channel in 0..raster.channels {
					raster.set_sample(x, y, channel, INVALID_VALUE);
				}
			}
		}
	}
	Ok(())
}

pub(crate) fn warp_raster(request: &RasterRequest) -> Result<Raster> {
	let src =
		Dataset::open(&request.dataset).with_context(|| format!("cannot open dataset {}", request.dataset))?;
	let dst_srs = parse_srs(&request.srs)?;

	let mut raster = match request.operation {
		RasterOperation::Dem => {
			let mut raster = Raster::new(request.size.0, request.size.1, 1);
			let dst = warp_to_mem(&src, request, &dst_srs, 1, as_gdal_alg(request.resampling))?;
			read_band(&dst, 1, &mut raster, 0)?;
			raster
		}
		RasterOperation::ValueMinMax => {
			// three warps; the average filter is intentional so that each
			// output pixel approximates a local 3-value summary
			let mut raster = Raster::new(request.size.0, request.size.1, 3);
			for (channel, alg) in [
				(0, GDALResampleAlg::GRA_Average),
				(1, GDALResampleAlg::GRA_Min),
				(2, GDALResampleAlg::GRA_Max),
			] {
				let dst = warp_to_mem(&src, request, &dst_srs, 1, alg)?;
				read_band(&dst, 1, &mut raster, channel)?;
			}
			raster
		}
		RasterOperation::Image => {
			let bands = src.raster_count().clamp(1, 4);
			let mut raster = Raster::new(request.size.0, request.size.1, bands as u32);
			let dst = warp_to_mem(&src, request, &dst_srs, bands, as_gdal_alg(request.resampling))?;
			for band_index in 1..=bands {
				read_band(&dst, band_index, &mut raster, (band_index - 1) as u32)?;
			}
			raster
		}
	};

	apply_mask(request, &dst_srs, &mut raster)?;
	Ok(raster)
}

/// Something that can answer "height at this working-SRS point".
trait HeightSampler {
	fn sample(&self, p: [f64; 2]) -> Option<f64>;
}

/// Bilinear sampler over one DEM dataset.
struct DemSampler {
	dataset: Dataset,
	to_dataset: CsConvertor,
	geo_transform: [f64; 6],
	size: (usize, usize),
}

impl DemSampler {
	fn open(path: &str, working_srs: &str, geoid_grid: Option<&str>) -> Result<DemSampler> {
		let dataset = Dataset::open(path).with_context(|| format!("cannot open dem {path}"))?;
		let dataset_srs = dataset.spatial_ref()?.to_proj4()?;
		let to_dataset = CsConvertor::new(working_srs, &geoid_adjusted(&dataset_srs, geoid_grid))?;
		let geo_transform = dataset.geo_transform()?;
		let size = dataset.raster_size();
		Ok(DemSampler {
			dataset,
			to_dataset,
			geo_transform,
			size,
		})
	}
}

impl HeightSampler for DemSampler {
	fn sample(&self, p: [f64; 2]) -> Option<f64> {
		let p = self.to_dataset.convert_2d(p).ok()?;
		let gt = &self.geo_transform;
		// north-up datasets only
		let px = (p[0] - gt[0]) / gt[1] - 0.5;
		let py = (p[1] - gt[3]) / gt[5] - 0.5;
		if px < 0.0 || py < 0.0 || px > (self.size.0 - 1) as f64 || py > (self.size.1 - 1) as f64 {
			return None;
		}

		let x0 = px.floor() as isize;
		let y0 = py.floor() as isize;
		let x1 = (x0 + 1).min(self.size.0 as isize - 1);
		let y1 = (y0 + 1).min(self.size.1 as isize - 1);
		let fx = px - x0 as f64;
		let fy = py - y0 as f64;

		let band = self.dataset.rasterband(1).ok()?;
		let mut value_at = |x: isize, y: isize| -> Option<f64> {
			let buffer = band.read_as::<f64>((x, y), (1, 1), (1, 1), None).ok()?;
			let value = buffer.data()[0];
			valid_sample(value).then_some(value)
		};

		let v00 = value_at(x0, y0)?;
		let v10 = value_at(x1, y0)?;
		let v01 = value_at(x0, y1)?;
		let v11 = value_at(x1, y1)?;
		Some(v00 * (1.0 - fx) * (1.0 - fy) + v10 * fx * (1.0 - fy) + v01 * (1.0 - fx) * fy + v11 * fx * fy)
	}
}

/// Bilinear sampler over an in-memory navtile grid.
struct NavtileSampler {
	extents: tilecast_core::Extents2,
	size: (u32, u32),
	heights: Vec<f32>,
	to_sds: CsConvertor,
}

impl NavtileSampler {
	fn new(navtile: &crate::NavtileInfo, working_srs: &str) -> Result<NavtileSampler> {
		let expected = (navtile.size.0 * navtile.size.1) as usize * 4;
		ensure!(
			navtile.raw.len() == expected,
			"navtile payload size mismatch: expected {expected} but got {}",
			navtile.raw.len()
		);
		let heights = navtile
			.raw
			.chunks_exact(4)
			.map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
			.collect();
		Ok(NavtileSampler {
			extents: navtile.extents,
			size: navtile.size,
			heights,
			to_sds: CsConvertor::new(working_srs, &navtile.sds_srs)?,
		})
	}
}

impl HeightSampler for NavtileSampler {
	fn sample(&self, p: [f64; 2]) -> Option<f64> {
		let p = self.to_sds.convert_2d(p).ok()?;
		if !self.extents.contains(p) {
			return None;
		}
		let size = self.extents.size();
		let px = (p[0] - self.extents.x_min) / size.width * f64::from(self.size.0 - 1);
		let py = (self.extents.y_max - p[1]) / size.height * f64::from(self.size.1 - 1);

		let x0 = px.floor() as u32;
		let y0 = py.floor() as u32;
		let x1 = (x0 + 1).min(self.size.0 - 1);
		let y1 = (y0 + 1).min(self.size.1 - 1);
		let fx = px - f64::from(x0);
		let fy = py - f64::from(y0);

		let at = |x: u32, y: u32| f64::from(self.heights[(y * self.size.0 + x) as usize]);
		Some(at(x0, y0) * (1.0 - fx) * (1.0 - fy) + at(x1, y0) * fx * (1.0 - fy) + at(x0, y1) * (1.0 - fx) * fy + at(x1, y1) * fx * fy)
	}
}

/// Heightcodes a vector dataset against a list of samplers (first valid
/// sample wins) and serializes the result as GeoJSON.
fn heightcode_impl(
	vector_dataset: &str,
	samplers: &[Box<dyn HeightSampler>],
	config: &crate::HeightcodeConfig,
) -> Result<Vec<u8>> {
	use gdal::vector::LayerAccess;
	use gdal::{DatasetOptions, GdalOpenFlags};
	use serde_json::{Value, json};

	let dataset = Dataset::open_ex(
		vector_dataset,
		DatasetOptions {
			open_flags: GdalOpenFlags::GDAL_OF_VECTOR | GdalOpenFlags::GDAL_OF_READONLY,
			..DatasetOptions::default()
		},
	)
	.with_context(|| format!("cannot open vector dataset {vector_dataset}"))?;

	let vector_srs = dataset
		.layer(0)
		.ok()
		.and_then(|layer| layer.spatial_ref())
		.map(|srs| srs.to_proj4())
		.transpose()?
		.unwrap_or_else(|| "+proj=longlat +datum=WGS84 +no_defs".to_owned());

	let working_srs = config.working_srs.clone().unwrap_or_else(|| vector_srs.clone());
	let output_srs = config.output_srs.clone().unwrap_or_else(|| vector_srs.clone());
	let to_working = CsConvertor::new(&vector_srs, &working_srs)?;
	let to_output = CsConvertor::new(&working_srs, &output_srs)?;

	let mut features = Vec::new();
	let mut layer_index = 0;
	loop {
		let Ok(mut layer) = dataset.layer(layer_index) else {
			break;
		};
		layer_index += 1;

		let name = layer.name();
		if let Some(wanted) = &config.layers {
			if !wanted.contains(&name) {
				continue;
			}
		}

		for feature in layer.features() {
			let Some(geometry) = feature.geometry() else {
				continue;
			};
			let mut value: Value = serde_json::from_str(&geometry.json()?).context("gdal produced invalid geojson")?;

			let mut clipped = false;
			heightcode_coordinates(
				&mut value,
				&to_working,
				&to_output,
				samplers,
				config,
				&mut clipped,
			)?;
			if clipped {
				continue;
			}

			let mut properties = serde_json::Map::new();
			for (field_name, field_value) in feature.fields() {
				properties.insert(field_name, field_to_json(field_value));
			}

			features.push(json!({
				"type": "Feature",
				"geometry": value,
				"properties": Value::Object(properties),
			}));
		}
	}

	let collection = json!({
		"type": "FeatureCollection",
		"features": features,
	});
	Ok(serde_json::to_vec(&collection)?)
}

/// Walks a GeoJSON coordinate tree, replacing every position with its
/// output-SRS equivalent enriched by a sampled height.
fn heightcode_coordinates(
	value: &mut serde_json::Value,
	to_working: &CsConvertor,
	to_output: &CsConvertor,
	samplers: &[Box<dyn HeightSampler>],
	config: &crate::HeightcodeConfig,
	clipped: &mut bool,
) -> Result<()> {
	use serde_json::Value;

	if let Value::Object(object) = value {
		if let Some(coordinates) = object.get_mut("coordinates") {
			walk_positions(coordinates, &mut |position| {
				let x = position[0];
				let y = position[1];
				let existing_z = position.get(2).copied();

				let working = to_working.convert_2d([x, y])?;
				if let Some(clip) = &config.clip_extents {
					if !clip.contains(working) {
						*clipped = true;
					}
				}

				let z = match (config.mode, existing_z) {
					(HeightcodeMode::Never, z) => z.unwrap_or(0.0),
					(HeightcodeMode::Auto, Some(z)) => z,
					_ => samplers.iter().find_map(|sampler| sampler.sample(working)).unwrap_or(0.0),
				};

				let output = to_output.convert_2d(working)?;
				*position = vec![output[0], output[1], z];
				Ok(())
			})?;
		} else if let Some(Value::Array(geometries)) = object.get_mut("geometries") {
			for geometry in geometries {
				heightcode_coordinates(geometry, to_working, to_output, samplers, config, clipped)?;
			}
		}
	}
	Ok(())
}

/// Applies `apply` to every `[x, y(, z)]` position in a coordinate tree.
fn walk_positions(
	value: &mut serde_json::Value,
	apply: &mut dyn FnMut(&mut Vec<f64>) -> Result<()>,
) -> Result<()> {
	use serde_json::Value;

	let Value::Array(items) = value else {
		return Ok(());
	};
	let is_position = items.first().map(|item| item.is_number()).unwrap_or(false);
	if is_position {
		let mut position: Vec<f64> = items.iter().filter_map(|item| item.as_f64()).collect();
		ensure!(position.len() >= 2, "malformed geojson position");
		apply(&mut position)?;
		*items = position.into_iter().map(|v| Value::from(v)).collect();
	} else {
		for item in items {
			walk_positions(item, apply)?;
		}
	}
	Ok(())
}

fn field_to_json(field_value: Option<gdal::vector::FieldValue>) -> serde_json::Value {
	use gdal::vector::FieldValue;
	use serde_json::Value;
	match field_value {
		Some(FieldValue::IntegerValue(v)) => Value::from(v),
		Some(FieldValue::Integer64Value(v)) => Value::from(v),
		Some(FieldValue::RealValue(v)) => Value::from(v),
		Some(FieldValue::StringValue(v)) => Value::from(v),
		Some(FieldValue::IntegerListValue(v)) => Value::from(v),
		Some(FieldValue::Integer64ListValue(v)) => Value::from(v),
		Some(FieldValue::RealListValue(v)) => Value::from(v),
		Some(FieldValue::StringListValue(v)) => Value::from(v),
		_ => Value::Null,
	}
}

pub(crate) fn heightcode(request: &HeightcodeRequest) -> Result<Vec<u8>> {
	ensure!(!request.raster_datasets.is_empty(), "heightcoding needs at least one dem");

	let working_srs = match &request.config.working_srs {
		Some(srs) => srs.clone(),
		None => {
			let first = Dataset::open(&request.raster_datasets[0].dataset)?;
			first.spatial_ref()?.to_proj4()?
		}
	};

	let mut samplers: Vec<Box<dyn HeightSampler>> = Vec::new();
	for dem in &request.raster_datasets {
		samplers.push(Box::new(DemSampler::open(
			&dem.dataset,
			&working_srs,
			dem.geoid_grid.as_deref(),
		)?));
	}

	let mut config = request.config.clone();
	config.working_srs = Some(working_srs);
	heightcode_impl(&request.vector_dataset, &samplers, &config)
}

pub(crate) fn nav_heightcode(request: &NavHeightcodeRequest) -> Result<Vec<u8>> {
	let working_srs = request
		.config
		.working_srs
		.clone()
		.unwrap_or_else(|| request.navtile.sds_srs.clone());

	let mut samplers: Vec<Box<dyn HeightSampler>> = Vec::new();
	samplers.push(Box::new(NavtileSampler::new(&request.navtile, &working_srs)?));
	samplers.push(Box::new(DemSampler::open(
		&request.fallback_dataset,
		&working_srs,
		request.geoid_grid.as_deref(),
	)?));

	let mut config = request.config.clone();
	config.working_srs = Some(working_srs);
	heightcode_impl(&request.vector_dataset, &samplers, &config)
}
