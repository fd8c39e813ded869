//! DEM-backed surface generator.
//!
//! Serves metatiles, meshes, navtiles, 2D masks and credits generated on
//! demand from a single DEM raster. Preparation probes the dataset and
//! derives the tile index; tile requests become deferred tasks that sample
//! the DEM through the worker pool.

use super::surface::{self, TilesetProperties};
use super::{Generator, GeneratorCore, GeneratorFactory, Params, Task};
use crate::file_info::{FileFlavor, FileInfo, SurfaceFile, TileFile};
use crate::support::mesh::{GridMesh, MESH_GRID_SIZE};
use crate::support::metatile::{MetatileContext, metatile_bytes};
use anyhow::{Context, Result, bail};
use byteorder::{LE, WriteBytesExt};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, RwLock};
use tilecast_core::{
	Definition, Extents2, FileClass, GenerateError, GeneratorKind, GeneratorType, MaskTree, NodeInfo, Registry,
	Resource, Sink, SinkFileInfo, TileId, TileIndex, definition::SurfaceDem, tile_flags,
};
use tilecast_gdal::{
	Arsenal, CsConvertor, DatasetDescriptor, RasterOperation, RasterRequest, Resampling, geoid_adjusted,
	valid_sample,
};

/// Samples along one tile edge of a generated navtile grid.
const NAVTILE_GRID_SIZE: u32 = 65;
/// Pixels along one edge of a generated 2D mask.
const MASK_SIZE: u32 = 64;

pub struct SurfaceDemFactory;

impl GeneratorFactory for SurfaceDemFactory {
	fn kind(&self) -> GeneratorKind {
		GeneratorKind::new(GeneratorType::Surface, SurfaceDem::DRIVER)
	}

	fn create(&self, params: Params) -> Result<Arc<dyn Generator>> {
		Ok(Arc::new(SurfaceDemGenerator::new(params)?))
	}
}

struct SurfaceState {
	properties: TilesetProperties,
	index: TileIndex,
}

pub struct SurfaceDemGenerator {
	core: GeneratorCore,
	definition: SurfaceDem,
	dem_dataset: String,
	mask: Option<MaskTree>,
	state: RwLock<Option<Arc<SurfaceState>>>,
}

impl SurfaceDemGenerator {
	fn new(params: Params) -> Result<SurfaceDemGenerator> {
		let core = GeneratorCore::new(params)?;

		let definition = match core.resource().definition()? {
			Definition::SurfaceDem(definition) => definition,
			_ => bail!("resource <{}> is not a surface-dem definition", core.resource().id),
		};

		let dem_dataset = core.absolute_dataset(&definition.dataset);
		let mask = match &definition.mask {
			Some(mask) => core
				.absolute_dataset_rf(mask)
				.map(|path| MaskTree::from_path(&path))
				.transpose()?,
			None => None,
		};

		let generator = SurfaceDemGenerator {
			core,
			definition,
			dem_dataset,
			mask,
			state: RwLock::new(None),
		};
		generator.load_files()?;
		Ok(generator)
	}

	/// Tries to reuse previously generated files; flips ready on success.
	fn load_files(&self) -> Result<()> {
		let Some((mut properties, index)) = surface::load_surface_files(&self.core) else {
			log::debug!("Generator for <{}> not ready.", self.core.resource().id);
			return Ok(());
		};

		if properties.update(&self.definition) {
			// something changed in properties, update
			properties.save(&surface::config_path(&self.core))?;
		}

		*self.state.write().unwrap() = Some(Arc::new(SurfaceState { properties, index }));
		self.core.make_ready()?;
		Ok(())
	}

	fn state(&self) -> Result<Arc<SurfaceState>, GenerateError> {
		self
			.state
			.read()
			.unwrap()
			.clone()
			.ok_or_else(|| GenerateError::Unavailable("Generator not ready.".to_owned()))
	}

	fn build_properties(&self) -> TilesetProperties {
		let resource = self.core.resource();
		TilesetProperties {
			id: resource.id.full_id(),
			reference_frame: resource.id.reference_frame.clone(),
			credits: resource.credits.clone(),
			lod_range: resource.lod_range,
			tile_range: resource.tile_range,
			revision: resource.revision,
			nominal_texel_size: self.definition.nominal_texel_size,
			merge_bottom_lod: self.definition.merge_bottom_lod,
		}
	}

	/// Derives the tile index by descending the reference-frame tree and
	/// marking tiles whose extents intersect the dataset. Subtrees with no
	/// dataset overlap are pruned.
	fn build_tile_index(&self, descriptor: &DatasetDescriptor) -> Result<TileIndex> {
		let resource = self.core.resource();
		let rf = self.core.reference_frame().map_err(|err| anyhow::anyhow!("{err}"))?;
		let registry = self.core.registry();

		let mut builder = TileIndex::builder();
		let mut converters: HashMap<String, CsConvertor> = HashMap::new();

		let range = resource.tile_range;
		for y in range.y_min..=range.y_max {
			for x in range.x_min..=range.x_max {
				let root = TileId {
					lod: resource.lod_range.min,
					x,
					y,
				};
				self.descend(root, rf, registry, descriptor, &mut converters, &mut builder)?;
			}
		}

		Ok(builder.build())
	}

	fn descend(
		&self,
		tile: TileId,
		rf: &tilecast_core::ReferenceFrame,
		registry: &Arc<Registry>,
		descriptor: &DatasetDescriptor,
		converters: &mut HashMap<String, CsConvertor>,
		builder: &mut tilecast_core::TileIndexBuilder,
	) -> Result<()> {
		let resource = self.core.resource();
		if tile.lod > resource.lod_range.max {
			return Ok(());
		}
		if let Some(mask) = &self.mask {
			if !mask.covers(tile) {
				return Ok(());
			}
		}

		let Some(info) = NodeInfo::find(rf, tile) else {
			return Ok(());
		};
		if !info.productive() {
			// structural node: keep descending, children may be productive
			for child in tile.children() {
				self.descend(child, rf, registry, descriptor, converters, builder)?;
			}
			return Ok(());
		}

		let srs = info.srs().to_owned();
		if !converters.contains_key(&srs) {
			let def = registry.srs_def(&srs)?.def.clone();
			converters.insert(srs.clone(), CsConvertor::new(&def, &descriptor.srs)?);
		}
		let converter = converters.get(&srs).expect("just inserted");

		// project the tile corners into the dataset SRS
		let extents = info.extents;
		let mut converted = Extents2::empty();
		let mut corner_count = 0;
		for corner in [extents.ll(), extents.ul(), extents.ur(), extents.lr()] {
			if let Ok(point) = converter.convert_2d(corner) {
				converted.update(point);
				corner_count += 1;
			}
		}
		if corner_count == 0 {
			return Ok(());
		}

		let dataset = &descriptor.extents;
		let overlaps = converted.x_min <= dataset.x_max
			&& converted.x_max >= dataset.x_min
			&& converted.y_min <= dataset.y_max
			&& converted.y_max >= dataset.y_min;
		if !overlaps {
			return Ok(());
		}

		if resource.lod_range.contains(tile.lod) {
			let inside = corner_count == 4
				&& converted.x_min >= dataset.x_min
				&& converted.x_max <= dataset.x_max
				&& converted.y_min >= dataset.y_min
				&& converted.y_max <= dataset.y_max;
			let mut flags = tile_flags::MESH | tile_flags::NAVTILE;
			if inside {
				flags |= tile_flags::WATERTIGHT;
			}
			builder.set(tile, flags);
		}

		for child in tile.children() {
			self.descend(child, rf, registry, descriptor, converters, builder)?;
		}
		Ok(())
	}

	fn tile_task(&self, tile: TileId, kind: TileFile, flavor: FileFlavor) -> Result<Task, GenerateError> {
		let task = TileTask {
			tile,
			kind,
			flavor,
			resource: self.core.resource().clone(),
			registry: self.core.registry().clone(),
			state: self.state()?,
			dem_dataset: self.dem_dataset.clone(),
			geoid_grid: self.definition.geoid_grid.clone(),
			mask: self.mask.clone(),
			display_size: self.definition.display_size,
		};
		Ok(Task::Run(Box::new(move |sink, arsenal| {
			match task.run(sink, arsenal) {
				Ok((data, info)) => sink.content(data, &info),
				Err(err) => sink.error(err),
			}
		})))
	}
}

impl Generator for SurfaceDemGenerator {
	fn core(&self) -> &GeneratorCore {
		&self.core
	}

	fn prepare_impl(&self, _arsenal: &Arsenal) -> Result<()> {
		let resource = self.core.resource();
		log::debug!("Preparing <{}>.", resource.id);

		// try to open the dataset; unreadable datasets fail preparation
		let descriptor = DatasetDescriptor::probe(std::path::Path::new(&self.dem_dataset))
			.with_context(|| format!("cannot probe dem dataset of <{}>", resource.id))?;

		let properties = self.build_properties();
		let index = self.build_tile_index(&descriptor)?;

		properties.save(&surface::config_path(&self.core))?;
		index.save_path(&surface::index_path(&self.core))?;

		*self.state.write().unwrap() = Some(Arc::new(SurfaceState { properties, index }));
		Ok(())
	}

	fn generate_file(&self, file_info: &FileInfo, sink: &dyn Sink) -> Result<Task, GenerateError> {
		match SurfaceFile::parse(&file_info.file)? {
			SurfaceFile::Config => {
				let data = std::fs::read(surface::config_path(&self.core))
					.map_err(|err| GenerateError::InternalError(format!("cannot read tileset config: {err}")))?;
				sink.content(data, &SinkFileInfo::new("application/json", FileClass::Config));
				Ok(Task::Done)
			}
			SurfaceFile::Index => {
				let data = std::fs::read(surface::index_path(&self.core))
					.map_err(|err| GenerateError::InternalError(format!("cannot read tileset index: {err}")))?;
				sink.content(data, &SinkFileInfo::new("application/octet-stream", FileClass::Data));
				Ok(Task::Done)
			}
			SurfaceFile::Definition => {
				let state = self.state()?;
				let document = surface::definition_document(&self.core, &state.properties);
				sink.content(
					serde_json::to_vec_pretty(&document).expect("document is serializable"),
					&SinkFileInfo::new("application/json", FileClass::Config),
				);
				Ok(Task::Done)
			}
			SurfaceFile::Tile { tile, kind, flavor } => self.tile_task(tile, kind, flavor),
		}
	}
}

/// A deferred tile-generation job; owns everything it needs so that it can
/// outlive the lookup that produced it.
struct TileTask {
	tile: TileId,
	kind: TileFile,
	flavor: FileFlavor,
	resource: Resource,
	registry: Arc<Registry>,
	state: Arc<SurfaceState>,
	dem_dataset: String,
	geoid_grid: Option<String>,
	mask: Option<MaskTree>,
	display_size: Option<u32>,
}

impl TileTask {
	fn run(&self, sink: &dyn Sink, arsenal: &Arsenal) -> Result<(Vec<u8>, SinkFileInfo), GenerateError> {
		sink.check_aborted()?;
		match (self.kind, self.flavor) {
			(TileFile::Meta, FileFlavor::Regular) => self.metatile(sink, arsenal),
			(TileFile::Meta, FileFlavor::Debug) => self.debug_node(),
			(TileFile::Mesh, _) => self.mesh(sink, arsenal),
			(TileFile::Navtile, _) => self.navtile(sink, arsenal),
			(TileFile::Mask, flavor) => self.mask_tile(sink, arsenal, flavor),
			(TileFile::Credits, _) => self.credits(),
		}
	}

	fn reference_frame(&self) -> Result<&tilecast_core::ReferenceFrame, GenerateError> {
		self
			.registry
			.reference_frame(&self.resource.id.reference_frame)
			.map_err(|err| GenerateError::InvalidConfiguration(format!("{err:#}")))
	}

	fn node_info(&self) -> Result<(NodeInfo<'_>, String), GenerateError> {
		let rf = self.reference_frame()?;
		let info = NodeInfo::find(rf, self.tile)
			.ok_or_else(|| GenerateError::NotFound("TileId outside of valid reference frame tree.".to_owned()))?;
		let srs = self
			.registry
			.srs_def(info.srs())
			.map_err(|err| GenerateError::InternalError(format!("{err:#}")))?
			.def
			.clone();
		Ok((info, srs))
	}

	/// Samples the DEM over the tile at grid resolution and converts every
	/// valid sample with `convert`.
	fn sample_grid(
		&self,
		sink: &dyn Sink,
		arsenal: &Arsenal,
		grid_size: u32,
		convert: impl Fn([f64; 3]) -> Option<[f64; 3]>,
	) -> Result<(Vec<Option<[f64; 3]>>, Extents2), GenerateError> {
		let (info, srs) = self.node_info()?;
		let extents = info.extents;

		let dem = arsenal.warper.warp(
			&RasterRequest {
				operation: RasterOperation::Dem,
				dataset: self.dem_dataset.clone(),
				srs,
				extents: extents.plus_half_pixel(grid_size - 1, grid_size - 1),
				size: (grid_size, grid_size),
				resampling: Resampling::Dem,
				mask: None,
			},
			sink,
		)?;
		sink.check_aborted()?;

		let size = extents.size();
		let step = (
			size.width / f64::from(grid_size - 1),
			size.height / f64::from(grid_size - 1),
		);

		let mut points = Vec::with_capacity((grid_size * grid_size) as usize);
		for j in 0..grid_size {
			let y = extents.y_max - f64::from(j) * step.1;
			for i in 0..grid_size {
				let height = dem.sample(i, j, 0);
				if !valid_sample(height) {
					points.push(None);
					continue;
				}
				let x = extents.x_min + f64::from(i) * step.0;
				points.push(convert([x, y, height]));
			}
		}
		Ok((points, extents))
	}

	fn metatile(&self, sink: &dyn Sink, arsenal: &Arsenal) -> Result<(Vec<u8>, SinkFileInfo), GenerateError> {
		let rf = self.reference_frame()?;
		let context = MetatileContext {
			resource: &self.resource,
			registry: &self.registry,
			rf,
			tile_index: &self.state.index,
			dem_dataset: &self.dem_dataset,
			geoid_grid: self.geoid_grid.as_deref(),
			mask: self.mask.as_ref(),
			display_size: self.display_size,
		};
		let data = metatile_bytes(self.tile, sink, arsenal, &context)?;
		Ok((data, SinkFileInfo::new("application/octet-stream", FileClass::Data)))
	}

	fn debug_node(&self) -> Result<(Vec<u8>, SinkFileInfo), GenerateError> {
		let flags = self.state.index.get(self.tile);
		let children: Vec<bool> = self
			.tile
			.children()
			.into_iter()
			.map(|child| self.state.index.valid_subtree(child))
			.collect();
		let document = serde_json::json!({
			"lod": self.tile.lod,
			"x": self.tile.x,
			"y": self.tile.y,
			"mesh": tile_flags::is_real(flags),
			"watertight": tile_flags::is_watertight(flags),
			"navtile": flags & tile_flags::NAVTILE != 0,
			"children": children,
		});
		Ok((
			serde_json::to_vec_pretty(&document).expect("document is serializable"),
			SinkFileInfo::new("application/json", FileClass::Data),
		))
	}

	fn mesh(&self, sink: &dyn Sink, arsenal: &Arsenal) -> Result<(Vec<u8>, SinkFileInfo), GenerateError> {
		let flags = self.state.index.get(self.tile);
		if !tile_flags::is_real(flags) {
			return Err(GenerateError::NotFound("No mesh for this tile.".to_owned()));
		}

		let rf = self.reference_frame()?;
		let physical = self
			.registry
			.srs_def(&rf.model.physical_srs)
			.map_err(|err| GenerateError::InternalError(format!("{err:#}")))?
			.def
			.clone();
		let (_, srs) = self.node_info()?;
		let sds = geoid_adjusted(&srs, self.geoid_grid.as_deref());
		let conv = CsConvertor::new(&sds, &physical)
			.map_err(|err| GenerateError::InternalError(format!("{err:#}")))?;

		let (points, _) = self.sample_grid(sink, arsenal, MESH_GRID_SIZE, |p| conv.convert_3d(p).ok())?;
		let mesh = GridMesh::from_grid(&points, MESH_GRID_SIZE, MESH_GRID_SIZE);
		if mesh.is_empty() {
			return Err(GenerateError::NotFound("No mesh for this tile.".to_owned()));
		}

		let data = mesh
			.encode()
			.map_err(|err| GenerateError::InternalError(format!("cannot serialize mesh: {err:#}")))?;
		Ok((data, SinkFileInfo::new("application/octet-stream", FileClass::Data)))
	}

	fn navtile(&self, sink: &dyn Sink, arsenal: &Arsenal) -> Result<(Vec<u8>, SinkFileInfo), GenerateError> {
		let flags = self.state.index.get(self.tile);
		if flags & tile_flags::NAVTILE == 0 {
			return Err(GenerateError::NotFound("No navtile for this tile.".to_owned()));
		}

		let rf = self.reference_frame()?;
		let navigation = self
			.registry
			.srs_def(&rf.model.navigation_srs)
			.map_err(|err| GenerateError::InternalError(format!("{err:#}")))?
			.def
			.clone();
		let (_, srs) = self.node_info()?;
		let sds = geoid_adjusted(&srs, self.geoid_grid.as_deref());
		let nav_conv = CsConvertor::new(&sds, &navigation)
			.map_err(|err| GenerateError::InternalError(format!("{err:#}")))?;

		let (points, extents) =
			self.sample_grid(sink, arsenal, NAVTILE_GRID_SIZE, |p| nav_conv.convert_3d(p).ok())?;

		// navigation-space heights with the overall range in the header
		let mut height_range = (f64::INFINITY, f64::NEG_INFINITY);
		for point in points.iter().flatten() {
			height_range.0 = height_range.0.min(point[2]);
			height_range.1 = height_range.1.max(point[2]);
		}
		if height_range.0 > height_range.1 {
			return Err(GenerateError::NotFound("No navtile for this tile.".to_owned()));
		}

		let mut data = Vec::new();
		data.write_all(b"TCNT").expect("vec write");
		data.write_u16::<LE>(1).expect("vec write");
		data.write_u16::<LE>(NAVTILE_GRID_SIZE as u16).expect("vec write");
		data.write_u16::<LE>(NAVTILE_GRID_SIZE as u16).expect("vec write");
		for value in [extents.x_min, extents.y_min, extents.x_max, extents.y_max, height_range.0, height_range.1] {
			data.write_f64::<LE>(value).expect("vec write");
		}
		for point in &points {
			let height = point.map(|p| p[2] as f32).unwrap_or(f32::NAN);
			data.write_f32::<LE>(height).expect("vec write");
		}
		Ok((data, SinkFileInfo::new("application/octet-stream", FileClass::Data)))
	}

	fn mask_tile(
		&self,
		sink: &dyn Sink,
		arsenal: &Arsenal,
		flavor: FileFlavor,
	) -> Result<(Vec<u8>, SinkFileInfo), GenerateError> {
		let flags = self.state.index.get(self.tile);
		if !tile_flags::is_real(flags) {
			return Err(match flavor {
				FileFlavor::Debug => GenerateError::EmptyDebugMask("No mesh for this tile.".to_owned()),
				FileFlavor::Regular => GenerateError::NotFound("No mesh for this tile.".to_owned()),
			});
		}

		// watertight tiles have a constant full mask; no sampling needed
		let coverage: Vec<u8> = if tile_flags::is_watertight(flags) {
			vec![255u8; (MASK_SIZE * MASK_SIZE) as usize]
		} else {
			let (points, _) = self.sample_grid(sink, arsenal, MASK_SIZE, Some)?;
			points
				.iter()
				.map(|point| if point.is_some() { 255 } else { 0 })
				.collect()
		};

		let mut data = Vec::new();
		data.write_all(b"TCMK").expect("vec write");
		data.write_u16::<LE>(1).expect("vec write");
		data.write_u16::<LE>(MASK_SIZE as u16).expect("vec write");
		data.write_u16::<LE>(MASK_SIZE as u16).expect("vec write");
		data.extend_from_slice(&coverage);
		Ok((data, SinkFileInfo::new("application/octet-stream", FileClass::Data)))
	}

	fn credits(&self) -> Result<(Vec<u8>, SinkFileInfo), GenerateError> {
		let document = serde_json::json!({ "credits": self.resource.credits });
		Ok((
			serde_json::to_vec_pretty(&document).expect("document is serializable"),
			SinkFileInfo::new("application/json", FileClass::Data),
		))
	}
}
