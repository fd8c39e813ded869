//! Metatile synthesis from a DEM.
//!
//! A metatile's tile range is split into blocks sharing a common
//! reference-frame ancestor; each productive block is sampled from the DEM
//! at super-tile resolution through the worker pool and aggregated into
//! per-tile metanodes (extents, height range, surrogate, texel size, child
//! validity).

use tilecast_core::{
	Extents2, Extents3, GenerateError, GeomExtents, HeightRange, MaskTree, METATILE_SAMPLES_PER_TILE,
	METATILE_SAMPLES_PER_TILE_BIN_LOG, MetaNode, MetaTile, ReferenceFrame, Registry, Resource, RfNode, TileId,
	TileIndex, TileRange, Sink, meta_flags, quad_area, tile_area, tile_extents, tile_flags,
};
use tilecast_gdal::{
	Arsenal, CsConvertor, Raster, RasterOperation, RasterRequest, Resampling, geoid_adjusted, valid_sample,
};

/// One block of a metatile: a rectangle of tiles with a common
/// reference-frame ancestor.
#[derive(Debug)]
pub struct MetatileBlock<'a> {
	/// Tile range at the metatile's lod.
	pub view: TileRange,
	/// The common subtree root; defines the block's SRS.
	pub node: &'a RfNode,
	/// View extents in the node's SRS.
	pub extents: Extents2,
}

/// Splits the metatile containing `tile_id` into blocks. Empty when the
/// metatile lies completely outside the resource's configured range.
pub fn metatile_blocks<'a>(resource: &Resource, rf: &'a ReferenceFrame, tile_id: TileId) -> Vec<MetatileBlock<'a>> {
	if !resource.lod_range.contains(tile_id.lod) {
		return Vec::new();
	}

	let size = rf.metatile_size();
	let world_max = ((1u64 << tile_id.lod) - 1) as u32;
	let origin_x = tile_id.x & !(size - 1);
	let origin_y = tile_id.y & !(size - 1);
	let meta_range = TileRange {
		x_min: origin_x,
		y_min: origin_y,
		x_max: (origin_x + size - 1).min(world_max),
		y_max: (origin_y + size - 1).min(world_max),
	};

	let resource_range = resource.tile_range.scaled_down(tile_id.lod - resource.lod_range.min);
	let Some(view) = meta_range.intersect(&resource_range) else {
		return Vec::new();
	};

	// group the view into maximal rectangles of tiles sharing an owner
	let owner_of = |x: u32, y: u32| rf.find_node(TileId { lod: tile_id.lod, x, y }).map(|node| node.id);

	let mut blocks = Vec::new();
	let mut claimed = std::collections::HashSet::new();
	for y in view.y_min..=view.y_max {
		for x in view.x_min..=view.x_max {
			if claimed.contains(&(x, y)) {
				continue;
			}
			let owner = owner_of(x, y);

			// extend east while the owner matches
			let mut x_max = x;
			while x_max < view.x_max && !claimed.contains(&(x_max + 1, y)) && owner_of(x_max + 1, y) == owner {
				x_max += 1;
			}
			// extend south while whole rows match
			let mut y_max = y;
			'rows: while y_max < view.y_max {
				for xx in x..=x_max {
					if claimed.contains(&(xx, y_max + 1)) || owner_of(xx, y_max + 1) != owner {
						break 'rows;
					}
				}
				y_max += 1;
			}

			for yy in y..=y_max {
				for xx in x..=x_max {
					claimed.insert((xx, yy));
				}
			}

			let Some(owner) = owner else { continue };
			let node = rf.node(&owner).expect("owner came from this frame");
			let block_view = TileRange {
				x_min: x,
				y_min: y,
				x_max,
				y_max,
			};

			// block extents from its corner tiles: upper-left and
			// lower-right in tile coordinates
			let ul = tile_extents(node, TileId { lod: tile_id.lod, x, y });
			let lr = tile_extents(
				node,
				TileId {
					lod: tile_id.lod,
					x: x_max,
					y: y_max,
				},
			);
			blocks.push(MetatileBlock {
				view: block_view,
				node,
				extents: Extents2::new(ul.x_min, lr.y_min, lr.x_max, ul.y_max),
			});
		}
	}

	blocks
}

pub struct MetatileContext<'a> {
	pub resource: &'a Resource,
	pub registry: &'a Registry,
	pub rf: &'a ReferenceFrame,
	pub tile_index: &'a TileIndex,
	pub dem_dataset: &'a str,
	pub geoid_grid: Option<&'a str>,
	pub mask: Option<&'a MaskTree>,
	pub display_size: Option<u32>,
}

/// One grid sample: the three summary heights converted into physical,
/// navigation and raw-SDS space.
struct Sample {
	/// Average-height point in physical space.
	value: [f64; 3],
	min: [f64; 3],
	max: [f64; 3],
	height_range: HeightRange,
	ge: GeomExtents,
}

/// Reads sample `(i, j)`; an invalid sample is imputed from its valid
/// 8-neighborhood (average of averages, min of minima, max of maxima).
fn value_min_max(dem: &Raster, i: u32, j: u32) -> Option<[f64; 3]> {
	let value = dem.sample3(i, j);
	if valid_sample(value[0]) {
		return Some(value);
	}

	let mut out = [0.0, f64::MAX, f64::MIN];
	let mut count = 0;
	for jj in -1i64..=1 {
		for ii in -1i64..=1 {
			if ii == 0 && jj == 0 {
				continue;
			}
			let x = i as i64 + ii;
			let y = j as i64 + jj;
			if x < 0 || x >= i64::from(dem.width) || y < 0 || y >= i64::from(dem.height) {
				continue;
			}
			let value = dem.sample3(x as u32, y as u32);
			if valid_sample(value[0]) {
				out[0] += value[0];
				out[1] = out[1].min(value[1]);
				out[2] = out[2].max(value[2]);
				count += 1;
			}
		}
	}

	if count == 0 {
		return None;
	}
	out[0] /= f64::from(count);
	Some(out)
}

fn ti_to_meta_flags(ti: u8) -> u16 {
	let mut flags = meta_flags::ALL_CHILDREN;
	if ti & tile_flags::MESH != 0 {
		flags |= meta_flags::GEOMETRY_PRESENT;
	}
	if ti & tile_flags::NAVTILE != 0 {
		flags |= meta_flags::NAVTILE_PRESENT;
	}
	flags
}

fn internal(err: impl std::fmt::Display) -> GenerateError {
	GenerateError::InternalError(format!("{err}"))
}

/// Builds the metatile containing `tile_id` by sampling the DEM.
pub fn metatile_from_dem(
	tile_id: TileId,
	sink: &dyn Sink,
	arsenal: &Arsenal,
	context: &MetatileContext<'_>,
) -> Result<MetaTile, GenerateError> {
	let blocks = metatile_blocks(context.resource, context.rf, tile_id);
	if blocks.is_empty() {
		return Err(GenerateError::NotFound(
			"Metatile completely outside of configured range.".to_owned(),
		));
	}

	let rf = context.rf;
	let samples = METATILE_SAMPLES_PER_TILE;
	let mut metatile = MetaTile::new(tile_id, rf.meta_binary_order);

	// build children from tile index, combined with node validity (some
	// subtrees may have false positives)
	let set_children = |node_id: TileId, node: &mut MetaNode| {
		for (index, child) in node_id.children().into_iter().enumerate() {
			let valid = context.tile_index.valid_subtree(child) && rf.valid(child);
			node.set_child(index as u8, valid);
		}
	};

	let physical_def = context
		.registry
		.srs_def(&rf.model.physical_srs)
		.map_err(internal)?
		.def
		.clone();
	let navigation_def = context
		.registry
		.srs_def(&rf.model.navigation_srs)
		.map_err(internal)?
		.def
		.clone();

	for block in &blocks {
		let view = &block.view;
		let (view_width, view_height) = view.size();

		if !block.node.productive {
			// unproductive node: only flags and child validity
			for tile in view.iter(tile_id.lod) {
				let mut node = MetaNode {
					flags: ti_to_meta_flags(context.tile_index.get(tile)),
					..MetaNode::default()
				};
				set_children(tile, &mut node);
				metatile.set(tile, node);
			}
			continue;
		}

		let extents = block.extents;
		let block_size = extents.size();
		let grid_width = view_width * samples + 1;
		let grid_height = view_height * samples + 1;

		log::debug!(
			"Processing metatile block [{},{}:{},{}] at lod {}, ancestor {}.",
			view.x_min,
			view.y_min,
			view.x_max,
			view.y_max,
			tile_id.lod,
			block.node.id
		);

		let srs_def = context
			.registry
			.srs_def(&block.node.srs)
			.map_err(internal)?
			.def
			.clone();

		// warp value intentionally by average filter; extents grown by
		// half a pixel place samples at grid intersections
		let dem = arsenal.warper.warp(
			&RasterRequest {
				operation: RasterOperation::ValueMinMax,
				dataset: context.dem_dataset.to_owned(),
				srs: srs_def.clone(),
				extents: extents.plus_half_pixel(grid_width - 1, grid_height - 1),
				size: (grid_width, grid_height),
				resampling: Resampling::Dem,
				mask: None,
			},
			sink,
		)?;

		sink.check_aborted()?;

		// grid-to-space converters: SDS with geoid applied on the source
		// side of all three
		let sds_def = geoid_adjusted(&srs_def, context.geoid_grid);
		let conv = CsConvertor::new(&sds_def, &physical_def).map_err(internal)?;
		let nav_conv = CsConvertor::new(&sds_def, &navigation_def).map_err(internal)?;
		let ge_conv = CsConvertor::new(&sds_def, &srs_def).map_err(internal)?;

		// grid step in real SDS units
		let grid_step = (
			block_size.width / f64::from(samples * view_width),
			block_size.height / f64::from(samples * view_height),
		);

		// fill in the sample grid
		let mut grid: Vec<Option<Sample>> = Vec::with_capacity((grid_width * grid_height) as usize);
		for j in 0..grid_height {
			let y = extents.y_max - f64::from(j) * grid_step.1;
			for i in 0..grid_width {
				if masked_out(context.mask, block, tile_id.lod, i, j) {
					grid.push(None);
					continue;
				}
				let Some(value) = value_min_max(&dem, i, j) else {
					grid.push(None);
					continue;
				};

				let x = extents.x_min + f64::from(i) * grid_step.0;
				grid.push(make_sample(x, y, value, &conv, &nav_conv, &ge_conv));
			}
		}

		// release shared data before the per-tile pass
		drop(dem);

		// generate metatile content
		for j in 0..view_height {
			for i in 0..view_width {
				let node_id = TileId {
					lod: tile_id.lod,
					x: view.x_min + i,
					y: view.y_min + j,
				};

				let mut node = MetaNode {
					flags: ti_to_meta_flags(context.tile_index.get(node_id)),
					..MetaNode::default()
				};
				let mut geometry = node.geometry();
				let navtile = node.navtile();

				// accumulate over all of the tile's grid vertices
				let mut height_range = HeightRange::empty();
				let mut extents3 = Extents3::empty();
				let mut area = 0.0;
				let mut triangle_count = 0u32;
				let mut avg_height_sum = 0.0;
				let mut avg_height_count = 0u32;

				let index_of = |x: u32, y: u32| (y * grid_width + x) as usize;
				let value_at = |x: u32, y: u32| -> Option<[f64; 3]> {
					grid[index_of(x, y)].as_ref().map(|sample| sample.value)
				};

				for jj in 0..=samples {
					let yy = j * samples + jj;
					for ii in 0..=samples {
						let xx = i * samples + ii;

						if let Some(sample) = grid[index_of(xx, yy)].as_ref() {
							// update by both minimum and maximum
							extents3.update(sample.min);
							extents3.update(sample.max);
							node.geom_extents.update(&sample.ge);
							avg_height_sum += sample.ge.surrogate;
							avg_height_count += 1;

							if navtile {
								height_range = height_range.unite(&sample.height_range);
							}
						}

						if geometry && ii > 0 && jj > 0 {
							// quad composed of 1 or 2 triangles
							let (quad, triangles) = quad_area(
								value_at(xx - 1, yy - 1),
								value_at(xx - 1, yy),
								value_at(xx, yy - 1),
								value_at(xx, yy),
							);
							area += quad;
							triangle_count += triangles;
						}
					}
				}

				set_children(node_id, &mut node);
				node.extents = extents3;
				node.height_range = HeightRange {
					min: height_range.min.floor(),
					max: height_range.max.ceil(),
				};

				if triangle_count == 0 {
					// reset content flags
					node.set_geometry(false);
					geometry = false;
					node.set_navtile(false);
					node.height_range = HeightRange::empty();
					node.geom_extents = GeomExtents::empty();
				}

				// calculate texel size and surrogate
				if geometry {
					node.update_credits(&context.resource.credits);

					if let Some(display_size) = context.display_size {
						node.apply_display_size(true);
						node.display_size = display_size;
					} else {
						node.apply_texel_size(true);

						// triangles cover half a sample cell each, so the
						// texture area is half the covered cell count
						let texture_area =
							f64::from(triangle_count) * tile_area() / (2.0 * f64::from(samples * samples));
						node.texel_size = (area / texture_area).sqrt();
					}

					if avg_height_count > 0 {
						node.geom_extents.surrogate = avg_height_sum / f64::from(avg_height_count);
					}
				}

				metatile.set(node_id, node);
			}
		}

		sink.check_aborted()?;
	}

	Ok(metatile)
}

fn make_sample(
	x: f64,
	y: f64,
	value: [f64; 3],
	conv: &CsConvertor,
	nav_conv: &CsConvertor,
	ge_conv: &CsConvertor,
) -> Option<Sample> {
	let physical = conv.convert_3d([x, y, value[0]]).ok()?;
	let physical_min = conv.convert_3d([x, y, value[1]]).ok()?;
	let physical_max = conv.convert_3d([x, y, value[2]]).ok()?;
	let nav_min = nav_conv.convert_3d([x, y, value[1]]).ok()?;
	let nav_max = nav_conv.convert_3d([x, y, value[2]]).ok()?;
	let ge_min = ge_conv.convert_3d([x, y, value[1]]).ok()?;
	let ge_max = ge_conv.convert_3d([x, y, value[2]]).ok()?;
	let ge_value = ge_conv.convert_3d([x, y, value[0]]).ok()?;

	Some(Sample {
		value: physical,
		min: physical_min,
		max: physical_max,
		height_range: HeightRange {
			min: nav_min[2],
			max: nav_max[2],
		},
		ge: GeomExtents {
			z_min: ge_min[2],
			z_max: ge_max[2],
			surrogate: ge_value[2],
		},
	})
}

/// Mask query for grid sample `(i, j)` of a block: the sample maps to a
/// tile at `lod + METATILE_SAMPLES_PER_TILE_BIN_LOG`, shifted by the
/// block's offset.
fn masked_out(mask: Option<&MaskTree>, block: &MetatileBlock<'_>, lod: u8, i: u32, j: u32) -> bool {
	let Some(mask) = mask else {
		return false;
	};
	let depth = METATILE_SAMPLES_PER_TILE_BIN_LOG as u8;
	if lod + depth > 31 {
		return false;
	}
	let samples = METATILE_SAMPLES_PER_TILE;
	let (view_width, view_height) = block.view.size();
	let x = block.view.x_min * samples + i.min(view_width * samples - 1);
	let y = block.view.y_min * samples + j.min(view_height * samples - 1);
	!mask.covers(TileId {
		lod: lod + depth,
		x,
		y,
	})
}

/// Convenience wrapper returning the serialized metatile.
pub fn metatile_bytes(
	tile_id: TileId,
	sink: &dyn Sink,
	arsenal: &Arsenal,
	context: &MetatileContext<'_>,
) -> Result<Vec<u8>, GenerateError> {
	let metatile = metatile_from_dem(tile_id, sink, arsenal, context)?;
	let mut buffer = Vec::new();
	metatile
		.save(&mut buffer)
		.map_err(|err| GenerateError::InternalError(format!("cannot serialize metatile: {err:#}")))?;
	Ok(buffer)
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use tilecast_core::{FileClassSettings, GeneratorKind, GeneratorType, LodRange, ResourceId};

	fn test_resource(lod_range: LodRange, tile_range: TileRange) -> Resource {
		Resource {
			id: ResourceId::new("webmerc", "terrain", "alps"),
			generator: GeneratorKind::new(GeneratorType::Surface, "surface-dem"),
			comment: String::new(),
			revision: 0,
			credits: vec!["cartographers".to_owned()],
			lod_range,
			tile_range,
			definition: json!({"dataset": "dem/alps"}),
			file_class_settings: FileClassSettings::default(),
		}
	}

	#[test]
	fn blocks_cover_the_clipped_view() {
		let registry = Registry::builtin();
		let rf = registry.reference_frame("webmerc").unwrap();
		// resource range at lod 3: whole world
		let resource = test_resource(LodRange::new(3, 8).unwrap(), TileRange::new(0, 0, 7, 7).unwrap());

		let blocks = metatile_blocks(&resource, rf, TileId::new(3, 0, 0).unwrap());
		// a single root subtree: one block covering the whole lod-3 grid
		assert_eq!(blocks.len(), 1);
		assert_eq!(blocks[0].view, TileRange::new(0, 0, 7, 7).unwrap());
		assert_eq!(blocks[0].node.id, TileId::root());

		let size = blocks[0].extents.size();
		assert!((size.width - 2.0 * 20037508.342789244).abs() < 1.0);
	}

	#[test]
	fn blocks_respect_resource_range() {
		let registry = Registry::builtin();
		let rf = registry.reference_frame("webmerc").unwrap();
		// resource covers a single lod-3 tile subtree
		let resource = test_resource(LodRange::new(3, 8).unwrap(), TileRange::new(2, 2, 2, 2).unwrap());

		let blocks = metatile_blocks(&resource, rf, TileId::new(3, 0, 0).unwrap());
		assert_eq!(blocks.len(), 1);
		assert_eq!(blocks[0].view, TileRange::new(2, 2, 2, 2).unwrap());

		// a metatile fully outside of the range produces nothing
		let resource = test_resource(LodRange::new(6, 8).unwrap(), TileRange::new(0, 0, 0, 0).unwrap());
		let blocks = metatile_blocks(&resource, rf, TileId::new(6, 32, 32).unwrap());
		assert!(blocks.is_empty());
	}

	#[test]
	fn out_of_lod_range_is_empty() {
		let registry = Registry::builtin();
		let rf = registry.reference_frame("webmerc").unwrap();
		let resource = test_resource(LodRange::new(3, 8).unwrap(), TileRange::new(0, 0, 7, 7).unwrap());
		assert!(metatile_blocks(&resource, rf, TileId::new(2, 0, 0).unwrap()).is_empty());
	}

	#[test]
	fn value_min_max_imputes_from_neighbors() {
		let mut dem = Raster::new(3, 3, 3);
		// only the corners carry data
		for &(x, y) in &[(0u32, 0u32), (2, 0), (0, 2), (2, 2)] {
			dem.set_sample(x, y, 0, 100.0);
			dem.set_sample(x, y, 1, 90.0);
			dem.set_sample(x, y, 2, 110.0);
		}

		// center has 4 valid neighbors
		let center = value_min_max(&dem, 1, 1).unwrap();
		assert!((center[0] - 100.0).abs() < 1e-9);
		assert_eq!(center[1], 90.0);
		assert_eq!(center[2], 110.0);

		// a corner reads its own value
		let corner = value_min_max(&dem, 0, 0).unwrap();
		assert_eq!(corner[0], 100.0);
	}

	#[test]
	fn value_min_max_without_neighbors_is_invalid() {
		let dem = Raster::new(3, 3, 3);
		assert!(value_min_max(&dem, 1, 1).is_none());
	}

	#[test]
	fn ti_flags_map_to_meta_flags() {
		let flags = ti_to_meta_flags(tile_flags::MESH | tile_flags::NAVTILE);
		assert!(flags & meta_flags::GEOMETRY_PRESENT != 0);
		assert!(flags & meta_flags::NAVTILE_PRESENT != 0);
		assert_eq!(flags & meta_flags::ALL_CHILDREN, meta_flags::ALL_CHILDREN);

		let flags = ti_to_meta_flags(0);
		assert_eq!(flags, meta_flags::ALL_CHILDREN);
	}
}
