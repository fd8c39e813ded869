//! End-to-end surface generation: prepare a DEM surface, then drive the
//! metatile, mesh, navtile, mask and credits paths through real workers and
//! verify the metatile invariants against the tile index.

use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Weak};
use tilecast::generator::{self, GeneratorConfig, GeneratorFinder, Generators, Params, Task};
use tilecast::FileInfo;
use tilecast_core::{
	BufferSink, FileClassSettings, GenerateError, GeneratorKind, GeneratorType, LodRange, MetaTile, NodeInfo,
	Registry, Resource, ResourceId, TileId, TileIndex, TileRange,
};
use tilecast_gdal::{Arsenal, WarperOptions, register_all};

fn write_dem(path: &Path) {
	use gdal::DriverManager;
	register_all();
	let size = 64usize;
	let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
	let mut dataset = driver
		.create_with_band_type::<f64, _>(path.to_str().unwrap(), size, size, 1)
		.unwrap();
	dataset
		.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(4326).unwrap())
		.unwrap();
	// 2 x 2 degrees around (14, 49)
	dataset
		.set_geo_transform(&[13.0, 2.0 / size as f64, 0.0, 50.0, 0.0, -2.0 / size as f64])
		.unwrap();
	let mut data = vec![0.0f64; size * size];
	for row in 0..size {
		for col in 0..size {
			data[row * size + col] = 400.0 + (col as f64) * 10.0 + (row as f64) * 5.0;
		}
	}
	let mut buffer = gdal::raster::Buffer::new((size, size), data);
	dataset.rasterband(1).unwrap().write((0, 0), (size, size), &mut buffer).unwrap();
}

fn surface_resource(dataset: &Path) -> Resource {
	Resource {
		id: ResourceId::new("webmerc", "terrain", "alps"),
		generator: GeneratorKind::new(GeneratorType::Surface, "surface-dem"),
		comment: String::new(),
		revision: 0,
		credits: vec!["cartographers".to_owned()],
		lod_range: LodRange::new(2, 6).unwrap(),
		tile_range: TileRange::new(2, 1, 2, 1).unwrap(),
		definition: json!({"dataset": dataset.to_str().unwrap()}),
		file_class_settings: FileClassSettings::default(),
	}
}

struct Fixture {
	store: tempfile::TempDir,
	_data: tempfile::TempDir,
	arsenal: Arsenal,
	generator: Arc<dyn generator::Generator>,
	registry: Arc<Registry>,
}

impl Fixture {
	fn new() -> Fixture {
		let store = tempfile::tempdir().unwrap();
		let data = tempfile::tempdir().unwrap();
		let dem = data.path().join("alps.tif");
		write_dem(&dem);

		register_all();
		let arsenal = Arsenal::new(WarperOptions {
			process_count: 2,
			region_size: 32 * 1024 * 1024,
			..WarperOptions::default()
		})
		.unwrap();

		let registry = Arc::new(Registry::builtin());
		let finder: Weak<dyn GeneratorFinder> = Weak::<Generators>::new();
		let params = Params {
			config: GeneratorConfig {
				root: store.path().to_path_buf(),
				resource_root: std::path::PathBuf::from("/"),
				..GeneratorConfig::default()
			},
			registry: registry.clone(),
			resource: surface_resource(&dem),
			system: false,
			replace: None,
			finder,
		};

		let generator = generator::create(params).unwrap();
		generator.prepare(&arsenal).unwrap();
		assert!(generator.ready());

		Fixture {
			store,
			_data: data,
			arsenal,
			generator,
			registry,
		}
	}

	/// Runs one file request to completion and returns the sink state.
	fn request(&self, file: &str) -> tilecast_core::BufferSinkState {
		let info = FileInfo::parse(&format!("/webmerc/surface/terrain/alps/{file}")).unwrap();
		let sink = BufferSink::new();
		match self.generator.generate_file(&info, &sink) {
			Ok(Task::Done) => {}
			Ok(Task::Run(task)) => task(&sink, &self.arsenal),
			Err(err) => sink.error(err),
		}
		sink.take()
	}

	fn tile_index(&self) -> TileIndex {
		TileIndex::load_path(&self.store.path().join("webmerc/terrain/alps/tileset.index")).unwrap()
	}
}

#[test]
fn surface_pipeline_end_to_end() {
	let fixture = Fixture::new();

	// preparation has persisted the tileset files
	let config = fixture.request("tileset.conf");
	let properties: serde_json::Value = serde_json::from_slice(&config.content.unwrap().0).unwrap();
	assert_eq!(properties["referenceFrame"], json!("webmerc"));
	assert_eq!(properties["id"], json!("terrain/alps"));

	let index = fixture.tile_index();
	assert!(!index.is_empty());
	// the dataset sits in the lod-2 tile (2, 1); its subtree must be the
	// only flagged one
	assert!(index.valid_subtree(TileId::new(2, 2, 1).unwrap()));
	assert!(!index.valid_subtree(TileId::new(2, 0, 0).unwrap()));

	// --- metatile ---
	let state = fixture.request("6-34-21.meta");
	assert!(state.error.is_none(), "metatile failed: {:?}", state.error);
	let (data, info) = state.content.unwrap();
	assert_eq!(info.content_type, "application/octet-stream");

	let metatile = MetaTile::load(&mut data.as_slice()).unwrap();
	assert_eq!(metatile.origin(), TileId::new(6, 32, 0).unwrap());

	let registry = fixture.registry.clone();
	let rf = registry.reference_frame("webmerc").unwrap();

	// invariants over every stored node
	let mut geometry_nodes = 0;
	for y in 16..=31u32 {
		for x in 32..=47u32 {
			let tile = TileId::new(6, x, y).unwrap();
			let node = metatile.get(tile).expect("every tile of the block has a node");

			// child validity is tile-index validity combined with
			// reference-frame validity
			for (child_index, child) in tile.children().into_iter().enumerate() {
				let expected = index.valid_subtree(child) && rf.valid(child);
				assert_eq!(node.child(child_index as u8), expected, "child bits of {tile}");
			}

			if node.geometry() {
				geometry_nodes += 1;
				assert!(node.texel_size > 0.0, "texel size of {tile}");
				assert!(
					node.height_range.min <= node.height_range.max,
					"height range of {tile}"
				);
				assert!(!node.geom_extents.is_empty(), "geom extents of {tile}");
				assert!(node.geom_extents.surrogate.is_finite(), "surrogate of {tile}");
				assert_eq!(node.credits, vec!["cartographers".to_owned()]);
				assert!(!node.extents.is_empty(), "extents of {tile}");
			} else {
				// no geometry: no content, empty ranges
				assert!(!node.navtile(), "navtile without geometry in {tile}");
				assert!(node.height_range.is_empty(), "height range of empty {tile}");
				assert!(node.geom_extents.is_empty(), "geom extents of empty {tile}");
			}
		}
	}
	assert!(geometry_nodes > 0, "the dataset must produce geometry");

	// heights of the synthetic DEM are 400..1400 m
	let center = metatile.get(TileId::new(6, 34, 21).unwrap()).unwrap();
	assert!(center.geometry());
	assert!(center.height_range.min >= 300.0 && center.height_range.max <= 1500.0);

	// --- mesh ---
	let state = fixture.request("6-34-21.mesh");
	assert!(state.error.is_none(), "mesh failed: {:?}", state.error);
	let (data, _) = state.content.unwrap();
	assert_eq!(&data[0..4], b"TCME");

	// a tile without content serves no mesh
	let state = fixture.request("6-32-16.mesh");
	assert!(matches!(state.error, Some(GenerateError::NotFound(_))));

	// --- navtile ---
	let state = fixture.request("6-34-21.navtile");
	assert!(state.error.is_none(), "navtile failed: {:?}", state.error);
	let (data, _) = state.content.unwrap();
	assert_eq!(&data[0..4], b"TCNT");

	// --- mask ---
	let state = fixture.request("6-34-21.mask");
	assert!(state.error.is_none(), "mask failed: {:?}", state.error);
	let (data, _) = state.content.unwrap();
	assert_eq!(&data[0..4], b"TCMK");

	// debug mask of a missing tile is the distinguished empty-mask error
	let state = fixture.request("6-32-16.mask.debug");
	assert!(matches!(state.error, Some(GenerateError::EmptyDebugMask(_))));

	// --- credits ---
	let state = fixture.request("6-34-21.credits");
	let (data, _) = state.content.unwrap();
	let credits: serde_json::Value = serde_json::from_slice(&data).unwrap();
	assert_eq!(credits["credits"], json!(["cartographers"]));

	// --- metatile outside the configured lod range ---
	let state = fixture.request("7-0-0.meta");
	assert!(matches!(state.error, Some(GenerateError::NotFound(_))));

	// --- unknown file ---
	let state = fixture.request("nonsense.bin");
	assert!(matches!(state.error, Some(GenerateError::NotFound(_))));

	fixture.arsenal.stop();
}

#[test]
fn metatile_is_deterministic() {
	let fixture = Fixture::new();

	let first = fixture.request("6-34-21.meta").content.unwrap().0;
	let second = fixture.request("6-34-21.meta").content.unwrap().0;
	assert_eq!(first, second);

	fixture.arsenal.stop();
}

#[test]
fn aborted_request_unwinds() {
	let fixture = Fixture::new();

	let info = FileInfo::parse("/webmerc/surface/terrain/alps/6-34-21.meta").unwrap();
	let sink = BufferSink::new();
	sink.abort();
	match fixture.generator.generate_file(&info, &sink) {
		Ok(Task::Run(task)) => task(&sink, &fixture.arsenal),
		other => panic!("expected a deferred task, got {:?}", other.is_ok()),
	}
	let state = sink.take();
	assert!(matches!(state.error, Some(GenerateError::Aborted)));
	assert!(state.content.is_none());

	fixture.arsenal.stop();
}

#[test]
fn reopened_generator_reuses_files() {
	let fixture = Fixture::new();

	// a second generator over the same store becomes ready from the
	// persisted files alone, without preparation
	let resource = fixture.generator.resource().clone();
	let params = Params {
		config: GeneratorConfig {
			root: fixture.store.path().to_path_buf(),
			resource_root: std::path::PathBuf::from("/"),
			..GeneratorConfig::default()
		},
		registry: fixture.registry.clone(),
		resource,
		system: false,
		replace: None,
		finder: Weak::<Generators>::new(),
	};
	let reopened = generator::create(params).unwrap();
	assert!(reopened.ready(), "reopened generator must be ready immediately");

	fixture.arsenal.stop();
}

#[test]
fn unproductive_block_propagates_flags_only() {
	use tilecast::support::metatile::{MetatileContext, metatile_from_dem};
	use tilecast_core::meta_flags;

	// a frame whose root is structural only: nothing is sampled in it
	let mut registry = Registry::builtin();
	registry
		.reference_frames
		.get_mut("webmerc")
		.unwrap()
		.nodes
		.get_mut(&TileId::root())
		.unwrap()
		.productive = false;
	let rf = registry.reference_frame("webmerc").unwrap();

	let mut builder = TileIndex::builder();
	builder.set(TileId::new(3, 2, 1).unwrap(), tilecast_core::tile_flags::MESH);
	builder.set(TileId::new(4, 4, 2).unwrap(), tilecast_core::tile_flags::MESH);
	let index = builder.build();

	let resource = {
		let mut resource = surface_resource(Path::new("unused.tif"));
		resource.lod_range = LodRange::new(3, 4).unwrap();
		resource.tile_range = TileRange::new(0, 0, 7, 7).unwrap();
		resource
	};

	register_all();
	let arsenal = Arsenal::new(WarperOptions {
		process_count: 1,
		region_size: 8 * 1024 * 1024,
		..WarperOptions::default()
	})
	.unwrap();

	let context = MetatileContext {
		resource: &resource,
		registry: &registry,
		rf,
		tile_index: &index,
		dem_dataset: "unused.tif",
		geoid_grid: None,
		mask: None,
		display_size: None,
	};
	let sink = BufferSink::new();
	let metatile = metatile_from_dem(TileId::new(3, 0, 0).unwrap(), &sink, &arsenal, &context).unwrap();

	// no sampling happened, but flags and child validity are propagated
	let flagged = metatile.get(TileId::new(3, 2, 1).unwrap()).unwrap();
	assert!(flagged.flags & meta_flags::GEOMETRY_PRESENT != 0);
	assert!(flagged.child(0), "child (4, 4, 2) is a flagged subtree");
	assert!(!flagged.child(1));
	assert!(flagged.extents.is_empty());

	let empty = metatile.get(TileId::new(3, 0, 0).unwrap()).unwrap();
	assert_eq!(empty.flags & meta_flags::GEOMETRY_PRESENT, 0);

	arsenal.stop();
}

#[test]
fn node_info_matches_block_srs() {
	// sanity anchor for the webmerc frame used above: the lod-4 tile
	// holding the dataset resolves to the root node
	let registry = Registry::builtin();
	let rf = registry.reference_frame("webmerc").unwrap();
	let info = NodeInfo::find(rf, TileId::new(4, 8, 5).unwrap()).unwrap();
	assert_eq!(info.node.id, TileId::root());
	assert_eq!(info.srs(), "pseudomerc");
	assert!(info.productive());
}
