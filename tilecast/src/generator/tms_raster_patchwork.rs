//! Synthetic patchwork raster generator.
//!
//! One instance is auto-registered per reference frame as a system
//! resource; it serves a definition document and per-tile debug patches so
//! that a viewer always has a bound layer to drape, even with no real
//! imagery configured.

use super::{Generator, GeneratorCore, GeneratorFactory, Params, Task};
use crate::file_info::FileInfo;
use anyhow::{Result, bail};
use byteorder::{LE, WriteBytesExt};
use std::io::Write;
use std::sync::Arc;
use tilecast_core::{
	Definition, FileClass, GenerateError, GeneratorKind, GeneratorType, Sink, SinkFileInfo, TileId,
	definition::TmsRasterPatchwork,
};
use tilecast_gdal::Arsenal;

pub struct TmsRasterPatchworkFactory;

impl GeneratorFactory for TmsRasterPatchworkFactory {
	fn kind(&self) -> GeneratorKind {
		GeneratorKind::new(GeneratorType::Tms, TmsRasterPatchwork::DRIVER)
	}

	fn system_instance(&self) -> bool {
		true
	}

	fn create(&self, params: Params) -> Result<Arc<dyn Generator>> {
		Ok(Arc::new(TmsRasterPatchworkGenerator::new(params)?))
	}
}

pub struct TmsRasterPatchworkGenerator {
	core: GeneratorCore,
	definition: TmsRasterPatchwork,
}

impl TmsRasterPatchworkGenerator {
	fn new(params: Params) -> Result<TmsRasterPatchworkGenerator> {
		let core = GeneratorCore::new(params)?;
		let definition = match core.resource().definition()? {
			Definition::TmsRasterPatchwork(definition) => definition,
			_ => bail!(
				"resource <{}> is not a tms-raster-patchwork definition",
				core.resource().id
			),
		};
		Ok(TmsRasterPatchworkGenerator { core, definition })
	}

	fn boundlayer_document(&self) -> serde_json::Value {
		let resource = self.core.resource();
		let url = self.core.url();
		serde_json::json!({
			"id": resource.id.full_id(),
			"type": "raster",
			"format": self.definition.format,
			"lodRange": [resource.lod_range.min, resource.lod_range.max],
			"tileUrl": format!("{url}{{lod}}-{{x}}-{{y}}.patch"),
		})
	}

	/// A tiny deterministic patch: the tile id plus its checkerboard
	/// shade, enough for a viewer to tell tiles apart.
	fn patch(&self, tile: TileId) -> Vec<u8> {
		let shade: u8 = if (tile.x ^ tile.y) & 1 == 0 { 0xc0 } else { 0x60 };
		let mut data = Vec::new();
		data.write_all(b"TCPW").expect("vec write");
		data.write_u8(tile.lod).expect("vec write");
		data.write_u32::<LE>(tile.x).expect("vec write");
		data.write_u32::<LE>(tile.y).expect("vec write");
		data.write_u8(shade).expect("vec write");
		data
	}
}

impl Generator for TmsRasterPatchworkGenerator {
	fn core(&self) -> &GeneratorCore {
		&self.core
	}

	fn prepare_impl(&self, _arsenal: &Arsenal) -> Result<()> {
		// synthetic resource: nothing to probe
		Ok(())
	}

	fn generate_file(&self, file_info: &FileInfo, sink: &dyn Sink) -> Result<Task, GenerateError> {
		if file_info.file == "boundlayer.json" {
			sink.content(
				serde_json::to_vec_pretty(&self.boundlayer_document()).expect("document is serializable"),
				&SinkFileInfo::new("application/json", FileClass::Config),
			);
			return Ok(Task::Done);
		}

		let not_found = || GenerateError::NotFound(format!("unrecognized filename '{}'", file_info.file));

		let stem = file_info.file.strip_suffix(".patch").ok_or_else(not_found)?;
		let coords: Vec<&str> = stem.split('-').collect();
		if coords.len() != 3 {
			return Err(not_found());
		}
		let lod = coords[0].parse().map_err(|_| not_found())?;
		let x = coords[1].parse().map_err(|_| not_found())?;
		let y = coords[2].parse().map_err(|_| not_found())?;
		let tile = TileId::new(lod, x, y).map_err(|_| not_found())?;

		if !self.core.resource().lod_range.contains(tile.lod) {
			return Err(GenerateError::NotFound("Tile outside of configured range.".to_owned()));
		}

		sink.content(
			self.patch(tile),
			&SinkFileInfo::new("application/octet-stream", FileClass::Data),
		);
		Ok(Task::Done)
	}
}
