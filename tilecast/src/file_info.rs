//! URL-to-file resolution.
//!
//! The front-end parses `/<referenceFrame>/<type>/<group>/<id>/<file>` into
//! a [`FileInfo`]; generators interpret the trailing `file` part themselves
//! (see [`SurfaceFile`] for the surface naming scheme).

use anyhow::Result;
use tilecast_core::{GenerateError, GeneratorType, ResourceId, TileId};

#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
	pub resource: ResourceId,
	pub generator_type: GeneratorType,
	/// Trailing file name, still unparsed.
	pub file: String,
}

impl FileInfo {
	/// Parses a request path. The leading slash is optional.
	pub fn parse(path: &str) -> Result<FileInfo, GenerateError> {
		let parts: Vec<&str> = path.trim_start_matches('/').splitn(5, '/').collect();
		if parts.len() != 5 || parts.iter().any(|part| part.is_empty()) {
			return Err(GenerateError::NotFound(format!("unrecognized path '{path}'")));
		}

		let generator_type = match parts[1] {
			"tms" => GeneratorType::Tms,
			"surface" => GeneratorType::Surface,
			"geodata" => GeneratorType::Geodata,
			other => return Err(GenerateError::NotFound(format!("unknown generator type '{other}'"))),
		};

		Ok(FileInfo {
			resource: ResourceId::new(parts[0], parts[2], parts[3]),
			generator_type,
			file: parts[4].to_owned(),
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileFile {
	Meta,
	Mesh,
	Navtile,
	Mask,
	Credits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFlavor {
	Regular,
	Debug,
}

/// A parsed surface file name.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceFile {
	/// `tileset.conf`: the tileset properties.
	Config,
	/// `tileset.index`: the raw tile index.
	Index,
	/// `definition.json`: the layer definition document.
	Definition,
	Tile {
		tile: TileId,
		kind: TileFile,
		flavor: FileFlavor,
	},
}

impl SurfaceFile {
	/// Parses the trailing file name of a surface resource. Tiles use
	/// `<lod>-<x>-<y>.<kind>[.debug]`.
	pub fn parse(file: &str) -> Result<SurfaceFile, GenerateError> {
		match file {
			"tileset.conf" => return Ok(SurfaceFile::Config),
			"tileset.index" => return Ok(SurfaceFile::Index),
			"definition.json" => return Ok(SurfaceFile::Definition),
			_ => {}
		}

		let not_found = || GenerateError::NotFound(format!("unrecognized filename '{file}'"));

		let (stem, extension) = file.split_once('.').ok_or_else(not_found)?;
		let (extension, flavor) = match extension.strip_suffix(".debug") {
			Some(extension) => (extension, FileFlavor::Debug),
			None => (extension, FileFlavor::Regular),
		};

		let kind = match extension {
			"meta" => TileFile::Meta,
			"mesh" => TileFile::Mesh,
			"navtile" => TileFile::Navtile,
			"mask" => TileFile::Mask,
			"credits" => TileFile::Credits,
			_ => return Err(not_found()),
		};

		let coords: Vec<&str> = stem.split('-').collect();
		if coords.len() != 3 {
			return Err(not_found());
		}
		let lod = coords[0].parse().map_err(|_| not_found())?;
		let x = coords[1].parse().map_err(|_| not_found())?;
		let y = coords[2].parse().map_err(|_| not_found())?;
		let tile = TileId::new(lod, x, y).map_err(|_| not_found())?;

		Ok(SurfaceFile::Tile { tile, kind, flavor })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_full_path() {
		let info = FileInfo::parse("/webmerc/surface/terrain/alps/12-345-678.meta").unwrap();
		assert_eq!(info.resource, ResourceId::new("webmerc", "terrain", "alps"));
		assert_eq!(info.generator_type, GeneratorType::Surface);
		assert_eq!(info.file, "12-345-678.meta");
	}

	#[test]
	fn rejects_short_and_unknown_paths() {
		assert!(FileInfo::parse("/webmerc/surface/terrain").is_err());
		assert!(FileInfo::parse("/webmerc/imaginary/terrain/alps/file").is_err());
		assert!(FileInfo::parse("").is_err());
	}

	#[test]
	fn parses_surface_files() {
		assert_eq!(SurfaceFile::parse("tileset.conf").unwrap(), SurfaceFile::Config);
		assert_eq!(SurfaceFile::parse("tileset.index").unwrap(), SurfaceFile::Index);
		assert_eq!(
			SurfaceFile::parse("12-345-678.mesh").unwrap(),
			SurfaceFile::Tile {
				tile: TileId::new(12, 345, 678).unwrap(),
				kind: TileFile::Mesh,
				flavor: FileFlavor::Regular,
			}
		);
		assert_eq!(
			SurfaceFile::parse("3-1-2.mask.debug").unwrap(),
			SurfaceFile::Tile {
				tile: TileId::new(3, 1, 2).unwrap(),
				kind: TileFile::Mask,
				flavor: FileFlavor::Debug,
			}
		);
	}

	#[test]
	fn rejects_malformed_tiles() {
		assert!(SurfaceFile::parse("1-2.mesh").is_err());
		assert!(SurfaceFile::parse("a-b-c.mesh").is_err());
		assert!(SurfaceFile::parse("40-0-0.mesh").is_err());
		assert!(SurfaceFile::parse("1-2-3.texture").is_err());
	}
}
