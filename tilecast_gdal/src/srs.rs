//! Spatial reference parsing and coordinate conversion.

use anyhow::{Context, Result, ensure};
use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};

/// Parses an SRS definition: `EPSG:` code, proj4 string or WKT.
pub fn parse_srs(def: &str) -> Result<SpatialRef> {
	let def = def.trim();
	let mut srs = if let Some(code) = def.strip_prefix("EPSG:") {
		SpatialRef::from_epsg(code.parse().with_context(|| format!("invalid EPSG code '{code}'"))?)?
	} else if def.starts_with('+') {
		SpatialRef::from_proj4(def)?
	} else {
		SpatialRef::from_wkt(def)?
	};
	srs.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
	Ok(srs)
}

/// Appends a geoid grid to a proj4-style definition, shifting the vertical
/// datum of everything converted through it.
pub fn geoid_adjusted(def: &str, geoid_grid: Option<&str>) -> String {
	match geoid_grid {
		Some(grid) => format!("{def} +geoidgrids={grid}"),
		None => def.to_owned(),
	}
}

fn datum_tokens(geog_def: &str) -> String {
	let mut datum = String::new();
	for token in geog_def.split_whitespace() {
		if token.starts_with("+datum=") || token.starts_with("+ellps=") || token.starts_with("+towgs84=") {
			datum.push(' ');
			datum.push_str(token);
		}
	}
	if datum.is_empty() {
		datum = " +ellps=WGS84".to_owned();
	}
	datum
}

/// Builds a transverse-mercator SRS centered at the given geographic point,
/// reusing the datum of `geog_def` (a proj4 definition). Used for local
/// metric measurements like the GSD.
pub fn tmerc_at(lon: f64, lat: f64, geog_def: &str) -> Result<SpatialRef> {
	let datum = datum_tokens(geog_def);
	parse_srs(&format!(
		"+proj=tmerc +lat_0={lat} +lon_0={lon} +k=1 +x_0=0 +y_0=0{datum} +units=m +no_defs"
	))
}

/// A plain geographic (longlat) definition on the same datum as
/// `geog_def`.
pub fn geographic_like(geog_def: &str) -> String {
	format!("+proj=longlat{} +no_defs", datum_tokens(geog_def))
}

/// Coordinate converter between two spatial reference systems.
///
/// Wraps a GDAL `CoordTransform`; conversion failures (points outside the
/// projection domain) surface as errors, which samplers treat as "point not
/// representable here".
pub struct CsConvertor {
	transform: CoordTransform,
}

impl CsConvertor {
	pub fn new(src_def: &str, dst_def: &str) -> Result<CsConvertor> {
		let src = parse_srs(src_def)?;
		let dst = parse_srs(dst_def)?;
		Ok(CsConvertor {
			transform: CoordTransform::new(&src, &dst)?,
		})
	}

	pub fn from_refs(src: &SpatialRef, dst: &SpatialRef) -> Result<CsConvertor> {
		Ok(CsConvertor {
			transform: CoordTransform::new(src, dst)?,
		})
	}

	pub fn convert_2d(&self, p: [f64; 2]) -> Result<[f64; 2]> {
		let mut x = [p[0]];
		let mut y = [p[1]];
		let mut z = [0.0];
		self.transform.transform_coords(&mut x, &mut y, &mut z)?;
		ensure!(x[0].is_finite() && y[0].is_finite(), "conversion produced non-finite point");
		Ok([x[0], y[0]])
	}

	pub fn convert_3d(&self, p: [f64; 3]) -> Result<[f64; 3]> {
		let mut x = [p[0]];
		let mut y = [p[1]];
		let mut z = [p[2]];
		self.transform.transform_coords(&mut x, &mut y, &mut z)?;
		ensure!(
			x[0].is_finite() && y[0].is_finite() && z[0].is_finite(),
			"conversion produced non-finite point"
		);
		Ok([x[0], y[0], z[0]])
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_common_forms() {
		assert!(parse_srs("EPSG:4326").is_ok());
		assert!(parse_srs("+proj=longlat +datum=WGS84 +no_defs").is_ok());
		assert!(parse_srs("definitely not an srs").is_err());
	}

	#[test]
	fn longlat_to_webmerc() {
		let conv = CsConvertor::new(
			"+proj=longlat +datum=WGS84 +no_defs",
			"+proj=webmerc +datum=WGS84 +no_defs",
		)
		.unwrap();
		let p = conv.convert_2d([0.0, 0.0]).unwrap();
		assert!(p[0].abs() < 1e-6);
		assert!(p[1].abs() < 1e-6);

		let p = conv.convert_2d([180.0, 0.0]).unwrap();
		assert!((p[0] - 20037508.342789244).abs() < 1.0);
	}

	#[test]
	fn tmerc_keeps_meters() {
		// one degree of longitude at the equator is about 111.32 km
		let tm = tmerc_at(14.0, 0.0, "+proj=longlat +datum=WGS84 +no_defs").unwrap();
		let geographic = parse_srs("+proj=longlat +datum=WGS84 +no_defs").unwrap();
		let conv = CsConvertor::from_refs(&geographic, &tm).unwrap();
		let a = conv.convert_2d([14.0, 0.0]).unwrap();
		let b = conv.convert_2d([15.0, 0.0]).unwrap();
		let distance = ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2)).sqrt();
		assert!((distance - 111_320.0).abs() / 111_320.0 < 0.01, "distance {distance}");
	}

	#[test]
	fn geoid_adjustment_appends_grid() {
		assert_eq!(
			geoid_adjusted("+proj=longlat", Some("egm96_15.gtx")),
			"+proj=longlat +geoidgrids=egm96_15.gtx"
		);
		assert_eq!(geoid_adjusted("+proj=longlat", None), "+proj=longlat");
	}
}
