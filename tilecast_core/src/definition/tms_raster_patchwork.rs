use crate::Changed;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RasterFormat {
	#[default]
	Jpg,
	Png,
}

/// Definition of the synthetic patchwork raster, one auto-registered
/// instance per reference frame.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TmsRasterPatchwork {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mask: Option<String>,
	pub format: RasterFormat,
}

impl TmsRasterPatchwork {
	pub const DRIVER: &'static str = "tms-raster-patchwork";

	pub fn changed(&self, other: &TmsRasterPatchwork) -> Changed {
		// non-safe changes first
		if self.mask != other.mask {
			return Changed::Yes;
		}

		// format can change
		if self.format != other.format {
			return Changed::Safely;
		}

		Changed::No
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn format_changes_safely() {
		let a = TmsRasterPatchwork::default();
		let b = TmsRasterPatchwork {
			format: RasterFormat::Png,
			..TmsRasterPatchwork::default()
		};
		assert_eq!(a.changed(&b), Changed::Safely);
	}

	#[test]
	fn mask_change_is_incompatible() {
		let a = TmsRasterPatchwork::default();
		let b = TmsRasterPatchwork {
			mask: Some("mask".to_owned()),
			..TmsRasterPatchwork::default()
		};
		assert_eq!(a.changed(&b), Changed::Yes);
	}
}
