use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::config::{OutputPaths, Vintage};
use crate::error::WriteError;
use crate::normalize::AttributeRecord;
use crate::regions::Region;

/// Writes one GEOID-keyed JSON file per region.
#[derive(Debug, Clone)]
pub struct RegionWriter {
    attrs_dir: PathBuf,
    template: String,
    acs_year: u16,
    boundary_year: u16,
}

impl RegionWriter {
    pub fn new(outputs: &OutputPaths, vintage: &Vintage) -> Self {
        RegionWriter {
            attrs_dir: outputs.attrs_dir.clone(),
            template: outputs.filename_template.clone(),
            acs_year: vintage.acs_year,
            boundary_year: vintage.boundary_year,
        }
    }

    pub fn path_for(&self, region: &Region) -> PathBuf {
        let name = self
            .template
            .replace("{state}", region.code())
            .replace("{acs_year}", &self.acs_year.to_string())
            .replace("{boundary_year}", &self.boundary_year.to_string());
        self.attrs_dir.join(name)
    }

    /// Serialize `records` sorted by join key and replace the region's file.
    pub fn write(&self, region: &Region, records: &[AttributeRecord]) -> Result<PathBuf, WriteError> {
        let path = self.path_for(region);
        let bytes = render(records);
        write_atomic(&path, &bytes).map_err(|source| WriteError {
            path: path.clone(),
            source,
        })?;
        debug!("wrote {} records to {:?}", records.len(), path);
        Ok(path)
    }
}

/// Compact JSON with both levels of keys in ascending order.
pub fn render(records: &[AttributeRecord]) -> Vec<u8> {
    let sorted: BTreeMap<&str, &BTreeMap<String, Value>> = records
        .iter()
        .map(|r| (r.join_key.as_str(), &r.values))
        .collect();
    // Only string keys and JSON values: serialization cannot fail.
    serde_json::to_vec(&sorted).unwrap_or_default()
}

/// Write to a sibling temp file, then rename over the target.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = fs::File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
