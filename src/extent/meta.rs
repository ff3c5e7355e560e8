//! Extent identity and seal state, stored in extended attributes.
//!
//! An extent file carries two xattrs: `user.EXTENTMETA`, a small JSON object
//! identifying the file as an extent, and `user.XATTRSEAL`, present with the
//! value `"true"` once the extent has been sealed.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::errdata;
use crate::Error;

pub const EXTENT_MAGIC: &str = "EXTENTXX";
pub const META_XATTR: &str = "user.EXTENTMETA";
pub const SEAL_XATTR: &str = "user.XATTRSEAL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtentMeta {
    #[serde(rename = "MagicNumber")]
    pub magic: String,
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "kBlockSize")]
    pub block_size: u64,
}

impl ExtentMeta {
    pub fn new(id: u64) -> Self {
        Self {
            magic: EXTENT_MAGIC.to_string(),
            id,
            block_size: super::record::PHYSICAL_BLOCK_SIZE,
        }
    }

    /// Writes the meta attribute onto the extent file.
    pub fn write(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_vec(self)?;
        xattr::set(path, META_XATTR, &payload)?;
        Ok(())
    }

    /// Reads and validates the meta attribute from an extent file.
    pub fn read(path: &Path) -> Result<Self> {
        let payload = xattr::get(path, META_XATTR)?
            .ok_or_else(|| Error::InvalidData(format!("{} is not an extent file", path.display())))?;
        let meta: ExtentMeta = serde_json::from_slice(&payload)?;
        if meta.magic != EXTENT_MAGIC {
            return errdata!("bad extent magic {:?}", meta.magic);
        }
        Ok(meta)
    }
}

/// Whether the seal attribute is present on the file.
pub fn is_sealed(path: &Path) -> Result<bool> {
    Ok(matches!(xattr::get(path, SEAL_XATTR)?, Some(v) if v == b"true"))
}

/// Marks the extent file as sealed.
pub fn set_sealed(path: &Path) -> Result<()> {
    xattr::set(path, SEAL_XATTR, b"true")?;
    Ok(())
}
