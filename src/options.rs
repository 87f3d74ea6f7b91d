use crate::error::{Error, Result};
use diskheap_pager::DEFAULT_PAGE_SIZE;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration values for a heap.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// The block size the allocator aims for when carving new blocks.
    /// Default: 4096
    pub target_page_size: u16,
    /// Node size of the free block index built on top of the heap.
    /// Default: 4096
    pub tree_page_size: u16,
    /// Number of entries a cache keeps tracked before it starts evicting idle ones.
    /// Default: 1024
    pub cache_capacity: usize,
    /// Parameters used to construct the pager.
    pub pager: PagerOptions,
}

/// Parameters of the pager a heap constructs for itself.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PagerOptions {
    /// The backing file. Required by `Heap::open`, `Heap::memory` ignores it.
    pub path: Option<PathBuf>,
    /// Default: 4096
    pub page_size: u64,
}

impl Default for Options {
    #[inline]
    fn default() -> Self {
        Self {
            target_page_size: 4096,
            tree_page_size: 4096,
            cache_capacity: 1024,
            pager: PagerOptions::default(),
        }
    }
}

impl Default for PagerOptions {
    #[inline]
    fn default() -> Self {
        Self {
            path: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Options {
    /// Parse and validate options from a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let options: Options = toml::from_str(contents)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        let page_size = self.pager.page_size;
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::InvalidOptions(format!(
                "pager.page_size must be a power of two (got {})",
                page_size
            )));
        }

        if self.target_page_size == 0 || self.tree_page_size == 0 {
            return Err(Error::InvalidOptions(
                "target_page_size and tree_page_size must be non-zero".into(),
            ));
        }

        if self.cache_capacity == 0 {
            return Err(Error::InvalidOptions("cache_capacity must be non-zero".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.pager.page_size, 4096);
        assert_eq!(options.pager.path, None);
        options.validate().unwrap();
    }

    #[test]
    fn from_toml() {
        let options = Options::from_toml_str(
            r#"
            tree_page_size = 1024
            cache_capacity = 16

            [pager]
            path = "/var/lib/heap.db"
            page_size = 8192
            "#,
        )
        .unwrap();

        assert_eq!(options.target_page_size, 4096);
        assert_eq!(options.tree_page_size, 1024);
        assert_eq!(options.cache_capacity, 16);
        assert_eq!(options.pager.path, Some(PathBuf::from("/var/lib/heap.db")));
        assert_eq!(options.pager.page_size, 8192);
    }

    #[test]
    fn rejects_invalid() {
        assert!(matches!(
            Options::from_toml_str("[pager]\npage_size = 1000"),
            Err(Error::InvalidOptions(_))
        ));
        assert!(matches!(
            Options::from_toml_str("cache_capacity = 0"),
            Err(Error::InvalidOptions(_))
        ));
        assert!(matches!(
            Options::from_toml_str("cache_capacity = \"many\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap.toml");
        std::fs::write(&path, "target_page_size = 512\n").unwrap();
        assert_eq!(Options::load(&path).unwrap().target_page_size, 512);
    }
}
