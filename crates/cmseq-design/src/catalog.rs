//! Stimulus catalog: category name -> item identifiers.
//!
//! On disk every item has two assets, `{item}_img.png` and `{item}_txt.png`,
//! under `stims/{lang}/{category}/`. The engine only needs identifiers and
//! counts; asset paths are resolved for the presentation layer.

use crate::error::{DesignError, Result};
use crate::types::{ItemId, Modality, SEQUENCE_LEN};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    root: Option<PathBuf>,
    categories: BTreeMap<String, Vec<ItemId>>,
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

fn split_asset_name(file_name: &str) -> Option<(&str, Modality)> {
    let stem = file_name.strip_suffix(".png")?;
    let (item, kind) = stem.rsplit_once('_')?;
    if item.is_empty() {
        return None;
    }
    match kind {
        "img" => Some((item, Modality::Image)),
        "txt" => Some((item, Modality::Text)),
        _ => None,
    }
}

impl Catalog {
    /// In-memory catalog. Item pools are sorted so shuffles do not depend on
    /// the order the caller listed them in.
    pub fn new(categories: BTreeMap<String, Vec<ItemId>>) -> Self {
        let categories = categories
            .into_iter()
            .map(|(name, mut items)| {
                items.sort();
                (name, items)
            })
            .collect();
        Self {
            root: None,
            categories,
        }
    }

    /// Scan `{input_dir}/stims/{lang}` for paired image/text assets.
    pub fn from_dir(input_dir: &Path, lang: &str) -> Result<Self> {
        let root = input_dir.join("stims").join(lang);
        if !root.is_dir() {
            return Err(DesignError::CatalogMismatch(format!(
                "stimulus directory not found: {}",
                root.display()
            )));
        }
        let mut categories = BTreeMap::new();
        for entry in WalkDir::new(&root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| DesignError::CatalogMismatch(e.to_string()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.file_type().is_dir() || is_hidden(&name) {
                continue;
            }
            let items = scan_category(entry.path(), &name)?;
            debug!(category = %name, items = items.len(), "category scanned");
            categories.insert(name, items);
        }
        let mut catalog = Catalog::new(categories);
        catalog.root = Some(root);
        Ok(catalog)
    }

    pub fn category_names(&self) -> Vec<&str> {
        self.categories.keys().map(|k| k.as_str()).collect()
    }

    pub fn items(&self, category: &str) -> Option<&[ItemId]> {
        self.categories.get(category).map(|v| v.as_slice())
    }

    pub(crate) fn pools(&self) -> impl Iterator<Item = &[ItemId]> {
        self.categories.values().map(|v| v.as_slice())
    }

    /// Common pool size, if every category has the same number of items.
    pub fn pool_size(&self) -> Option<usize> {
        let mut sizes = self.categories.values().map(|v| v.len());
        let first = sizes.next()?;
        sizes.all(|s| s == first).then_some(first)
    }

    /// Preconditions for instantiating `n_structures` sequences.
    pub fn validate(&self, n_structures: usize) -> Result<()> {
        if self.categories.len() != SEQUENCE_LEN {
            return Err(DesignError::CatalogMismatch(format!(
                "expected {} categories, found {} ({})",
                SEQUENCE_LEN,
                self.categories.len(),
                self.category_names().join(", ")
            )));
        }
        let size = self.pool_size().ok_or_else(|| {
            let counts = self
                .categories
                .iter()
                .map(|(name, items)| format!("{}={}", name, items.len()))
                .collect::<Vec<_>>()
                .join(", ");
            DesignError::CatalogMismatch(format!("unequal item counts per category: {}", counts))
        })?;
        if size < n_structures {
            return Err(DesignError::CatalogMismatch(format!(
                "each category needs at least {} items, found {}",
                n_structures, size
            )));
        }
        let mut seen = BTreeSet::new();
        for items in self.categories.values() {
            for item in items {
                if !seen.insert(item.as_str()) {
                    return Err(DesignError::CatalogMismatch(format!(
                        "item '{}' appears in more than one category",
                        item
                    )));
                }
            }
        }
        Ok(())
    }

    /// Asset file for `item` in `modality`. `None` for in-memory catalogs and
    /// unknown items.
    pub fn asset_path(&self, item: &str, modality: Modality) -> Option<PathBuf> {
        let root = self.root.as_ref()?;
        let (category, _) = self
            .categories
            .iter()
            .find(|(_, items)| items.iter().any(|i| i == item))?;
        Some(
            root.join(category)
                .join(format!("{}_{}.png", item, modality.as_str())),
        )
    }
}

fn scan_category(dir: &Path, category: &str) -> Result<Vec<ItemId>> {
    let mut images = BTreeSet::new();
    let mut texts = BTreeSet::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| DesignError::CatalogMismatch(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_hidden(&name) {
            continue;
        }
        match split_asset_name(&name) {
            Some((item, Modality::Image)) => {
                images.insert(item.to_string());
            }
            Some((item, Modality::Text)) => {
                texts.insert(item.to_string());
            }
            None => debug!(category, file = %name, "ignoring non-stimulus file"),
        }
    }
    if let Some(item) = images.difference(&texts).next() {
        return Err(DesignError::CatalogMismatch(format!(
            "missing text asset for {}/{}_img.png",
            category, item
        )));
    }
    if let Some(item) = texts.difference(&images).next() {
        return Err(DesignError::CatalogMismatch(format!(
            "missing image asset for {}/{}_txt.png",
            category, item
        )));
    }
    Ok(images.into_iter().collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// `categories` categories of `per_category` items each, ids `c{k}_{i}`.
    pub(crate) fn synthetic_catalog(categories: usize, per_category: usize) -> Catalog {
        let map = (0..categories)
            .map(|c| {
                let items = (0..per_category).map(|i| format!("c{}_{:02}", c, i)).collect();
                (format!("cat{}", c), items)
            })
            .collect();
        Catalog::new(map)
    }

    fn temp_root(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("cmseq_catalog_{}_{}_{}", tag, std::process::id(), nanos))
    }

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, b"png").expect("write asset");
    }

    #[test]
    fn validate_accepts_square_catalog() {
        synthetic_catalog(6, 6).validate(6).expect("6x6 is valid for 6 structures");
    }

    #[test]
    fn validate_rejects_small_or_unequal_pools() {
        let err = synthetic_catalog(6, 6).validate(12).expect_err("too few items");
        assert!(matches!(err, DesignError::CatalogMismatch(_)));

        let mut map: BTreeMap<String, Vec<ItemId>> = BTreeMap::new();
        for c in 0..6 {
            let n = if c == 3 { 5 } else { 6 };
            map.insert(format!("cat{}", c), (0..n).map(|i| format!("c{}_{}", c, i)).collect());
        }
        let err = Catalog::new(map).validate(6).expect_err("unequal pools");
        assert!(err.to_string().contains("unequal item counts"), "{}", err);
    }

    #[test]
    fn validate_rejects_wrong_category_count() {
        let err = synthetic_catalog(5, 6).validate(6).expect_err("five categories");
        assert!(err.to_string().contains("expected 6 categories"), "{}", err);
    }

    #[test]
    fn from_dir_pairs_image_and_text_assets() {
        let input = temp_root("pairs");
        let stims = input.join("stims").join("fr");
        for c in 0..6 {
            for i in 0..6 {
                touch(&stims.join(format!("cat{}", c)).join(format!("it{}x{}_img.png", c, i)));
                touch(&stims.join(format!("cat{}", c)).join(format!("it{}x{}_txt.png", c, i)));
            }
        }
        touch(&stims.join(".DS_Store"));
        touch(&stims.join("cat0").join("readme.png"));

        let catalog = Catalog::from_dir(&input, "fr").expect("scan");
        catalog.validate(6).expect("valid");
        assert_eq!(catalog.category_names().len(), 6);
        assert_eq!(catalog.items("cat2").map(|v| v.len()), Some(6));
        assert_eq!(
            catalog.asset_path("it2x3", Modality::Text),
            Some(stims.join("cat2").join("it2x3_txt.png"))
        );
        let _ = fs::remove_dir_all(input);
    }

    #[test]
    fn from_dir_reports_missing_text_asset() {
        let input = temp_root("missing");
        let cat = input.join("stims").join("en").join("animals");
        touch(&cat.join("cow_img.png"));
        touch(&cat.join("cat_img.png"));
        touch(&cat.join("cat_txt.png"));
        let err = Catalog::from_dir(&input, "en").expect_err("cow has no text asset");
        assert!(err.to_string().contains("cow_img.png"), "{}", err);
        let _ = fs::remove_dir_all(input);
    }

    #[test]
    fn from_dir_reports_missing_image_asset() {
        let input = temp_root("missing_img");
        let cat = input.join("stims").join("en").join("animals");
        touch(&cat.join("cat_img.png"));
        touch(&cat.join("cat_txt.png"));
        touch(&cat.join("owl_txt.png"));
        let err = Catalog::from_dir(&input, "en").expect_err("owl has no image asset");
        assert!(matches!(err, DesignError::CatalogMismatch(_)));
        let msg = err.to_string();
        assert!(msg.contains("missing image asset"), "{}", msg);
        assert!(msg.contains("owl_txt.png"), "{}", msg);
        let _ = fs::remove_dir_all(input);
    }

    #[test]
    fn from_dir_requires_language_directory() {
        let input = temp_root("nolang");
        assert!(matches!(
            Catalog::from_dir(&input, "de"),
            Err(DesignError::CatalogMismatch(_))
        ));
    }
}
