//! Crop catalog
//!
//! The set of crops the engine knows about: which seasons they are grown in
//! and which districts typically grow them. Recommendation candidates and the
//! training corpus are both drawn from here.

use crate::error::{EngineError, Result};
use crate::models::Season;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Catalog entry describing one crop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CropProfile {
    pub crop_id: String,
    pub name: String,
    #[serde(default)]
    pub name_tamil: Option<String>,
    pub category: String,
    pub seasons: Vec<Season>,
    /// Districts where the crop is commonly grown; "All" matches any district
    #[serde(default)]
    pub typical_districts: Vec<String>,
}

impl CropProfile {
    pub fn grown_in(&self, season: Season) -> bool {
        self.seasons.contains(&season)
    }

    pub fn is_typical_for(&self, district: &str) -> bool {
        self.typical_districts
            .iter()
            .any(|d| d.eq_ignore_ascii_case(district) || d.eq_ignore_ascii_case("all"))
    }
}

/// Ordered collection of crop profiles
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CropCatalog {
    crops: Vec<CropProfile>,
}

impl CropCatalog {
    /// Build a catalog, rejecting blank or duplicate crop ids
    pub fn new(mut crops: Vec<CropProfile>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for crop in &crops {
            if crop.crop_id.trim().is_empty() {
                return Err(EngineError::invalid("catalog entry with empty crop_id"));
            }
            if !seen.insert(crop.crop_id.clone()) {
                return Err(EngineError::invalid(format!(
                    "duplicate crop_id '{}' in catalog",
                    crop.crop_id
                )));
            }
        }
        crops.sort_by(|a, b| a.crop_id.cmp(&b.crop_id));
        Ok(Self { crops })
    }

    /// Load a catalog from a JSON array of profiles
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let crops: Vec<CropProfile> = serde_json::from_str(&raw)
            .map_err(|e| EngineError::invalid(format!("invalid catalog {:?}: {}", path, e)))?;
        Self::new(crops)
    }

    /// Staple crops of Tamil Nadu districts
    pub fn tamil_nadu() -> Self {
        fn crop(
            id: &str,
            name: &str,
            tamil: &str,
            category: &str,
            seasons: &[Season],
            districts: &[&str],
        ) -> CropProfile {
            CropProfile {
                crop_id: id.to_string(),
                name: name.to_string(),
                name_tamil: Some(tamil.to_string()),
                category: category.to_string(),
                seasons: seasons.to_vec(),
                typical_districts: districts.iter().map(|d| d.to_string()).collect(),
            }
        }

        let mut crops = vec![
            crop("rice", "Rice", "அரிசி", "cereal", &[Season::Kharif, Season::Rabi], &["Thanjavur", "Madurai", "Trichy"]),
            crop("sugarcane", "Sugarcane", "கரும்பு", "cash", &[Season::Kharif], &["Coimbatore", "Erode", "Salem"]),
            crop("cotton", "Cotton", "பருத்தி", "fibre", &[Season::Kharif], &["Coimbatore", "Erode"]),
            crop("groundnut", "Groundnut", "வேர்க்கடலை", "oilseed", &[Season::Kharif, Season::Zaid], &["Vellore", "Krishnagiri"]),
            crop("chili", "Chili", "மிளகாய்", "spice", &[Season::Kharif, Season::Rabi], &["Ramanathapuram", "Thanjavur"]),
            crop("wheat", "Wheat", "கோதுமை", "cereal", &[Season::Rabi], &["Vellore", "Krishnagiri"]),
            crop("chickpea", "Chickpea", "கடலை", "pulse", &[Season::Rabi], &["Vellore", "Krishnagiri"]),
            crop("mustard", "Mustard", "கடுகு", "oilseed", &[Season::Rabi], &["Vellore", "Krishnagiri"]),
            crop("onion", "Onion", "வெங்காயம்", "vegetable", &[Season::Rabi, Season::Zaid], &["Coimbatore", "Erode"]),
            crop("vegetables", "Vegetables", "காய்கறிகள்", "vegetable", &[Season::Zaid], &["All"]),
            crop("turmeric", "Turmeric", "மஞ்சள்", "spice", &[Season::Zaid], &["Erode", "Salem"]),
        ];
        crops.sort_by(|a, b| a.crop_id.cmp(&b.crop_id));
        Self { crops }
    }

    pub fn get(&self, crop_id: &str) -> Option<&CropProfile> {
        self.crops.iter().find(|c| c.crop_id == crop_id)
    }

    /// Crops grown in `season`, ordered by crop id
    pub fn for_season(&self, season: Season) -> impl Iterator<Item = &CropProfile> {
        self.crops.iter().filter(move |c| c.grown_in(season))
    }

    /// Every (crop_id, district) pair named by the catalog plus `extra_districts`
    pub fn series_keys(&self, extra_districts: &[String]) -> Vec<(String, String)> {
        let mut keys = BTreeSet::new();
        for crop in &self.crops {
            for district in crop
                .typical_districts
                .iter()
                .filter(|d| !d.eq_ignore_ascii_case("all"))
                .chain(extra_districts.iter())
            {
                keys.insert((crop.crop_id.clone(), district.clone()));
            }
        }
        keys.into_iter().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CropProfile> {
        self.crops.iter()
    }

    pub fn len(&self) -> usize {
        self.crops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crops.is_empty()
    }
}
