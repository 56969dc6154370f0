//! Configuration for the detection pipeline.
//!
//! Everything tunable lives here as an explicit object passed into the
//! pipeline at construction time: the resolution -> corner table, the
//! post-warp crop insets, the marker color ranges, and the stone classifier
//! profiles. Multiple configurations can coexist and be tested independently;
//! there are no module-level globals.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::geometry::{Point, Quad};

/// Fractional insets (0.0..0.5 per side) trimmed from the rectified square to
/// remove UI chrome that survives the warp on some layouts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CropInsets {
    #[serde(default)]
    pub top: f64,
    #[serde(default)]
    pub bottom: f64,
    #[serde(default)]
    pub left: f64,
    #[serde(default)]
    pub right: f64,
}

impl CropInsets {
    pub fn is_zero(&self) -> bool {
        self.top == 0.0 && self.bottom == 0.0 && self.left == 0.0 && self.right == 0.0
    }
}

/// Per-resolution board placement: where the board sits in the source image
/// and what to trim after rectification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardCalibration {
    /// Corners in source-pixel coordinates.
    /// Order: top-left, top-right, bottom-right, bottom-left.
    pub corners: [Point; 4],

    #[serde(default)]
    pub crop: CropInsets,
}

impl BoardCalibration {
    pub fn quad(&self) -> Quad {
        Quad(self.corners)
    }
}

/// An inclusive HSV box. Hue uses the half-degree scale (0..=180) so values
/// line up with the usual vision tooling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HsvRange {
    pub h_lo: u8,
    pub s_lo: u8,
    pub v_lo: u8,
    pub h_hi: u8,
    pub s_hi: u8,
    pub v_hi: u8,
}

impl HsvRange {
    pub const fn new(lo: (u8, u8, u8), hi: (u8, u8, u8)) -> Self {
        Self {
            h_lo: lo.0,
            s_lo: lo.1,
            v_lo: lo.2,
            h_hi: hi.0,
            s_hi: hi.1,
            v_hi: hi.2,
        }
    }

    pub fn contains(&self, h: u8, s: u8, v: u8) -> bool {
        (self.h_lo..=self.h_hi).contains(&h)
            && (self.s_lo..=self.s_hi).contains(&s)
            && (self.v_lo..=self.v_hi).contains(&v)
    }
}

/// An inclusive RGB box for the looser raw-color fallback.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RgbRange {
    pub lo: [u8; 3],
    pub hi: [u8; 3],
}

impl RgbRange {
    pub fn contains(&self, px: [u8; 3]) -> bool {
        (0..3).all(|c| (self.lo[c]..=self.hi[c]).contains(&px[c]))
    }
}

/// Marker locator tuning.
///
/// Black's last-move glyph is red, which wraps around hue 0 and needs two
/// HSV sub-ranges combined with OR. White's glyph is blue, a single range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerParams {
    /// Mask smoothing before morphology.
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,
    /// Radius of the closing element applied to the mask.
    #[serde(default = "default_morph_radius")]
    pub morph_radius: u8,

    /// Contour area bounds, in rectified pixels.
    #[serde(default = "default_min_area")]
    pub min_area: f64,
    #[serde(default = "default_max_area")]
    pub max_area: f64,
    /// Markers are compact; elongated regions are discarded.
    #[serde(default = "default_max_aspect")]
    pub max_aspect: f64,

    /// The glyph sits at the stone's upper-left, so the stone center lies
    /// this fraction of a cell toward the lower-right of the glyph center.
    #[serde(default = "default_stone_offset")]
    pub stone_offset_ratio: f32,

    pub red_hsv: [HsvRange; 2],
    pub blue_hsv: HsvRange,
    pub red_rgb: RgbRange,
    pub blue_rgb: RgbRange,
}

fn default_blur_sigma() -> f32 {
    0.8
}
fn default_morph_radius() -> u8 {
    1
}
fn default_min_area() -> f64 {
    2.0
}
fn default_max_area() -> f64 {
    10_000.0
}
fn default_max_aspect() -> f64 {
    6.0
}
fn default_stone_offset() -> f32 {
    0.5
}

impl Default for MarkerParams {
    fn default() -> Self {
        Self {
            // Red wraps hue 0: a low band and a high band.
            red_hsv: [
                HsvRange::new((0, 150, 150), (10, 255, 255)),
                HsvRange::new((160, 150, 150), (180, 255, 255)),
            ],
            blue_hsv: HsvRange::new((90, 80, 80), (135, 255, 255)),
            red_rgb: RgbRange {
                lo: [160, 15, 10],
                hi: [255, 110, 110],
            },
            blue_rgb: RgbRange {
                lo: [10, 15, 160],
                hi: [110, 110, 255],
            },
            blur_sigma: default_blur_sigma(),
            morph_radius: default_morph_radius(),
            min_area: default_min_area(),
            max_area: default_max_area(),
            max_aspect: default_max_aspect(),
            stone_offset_ratio: default_stone_offset(),
        }
    }
}

/// Thresholds for classifying one intersection patch.
///
/// A patch is empty when its mean matches the warm board wood (red and green
/// each clearly above blue) or when it is too colorful to be a stone;
/// otherwise brightness decides: below `dark_max` is a black stone, above
/// `light_min` a white one, anything between stays empty.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StoneProfile {
    pub dark_max: f64,
    pub light_min: f64,
    /// Max-channel minus min-channel ceiling; stones are achromatic.
    pub chroma_max: f64,
    pub bg_min_red: f64,
    pub bg_red_over_blue: f64,
    pub bg_green_over_blue: f64,
}

impl StoneProfile {
    /// Narrow bands, used first. On busy boards false positives are the
    /// costlier mistake.
    pub fn strict() -> Self {
        Self {
            dark_max: 90.0,
            light_min: 180.0,
            chroma_max: 50.0,
            bg_min_red: 150.0,
            bg_red_over_blue: 40.0,
            bg_green_over_blue: 20.0,
        }
    }

    /// Wider bands, used when the strict profile finds zero stones.
    pub fn relaxed() -> Self {
        Self {
            dark_max: 120.0,
            light_min: 150.0,
            chroma_max: 80.0,
            bg_min_red: 170.0,
            bg_red_over_blue: 60.0,
            bg_green_over_blue: 35.0,
        }
    }
}

/// Stone classifier tuning: the two threshold profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoneParams {
    pub strict: StoneProfile,
    pub relaxed: StoneProfile,
}

impl Default for StoneParams {
    fn default() -> Self {
        Self {
            strict: StoneProfile::strict(),
            relaxed: StoneProfile::relaxed(),
        }
    }
}

/// The full pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Board placements keyed by `"{width}x{height}"` of the source capture.
    #[serde(default)]
    pub boards: HashMap<String, BoardCalibration>,

    #[serde(default)]
    pub marker: MarkerParams,

    #[serde(default)]
    pub stones: StoneParams,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let mut boards = HashMap::new();
        // The phone layout the thresholds were tuned against.
        boards.insert(
            "1200x2670".to_string(),
            BoardCalibration {
                corners: [
                    Point::new(40.0, 536.0),
                    Point::new(1160.0, 536.0),
                    Point::new(1160.0, 1650.0),
                    Point::new(40.0, 1650.0),
                ],
                crop: CropInsets::default(),
            },
        );
        Self {
            boards,
            marker: MarkerParams::default(),
            stones: StoneParams::default(),
        }
    }
}

impl DetectorConfig {
    /// Look up the board placement for a source image size.
    pub fn board_for(&self, width: u32, height: u32) -> Option<&BoardCalibration> {
        self.boards.get(&resolution_key(width, height))
    }

    /// Load configuration from a file, or create default if it doesn't exist.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: DetectorConfig = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = DetectorConfig::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        Ok(())
    }
}

/// The table key for a capture size.
pub fn resolution_key(width: u32, height: u32) -> String {
    format!("{}x{}", width, height)
}
