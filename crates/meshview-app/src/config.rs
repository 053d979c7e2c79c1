// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::demo;

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RenderCfg {
    #[serde(default = "default_clear")]
    pub clear_color: [f32; 4],
    /// Overrides the build default; `MESHVIEW_VALIDATION` still wins.
    #[serde(default)]
    pub validation: Option<bool>,
    #[serde(default)]
    pub min_image_count: Option<u32>,
    /// Redraw every loop iteration instead of only on window events.
    #[serde(default)]
    pub continuous: bool,
}

impl Default for RenderCfg {
    fn default() -> Self {
        RenderCfg {
            clear_color: default_clear(),
            validation: None,
            min_image_count: None,
            continuous: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SceneCfg {
    #[serde(default = "demo::default_polygons")]
    pub polygons: Vec<Vec<[f64; 2]>>,
}

impl Default for SceneCfg {
    fn default() -> Self {
        SceneCfg {
            polygons: demo::default_polygons(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct AppCfg {
    #[serde(default)]
    pub render: RenderCfg,
    #[serde(default)]
    pub scene: SceneCfg,
}

fn default_clear() -> [f32; 4] {
    [1.0, 1.0, 1.0, 1.0]
}

pub fn parse_cfg(text: &str) -> AppCfg {
    toml::from_str::<AppCfg>(text).unwrap_or_else(|e| {
        warn!("config ignored: {e}");
        AppCfg::default()
    })
}

pub fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s),
        Err(_) => AppCfg::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse_cfg("");
        assert_eq!(cfg.render.clear_color, [1.0; 4]);
        assert_eq!(cfg.render.validation, None);
        assert_eq!(cfg.scene.polygons, demo::default_polygons());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_cfg(
            r#"
            [render]
            clear_color = [0.0, 0.0, 0.0, 1.0]
            min_image_count = 3

            [scene]
            polygons = [[[0.0, 0.0], [10.0, 0.0], [0.0, 10.0]]]
            "#,
        );
        assert_eq!(cfg.render.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(cfg.render.min_image_count, Some(3));
        assert!(!cfg.render.continuous);
        assert_eq!(cfg.scene.polygons.len(), 1);
        assert_eq!(cfg.scene.polygons[0][1], [10.0, 0.0]);
    }

    #[test]
    fn malformed_file_falls_back() {
        let cfg = parse_cfg("[render]\nclear_color = \"white\"\n");
        assert_eq!(cfg.render.clear_color, [1.0; 4]);
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = load_cfg(Path::new("/nonexistent/meshview.toml"));
        assert!(!cfg.render.continuous);
    }
}
