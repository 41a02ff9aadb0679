//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [network]
//! stream_port = 1100
//! command_port = 1101
//! broadcast_port = 1102
//! request_port = 1103
//! broadcast_address = "255.255.255.255"
//!
//! [camera]
//! name = "Front Door"
//! group = "default"
//! fps = 24
//! resolution = "VGA"
//! resolution_ceiling = "HD1080"
//! auto_regulate = true
//! jpeg_quality = 75
//! shrink_ratio = 1.0
//! grayscale = false
//! recordings_path = "recordings"
//!
//! [station]
//! group = "default"
//! save_incoming_media = false
//! recordings_path = "recordings"
//! image_quality = 75
//! ```
//!
//! A process runs as a camera, a station or both; the corresponding
//! section may be omitted for the role it does not play. Port fields
//! default to the fixed protocol constants; port 0 selects an ephemeral
//! port, which only makes sense in tests.

use crate::camera::CameraSettings;
use crate::error::{Error, Result};
use crate::station::StationSettings;
use crate::types::{Resolution, MAX_FPS, MIN_FPS};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Network section shared by both roles
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,

    #[serde(default = "default_command_port")]
    pub command_port: u16,

    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,

    #[serde(default = "default_request_port")]
    pub request_port: u16,

    /// Where the camera sends announcements. The LAN broadcast address in
    /// production; a unicast address for bench setups.
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
}

fn default_stream_port() -> u16 {
    crate::types::STREAM_PORT
}
fn default_command_port() -> u16 {
    crate::types::COMMAND_PORT
}
fn default_broadcast_port() -> u16 {
    crate::types::BROADCAST_PORT
}
fn default_request_port() -> u16 {
    crate::types::REQUEST_PORT
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            stream_port: default_stream_port(),
            command_port: default_command_port(),
            broadcast_port: default_broadcast_port(),
            request_port: default_request_port(),
            broadcast_address: default_broadcast_address(),
        }
    }
}

/// Camera role configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_camera_name")]
    pub name: String,

    #[serde(default = "default_group")]
    pub group: String,

    /// Stream frame rate, 10..=60
    #[serde(default = "default_fps")]
    pub fps: u8,

    #[serde(default = "default_resolution")]
    pub resolution: Resolution,

    /// Administrative ceiling for adaptive regulation
    #[serde(default = "default_ceiling")]
    pub resolution_ceiling: Resolution,

    #[serde(default = "default_true")]
    pub auto_regulate: bool,

    /// JPEG encoder quality, 1..=100
    #[serde(default = "default_quality")]
    pub jpeg_quality: u8,

    /// Linear downscale applied by the grabber, (0, 1]
    #[serde(default = "default_ratio")]
    pub shrink_ratio: f32,

    #[serde(default)]
    pub grayscale: bool,

    #[serde(default = "default_recordings_path")]
    pub recordings_path: PathBuf,
}

/// Station role configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StationConfig {
    #[serde(default = "default_group")]
    pub group: String,

    #[serde(default)]
    pub save_incoming_media: bool,

    #[serde(default = "default_recordings_path")]
    pub recordings_path: PathBuf,

    /// Advertised encoder quality, 0..=100
    #[serde(default = "default_quality")]
    pub image_quality: u8,
}

fn default_camera_name() -> String {
    "QCCTV Camera".to_string()
}
fn default_group() -> String {
    "default".to_string()
}
fn default_fps() -> u8 {
    24
}
fn default_resolution() -> Resolution {
    Resolution::Vga
}
fn default_ceiling() -> Resolution {
    Resolution::Hd1080
}
fn default_true() -> bool {
    true
}
fn default_quality() -> u8 {
    75
}
fn default_ratio() -> f32 {
    1.0
}
fn default_recordings_path() -> PathBuf {
    PathBuf::from("recordings")
}

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub camera: Option<CameraConfig>,

    #[serde(default)]
    pub station: Option<StationConfig>,
}

impl Config {
    /// Load and validate a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;
        Self::parse(&content)
    }

    /// Parse and validate TOML configuration text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = basic_toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        if let Some(camera) = &config.camera {
            if !(MIN_FPS..=MAX_FPS).contains(&camera.fps) {
                return Err(Error::Config(format!(
                    "fps must be between {} and {} (got {})",
                    MIN_FPS, MAX_FPS, camera.fps
                )));
            }
            if !(camera.shrink_ratio.is_finite()
                && camera.shrink_ratio > 0.0
                && camera.shrink_ratio <= 1.0)
            {
                return Err(Error::Config(format!(
                    "shrink_ratio must be in (0, 1] (got {})",
                    camera.shrink_ratio
                )));
            }
            if camera.jpeg_quality == 0 || camera.jpeg_quality > 100 {
                return Err(Error::Config(format!(
                    "jpeg_quality must be in 1..=100 (got {})",
                    camera.jpeg_quality
                )));
            }
            if camera.resolution > camera.resolution_ceiling {
                return Err(Error::Config(format!(
                    "resolution {} exceeds resolution_ceiling {}",
                    camera.resolution, camera.resolution_ceiling
                )));
            }
        }

        if let Some(station) = &config.station {
            if station.image_quality > 100 {
                return Err(Error::Config(format!(
                    "image_quality must be in 0..=100 (got {})",
                    station.image_quality
                )));
            }
        }

        Ok(config)
    }

    /// Build runtime camera settings; `Err` when the [camera] section is
    /// missing
    pub fn camera_settings(&self) -> Result<CameraSettings> {
        let camera = self
            .camera
            .as_ref()
            .ok_or_else(|| Error::Config("missing [camera] section".into()))?;
        Ok(CameraSettings {
            name: camera.name.clone(),
            group: camera.group.clone(),
            fps: camera.fps,
            resolution: camera.resolution,
            resolution_ceiling: camera.resolution_ceiling,
            auto_regulate: camera.auto_regulate,
            jpeg_quality: camera.jpeg_quality,
            stream_port: self.network.stream_port,
            command_port: self.network.command_port,
            request_port: self.network.request_port,
            broadcast_port: self.network.broadcast_port,
            broadcast_address: self.network.broadcast_address.clone(),
        })
    }

    /// Build runtime station settings; `Err` when the [station] section is
    /// missing
    pub fn station_settings(&self) -> Result<StationSettings> {
        let station = self
            .station
            .as_ref()
            .ok_or_else(|| Error::Config("missing [station] section".into()))?;
        Ok(StationSettings {
            group: station.group.clone(),
            stream_port: self.network.stream_port,
            command_port: self.network.command_port,
            request_port: self.network.request_port,
            broadcast_port: self.network.broadcast_port,
            save_incoming_media: station.save_incoming_media,
            recordings_path: station.recordings_path.clone(),
            image_quality: station.image_quality,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_camera_config() {
        let config = Config::parse(
            r#"
            [camera]
            name = "Front Door"
            "#,
        )
        .expect("parse");

        let camera = config.camera.as_ref().unwrap();
        assert_eq!(camera.name, "Front Door");
        assert_eq!(camera.fps, 24);
        assert_eq!(camera.resolution, Resolution::Vga);
        assert_eq!(config.network.stream_port, 1100);

        let settings = config.camera_settings().unwrap();
        assert_eq!(settings.broadcast_port, 1102);
        assert!(config.station_settings().is_err());
    }

    #[test]
    fn test_resolution_names() {
        let config = Config::parse(
            r#"
            [camera]
            resolution = "HD720"
            resolution_ceiling = "HD1080"
            "#,
        )
        .expect("parse");
        assert_eq!(config.camera.unwrap().resolution, Resolution::Hd720);
    }

    #[test]
    fn test_fps_out_of_range_rejected() {
        let result = Config::parse(
            r#"
            [camera]
            fps = 120
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_shrink_ratio_rejected() {
        assert!(Config::parse("[camera]\nshrink_ratio = 0.0").is_err());
        assert!(Config::parse("[camera]\nshrink_ratio = 1.5").is_err());
    }

    #[test]
    fn test_resolution_above_ceiling_rejected() {
        let result = Config::parse(
            r#"
            [camera]
            resolution = "HD1080"
            resolution_ceiling = "VGA"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_station_section() {
        let config = Config::parse(
            r#"
            [network]
            broadcast_port = 2202

            [station]
            group = "warehouse"
            save_incoming_media = true
            "#,
        )
        .expect("parse");

        let settings = config.station_settings().unwrap();
        assert_eq!(settings.group, "warehouse");
        assert!(settings.save_incoming_media);
        assert_eq!(settings.broadcast_port, 2202);
    }
}
