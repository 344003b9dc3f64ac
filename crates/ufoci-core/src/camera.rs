//! Camera interface.
//!
//! The driver stack itself is external. [`ScriptCamera`] drives it through
//! the resolved scripts; tests and plugins may substitute another
//! implementation through the `camera` filter hook.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::scripts::ScriptManager;

/// Filter hook over the `Arc<dyn Camera>` used by tests.
pub const CAMERA_HOOK: &str = "camera";

/// Failures talking to the camera.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CameraError {
    #[error("PCI communication failed: {0}")]
    Pci(String),

    #[error("frame decoding failed: {0}")]
    FrameDecoding(String),
}

/// One decoded frame, row-major.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u16>,
}

impl Frame {
    /// Decode little-endian 16 bit pixels.
    pub fn from_le_bytes(width: u32, height: u32, bytes: &[u8]) -> Result<Self, CameraError> {
        let expected = width as usize * height as usize * 2;
        if bytes.len() != expected {
            return Err(CameraError::FrameDecoding(format!(
                "expected {expected} bytes for a {width}x{height} frame, got {}",
                bytes.len()
            )));
        }
        let pixels = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self { width, height, pixels })
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels.get((y * self.width + x) as usize).copied()
    }

    pub fn mean(&self) -> f64 {
        if self.pixels.is_empty() {
            return 0.0;
        }
        self.pixels.iter().map(|&p| f64::from(p)).sum::<f64>() / self.pixels.len() as f64
    }
}

#[async_trait]
pub trait Camera: Send + Sync {
    async fn set_up(&self) -> Result<(), CameraError>;

    async fn tear_down(&self) -> Result<(), CameraError>;

    async fn get_frame(&self) -> Result<Frame, CameraError>;
}

/// Camera operated through the `pcie_init`, `power_up`, `capture_frame`, ...
/// scripts.
pub struct ScriptCamera {
    scripts: Arc<ScriptManager>,
    width: u32,
    height: u32,
    frame_path: PathBuf,
}

impl ScriptCamera {
    pub fn new(scripts: Arc<ScriptManager>) -> Self {
        let camera = &scripts.config().camera;
        let (width, height) = (camera.sensor_width, camera.sensor_height);
        let frame_path = std::env::temp_dir().join(format!("ufoci_frame_{}.raw", std::process::id()));
        Self {
            scripts,
            width,
            height,
            frame_path,
        }
    }

    async fn run(&self, name: &str, args: &[String]) -> Result<(), CameraError> {
        let result = self
            .scripts
            .invoke(name, args, false)
            .await
            .map_err(|e| CameraError::Pci(e.to_string()))?;
        if !result.success() {
            return Err(CameraError::Pci(format!(
                "script '{name}' exited with code {}: {}",
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Camera for ScriptCamera {
    async fn set_up(&self) -> Result<(), CameraError> {
        for script in ["pcie_init", "reset_fpga", "power_up", "reset", "status"] {
            self.run(script, &[]).await?;
        }
        info!("Camera set up");
        Ok(())
    }

    async fn tear_down(&self) -> Result<(), CameraError> {
        for script in ["power_down", "status"] {
            self.run(script, &[]).await?;
        }
        info!("Camera torn down");
        Ok(())
    }

    async fn get_frame(&self) -> Result<Frame, CameraError> {
        let path = self.frame_path.to_string_lossy().to_string();
        self.run("capture_frame", &[path]).await?;

        let bytes = tokio::fs::read(&self.frame_path)
            .await
            .map_err(|e| CameraError::FrameDecoding(format!("cannot read {}: {e}", self.frame_path.display())))?;
        debug!(bytes = bytes.len(), "Received raw frame");
        Frame::from_le_bytes(self.width, self.height, &bytes)
    }
}

/// In-memory camera producing a constant frame or a fixed error.
#[derive(Debug, Clone)]
pub struct MockCamera {
    pub width: u32,
    pub height: u32,
    pub value: u16,
    pub error: Option<CameraError>,
}

impl MockCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            value: 0,
            error: None,
        }
    }

    pub fn failing(error: CameraError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(1, 1)
        }
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn set_up(&self) -> Result<(), CameraError> {
        Ok(())
    }

    async fn tear_down(&self) -> Result<(), CameraError> {
        Ok(())
    }

    async fn get_frame(&self) -> Result<Frame, CameraError> {
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        Ok(Frame {
            width: self.width,
            height: self.height,
            pixels: vec![self.value; (self.width * self.height) as usize],
        })
    }
}
