//! Device connection management
//!
//! Owns the device handle for the lifetime of a session. Other components get
//! a copy of the handle for their calls but never open or close the device.

use parking_lot::Mutex;
use seqcam_core::{
    CaptureError, CaptureResult, CaptureStatus, DeviceHandle, DriverGateway, ImageSize,
};
use std::sync::Arc;

/// Manages the connection to the driver and the open camera.
pub struct DeviceConnection {
    gateway: Arc<dyn DriverGateway>,
    handle: Mutex<Option<DeviceHandle>>,
}

impl DeviceConnection {
    /// Create a new, unconnected connection manager.
    pub fn new(gateway: Arc<dyn DriverGateway>) -> Self {
        Self {
            gateway,
            handle: Mutex::new(None),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn DriverGateway> {
        &self.gateway
    }

    /// Open the camera.
    pub fn open(&self) -> CaptureResult<DeviceHandle> {
        let mut handle = self.handle.lock();
        if let Some(existing) = *handle {
            return Err(CaptureError::InvalidState(format!(
                "device already open as {}",
                existing
            )));
        }
        let opened = self.gateway.open()?;
        tracing::info!(driver = self.gateway.name(), device = %opened, "device opened");
        *handle = Some(opened);
        Ok(opened)
    }

    /// Close the camera.
    ///
    /// Returns `Ok(false)` when no device was open. The handle is invalidated
    /// even if the driver reports a failure, since its state is unknown.
    pub fn close(&self) -> CaptureResult<bool> {
        let Some(device) = self.handle.lock().take() else {
            return Ok(false);
        };
        match self.gateway.close(device) {
            Ok(()) => {
                tracing::info!(device = %device, "device closed");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(device = %device, error = %e, "device close failed");
                Err(e.into())
            }
        }
    }

    pub fn handle(&self) -> Option<DeviceHandle> {
        *self.handle.lock()
    }

    pub fn require_handle(&self) -> CaptureResult<DeviceHandle> {
        self.handle().ok_or(CaptureError::NotOpen)
    }

    pub fn is_open(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Frame size used to allocate sequence buffers.
    ///
    /// With arbitrary AOI support the sensor's full size is used so any later
    /// AOI fits. Without it the current AOI is used instead.
    pub fn frame_geometry(&self) -> CaptureResult<ImageSize> {
        let device = self.require_handle()?;
        if self.gateway.arbitrary_aoi_supported(device)? {
            Ok(self.gateway.sensor_info(device)?.max_size())
        } else {
            // NOTE: assumes the current AOI is the largest size the sensor will
            // deliver. A larger AOI set later would overflow these buffers.
            Ok(self.gateway.aoi_image_size(device)?)
        }
    }

    /// Driver-side capture fault counters.
    pub fn capture_status(&self) -> CaptureResult<CaptureStatus> {
        let device = self.require_handle()?;
        Ok(self.gateway.capture_status(device)?)
    }
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("gateway", &self.gateway.name())
            .field("handle", &self.handle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqcam_core::DriverErrorKind;
    use seqcam_driver_mock::{ErrorConfig, ErrorScenario, MockGateway};

    #[test]
    fn test_open_close() {
        let mock = Arc::new(MockGateway::new());
        let conn = DeviceConnection::new(mock.clone());
        assert!(matches!(conn.require_handle(), Err(CaptureError::NotOpen)));

        let dev = conn.open().unwrap();
        assert_eq!(conn.handle(), Some(dev));
        assert!(matches!(conn.open(), Err(CaptureError::InvalidState(_))));

        assert!(conn.close().unwrap());
        assert!(!conn.is_open());
        assert!(!conn.close().unwrap(), "second close is a no-op");
    }

    #[test]
    fn test_failed_close_still_invalidates_handle() {
        let mock = Arc::new(
            MockGateway::builder()
                .error_config(ErrorConfig::scenario(ErrorScenario::Once {
                    operation: "close",
                    kind: DriverErrorKind::Transport,
                }))
                .build(),
        );
        let conn = DeviceConnection::new(mock);
        conn.open().unwrap();
        assert!(conn.close().unwrap_err().is_transport());
        assert!(conn.handle().is_none());
    }

    #[test]
    fn test_geometry_uses_sensor_max_with_arbitrary_aoi() {
        let mock = Arc::new(
            MockGateway::builder()
                .sensor_size(1280, 1024)
                .aoi(640, 480)
                .arbitrary_aoi(true)
                .build(),
        );
        let conn = DeviceConnection::new(mock);
        conn.open().unwrap();
        assert_eq!(conn.frame_geometry().unwrap(), ImageSize::new(1280, 1024));
    }

    #[test]
    fn test_geometry_falls_back_to_current_aoi() {
        let mock = Arc::new(
            MockGateway::builder()
                .sensor_size(1280, 1024)
                .aoi(640, 480)
                .arbitrary_aoi(false)
                .build(),
        );
        let conn = DeviceConnection::new(mock);
        conn.open().unwrap();
        assert_eq!(conn.frame_geometry().unwrap(), ImageSize::new(640, 480));
    }
}
