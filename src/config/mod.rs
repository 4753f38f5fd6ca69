//! Process configuration
//!
//! The helper is spawned by the session manager with its two peer sockets
//! already open; everything it needs arrives through the environment rather
//! than a config file:
//!
//! - `XORGXRDP_XORG_FD` - descriptor of the display-server link
//! - `XORGXRDP_XRDP_FD` - descriptor of the RDP-server link
//! - `VA_DRM_DEVICE` - optional DRM render node override (DMA-BUF encoder)
//! - `YAMI_INF_LIB` - optional path override for the yami encoder library
//! - `DISPLAY` - consumed by Xlib when the GPU layer opens the display

use std::env;
use std::os::fd::RawFd;
use std::path::PathBuf;

use thiserror::Error;

/// Environment variable carrying the display-server socket.
pub const ENV_XORG_FD: &str = "XORGXRDP_XORG_FD";

/// Environment variable carrying the RDP-server socket.
pub const ENV_XRDP_FD: &str = "XORGXRDP_XRDP_FD";

/// Environment variable overriding the DRM render node.
pub const ENV_DRM_DEVICE: &str = "VA_DRM_DEVICE";

/// Environment variable overriding the yami library path.
pub const ENV_YAMI_LIB: &str = "YAMI_INF_LIB";

/// Default DRM render node for the DMA-BUF encoder backend.
pub const DEFAULT_DRM_DEVICE: &str = "/dev/dri/renderD128";

/// Well-known install path of the yami encoder library.
pub const DEFAULT_YAMI_LIB: &str = "/opt/yami/lib/libyami_inf.so";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is not set")]
    MissingEnv { name: &'static str },

    #[error("{name} is not a valid descriptor: {value:?}")]
    BadFd { name: &'static str, value: String },
}

/// Everything the helper reads from its environment at startup.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    /// Inherited socket to the display server (8-byte framed).
    pub xorg_fd: RawFd,

    /// Inherited socket to the RDP server (4-byte framed).
    pub xrdp_fd: RawFd,

    /// DRM render node used by the DMA-BUF encoder backend.
    pub drm_device: PathBuf,

    /// Override for the yami library; `None` means the well-known install
    /// path with a fallback to the loader's search.
    pub yami_lib: Option<PathBuf>,
}

impl HelperConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            xorg_fd: fd_from_env(ENV_XORG_FD)?,
            xrdp_fd: fd_from_env(ENV_XRDP_FD)?,
            drm_device: env::var_os(ENV_DRM_DEVICE)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DRM_DEVICE)),
            yami_lib: env::var_os(ENV_YAMI_LIB).map(PathBuf::from),
        })
    }
}

fn fd_from_env(name: &'static str) -> Result<RawFd, ConfigError> {
    let value = env::var(name).map_err(|_| ConfigError::MissingEnv { name })?;
    value
        .trim()
        .parse::<RawFd>()
        .ok()
        .filter(|fd| *fd >= 0)
        .ok_or(ConfigError::BadFd { name, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_parsing_rejects_garbage() {
        env::set_var("RDP_GFX_TEST_FD_A", "17");
        env::set_var("RDP_GFX_TEST_FD_B", "not-a-number");
        env::set_var("RDP_GFX_TEST_FD_C", "-3");

        assert_eq!(fd_from_env("RDP_GFX_TEST_FD_A").unwrap(), 17);
        assert!(fd_from_env("RDP_GFX_TEST_FD_B").is_err());
        assert!(fd_from_env("RDP_GFX_TEST_FD_C").is_err());
        assert!(fd_from_env("RDP_GFX_TEST_FD_UNSET").is_err());
    }
}
