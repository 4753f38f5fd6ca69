//! Per-monitor GPU state

use std::os::raw::c_ulong;

use crate::encoder::EncoderContext;

use super::backend::GlImage;
use super::shaders::ShaderKind;
use super::vertices;
use super::Rect;

/// Memory layout of the encode texture, fixed by the encoder backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// Tile-packed single-channel W x 3H/2 (NVENC NV12 registration).
    Yuv420,
    /// Packed [Y0 U Y1 V] words, W/2 x H RGBA8 (yami YUY2 export).
    Yuv422,
    /// Packed A8Y8U8V8, W x H RGBA8.
    Yuv444,
}

impl OutputLayout {
    pub fn shader(self) -> ShaderKind {
        match self {
            OutputLayout::Yuv420 => ShaderKind::Yuv420,
            OutputLayout::Yuv422 => ShaderKind::Yuv422,
            OutputLayout::Yuv444 => ShaderKind::Yuv444,
        }
    }

    /// Dimensions of the encode texture for a WxH monitor.
    pub fn texture_size(self, width: u16, height: u16) -> (i32, i32) {
        match self {
            OutputLayout::Yuv420 => (width as i32, height as i32 * 3 / 2),
            OutputLayout::Yuv422 => (width as i32 / 2, height as i32),
            OutputLayout::Yuv444 => (width as i32, height as i32),
        }
    }

    pub fn internal_format(self) -> i32 {
        match self {
            OutputLayout::Yuv420 => glow::R8 as i32,
            OutputLayout::Yuv422 | OutputLayout::Yuv444 => glow::RGBA8 as i32,
        }
    }

    pub fn pixel_format(self) -> u32 {
        match self {
            OutputLayout::Yuv420 => glow::RED,
            OutputLayout::Yuv422 | OutputLayout::Yuv444 => glow::RGBA,
        }
    }

    /// Viewport covering the whole encode texture.
    pub fn viewport(self, width: u16, height: u16) -> Rect {
        let (w, h) = self.texture_size(width, height);
        Rect {
            x: 0,
            y: 0,
            w: w as u16,
            h: h as u16,
        }
    }

    /// Vertex list for a dirty-rect set in this layout.
    pub fn vertices(self, crects: &[Rect], width: u16, height: u16) -> (Vec<f32>, i32) {
        match self {
            OutputLayout::Yuv420 => vertices::yuv420_quads(crects, width, height),
            OutputLayout::Yuv422 | OutputLayout::Yuv444 => {
                vertices::packed_quads(crects, width, height)
            }
        }
    }
}

/// One logical display: the imported pixmap, its textures, and the encoder
/// bound to them. Owned exclusively by the monitor table; destroyed on
/// "delete all pixmaps" or process exit.
pub struct Monitor {
    pub(crate) width: u16,
    pub(crate) height: u16,
    pub(crate) pixmap: c_ulong,
    pub(crate) image: GlImage,
    pub(crate) bmp_texture: glow::Texture,
    pub(crate) enc_texture: glow::Texture,
    pub(crate) layout: OutputLayout,
    pub(crate) viewport: Rect,
    pub(crate) encoder: EncoderContext,
    pub(crate) pending_key_frames: u32,
}

impl Monitor {
    pub fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    pub fn layout(&self) -> OutputLayout {
        self.layout
    }

    /// Frames encoded through this monitor's encoder context.
    pub fn frame_count(&self) -> u64 {
        self.encoder.frame_count()
    }

    /// Ask for the next frame to be a key frame.
    pub fn request_key_frame(&mut self) {
        self.pending_key_frames += 1;
    }

    pub fn pending_key_frames(&self) -> u32 {
        self.pending_key_frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_texture_sizes() {
        assert_eq!(OutputLayout::Yuv420.texture_size(1920, 1080), (1920, 1620));
        assert_eq!(OutputLayout::Yuv422.texture_size(1920, 1080), (960, 1080));
        assert_eq!(OutputLayout::Yuv444.texture_size(1920, 1080), (1920, 1080));
    }

    #[test]
    fn layout_viewports_cover_texture() {
        let vp = OutputLayout::Yuv420.viewport(1920, 1080);
        assert_eq!((vp.w, vp.h), (1920, 1620));
        let vp = OutputLayout::Yuv422.viewport(1920, 1080);
        assert_eq!((vp.w, vp.h), (960, 1080));
    }

    #[test]
    fn layout_shader_selection() {
        assert_eq!(OutputLayout::Yuv420.shader(), ShaderKind::Yuv420);
        assert_eq!(OutputLayout::Yuv422.shader(), ShaderKind::Yuv422);
        assert_eq!(OutputLayout::Yuv444.shader(), ShaderKind::Yuv444);
    }
}
