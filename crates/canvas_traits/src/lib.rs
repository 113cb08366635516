//! Collaborator traits the interpreter calls through instead of owning a
//! concrete implementation: wire decoding of full images/tiles and
//! brush-parameter interpretation are explicitly out of scope for the
//! core (see spec §1/§6), so this crate defines the contracts only.
//! `canvas_codec` ships one concrete, test-grade implementation of
//! [`ImageCodec`]; production embedders are expected to supply their own.

use canvas_error::CanvasError;
use canvas_pixel::BlendMode;

/// Zlib-style deflate/inflate of raw pixel payloads. `inflate` is handed
/// the number of bytes the caller expects back (width*height*4, or a
/// tile's fixed byte length) so a size mismatch can be reported as a
/// [`CanvasError::DecodeError`] rather than silently truncating or
/// panicking on a short buffer.
pub trait ImageCodec {
    fn inflate(&self, bytes: &[u8], expected_len: usize) -> Result<Vec<u8>, CanvasError>;
    fn deflate(&self, bytes: &[u8]) -> Vec<u8>;
}

/// Brush-parameter interpretation is delegated entirely to this
/// collaborator: the core only needs to know whether
/// a requested blend mode is legal for a brush operation before it
/// commits to compositing dabs with it.
pub trait Paint {
    fn blend_compatible(&self, mode: BlendMode) -> bool;
}

/// The default gate used wherever no [`Paint`] collaborator is supplied:
/// brush operations accept [`BlendMode::is_brush_compatible`] as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPaint;

impl Paint for DefaultPaint {
    fn blend_compatible(&self, mode: BlendMode) -> bool {
        mode.is_brush_compatible()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paint_matches_blend_mode_brush_compatibility() {
        let paint = DefaultPaint;
        assert!(paint.blend_compatible(BlendMode::Normal));
        assert!(!paint.blend_compatible(BlendMode::Replace));
    }
}
