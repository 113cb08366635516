//! The drawing-message wire contract and the scratch resources a single
//! interpreter thread needs to apply one: [`Message`],
//! a tagged enum with one variant per drawing command, and [`DrawContext`],
//! the exclusive-to-one-thread scratch buffer + rasterizer pool bundle.
//!
//! Wire decoding itself is out of scope here: a `Message` arrives
//! already parsed into Rust types. The one place raw bytes remain is
//! compressed tile/image/mask payloads, which the interpreter hands to an
//! [`ImageCodec`] collaborator to inflate.

use canvas_image::{PositionedImage, Quad};
use canvas_pixel::{Bgra, BlendMode};
use canvas_tile::Tile;

pub use canvas_error::CanvasError;
pub use canvas_image::ImageTransform;
pub use canvas_traits::{ImageCodec, Paint};

/// A tile or background payload: either an inline solid color or a
/// zlib-deflated raw pixel block.
#[derive(Debug, Clone)]
pub enum TilePayload {
    SolidColor(Bgra),
    Compressed(Vec<u8>),
}

/// One drawing command, already decoded from the wire. Every field the
/// interpreter reads is named directly rather than packed
/// behind accessor methods, mirroring a tagged-enum wire-message style.
#[derive(Debug, Clone)]
pub enum Message {
    CanvasResize {
        top: i32,
        right: i32,
        bottom: i32,
        left: i32,
    },
    LayerCreate {
        layer_id: u32,
        source_id: Option<u32>,
        fill_color: Option<Bgra>,
        insert: bool,
        copy: bool,
        title: String,
    },
    LayerAttr {
        layer_id: u32,
        sublayer_id: u32,
        opacity: u8,
        blend_mode: u8,
        censored: bool,
        fixed: bool,
    },
    LayerOrder {
        layer_ids: Vec<u32>,
    },
    LayerRetitle {
        layer_id: u32,
        title: String,
    },
    LayerVisibility {
        layer_id: u32,
        visible: bool,
    },
    LayerDelete {
        context_id: u32,
        layer_id: u32,
        merge: bool,
    },
    PutImage {
        context_id: u32,
        layer_id: u32,
        blend_mode: u8,
        x: i32,
        y: i32,
        width: u16,
        height: u16,
        compressed_bytes: Vec<u8>,
    },
    FillRect {
        context_id: u32,
        layer_id: u32,
        blend_mode: u8,
        x: i32,
        y: i32,
        width: u16,
        height: u16,
        color: Bgra,
    },
    RegionMove {
        context_id: u32,
        layer_id: u32,
        src_x: i64,
        src_y: i64,
        src_width: u16,
        src_height: u16,
        dst_quad: Quad,
        mask_bytes: Option<Vec<u8>>,
    },
    PutTile {
        context_id: u32,
        layer_id: u32,
        sublayer_id: u32,
        tile_x: u32,
        tile_y: u32,
        repeat: bool,
        payload: TilePayload,
    },
    CanvasBackground {
        context_id: u32,
        payload: TilePayload,
    },
    PenUp {
        context_id: u32,
    },
    DrawDabsClassic(DrawDabs),
    DrawDabsPixel(DrawDabs),
    DrawDabsPixelSquare(DrawDabs),
    /// A wire tag this build of the interpreter does not recognize.
    /// `kind` is a human-readable description for logging.
    Unknown {
        kind: String,
    },
}

/// Shared payload shape for the three `DrawDabs*` message kinds: they
/// differ only in which brush-shape engine produced the
/// pre-rendered `stamps`, never in how the core composites them. Brush
/// parameter interpretation (turning a stroke into these stamps) is the
/// `Paint` collaborator's job and already happened before this message
/// was constructed.
#[derive(Debug, Clone)]
pub struct DrawDabs {
    pub context_id: u32,
    pub layer_id: u32,
    pub color: Bgra,
    pub blend_mode: u8,
    pub indirect: bool,
    pub stamps: Vec<PositionedImage>,
}

/// Parse a wire blend-mode tag, surfacing an unknown value the way every
/// other malformed-message case does.
pub fn parse_blend_mode(tag: u8) -> Result<BlendMode, CanvasError> {
    BlendMode::try_from(tag)
        .map_err(|_| CanvasError::invalid_argument(format!("unknown blend mode tag {tag}")))
}

/// Scratch transform buffer size (in tiles) and the rasterizer pool's
/// initial and maximum sizes (bytes): a plain `Copy` struct with a
/// `Default` impl, not meant to be tuned at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawContextConfig {
    pub scratch_tile_capacity: usize,
    pub rasterizer_pool_initial: usize,
    pub rasterizer_pool_max: usize,
}

impl Default for DrawContextConfig {
    fn default() -> Self {
        DrawContextConfig {
            scratch_tile_capacity: 64,
            rasterizer_pool_initial: 64 * 1024,
            rasterizer_pool_max: 16 * 1024 * 1024,
        }
    }
}

/// Growable scratch memory for [`ImageTransform`] implementations:
/// doubles on exhaustion, capped at a
/// configured maximum; requesting past the cap is a failure rather than
/// an unbounded allocation.
#[derive(Debug)]
pub struct RasterizerPool {
    buffer: Vec<u8>,
    max_bytes: usize,
}

impl RasterizerPool {
    pub fn new(initial_bytes: usize, max_bytes: usize) -> RasterizerPool {
        RasterizerPool {
            buffer: vec![0u8; initial_bytes.min(max_bytes)],
            max_bytes,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Ensure at least `bytes` of scratch memory are available, doubling
    /// the pool (capped at `max_bytes`) as many times as needed.
    /// `CanvasError::ResourceExhausted` if the cap is reached first.
    pub fn reserve(&mut self, bytes: usize) -> Result<&mut [u8], CanvasError> {
        if bytes > self.max_bytes {
            return Err(CanvasError::resource_exhausted(format!(
                "requested {bytes} bytes exceeds rasterizer pool max {}",
                self.max_bytes
            )));
        }
        while self.buffer.len() < bytes {
            let doubled = self.buffer.len().saturating_mul(2).max(1);
            if doubled > self.max_bytes {
                return Err(CanvasError::resource_exhausted(format!(
                    "rasterizer pool exhausted growing toward {bytes} bytes (max {})",
                    self.max_bytes
                )));
            }
            self.buffer.resize(doubled, 0);
        }
        Ok(&mut self.buffer[..bytes])
    }
}

/// Scratch resources exclusive to one interpreter thread:
/// a scratch tile buffer (used by flatten/render paths that need a
/// throwaway mutable tile) and the rasterizer pool `image_transform`
/// implementations draw on. Not `Sync`: it owns unsynchronized mutable
/// state, so the type system — not a runtime check — prevents concurrent
/// use by two interpreter threads.
pub struct DrawContext {
    pub config: DrawContextConfig,
    scratch_tiles: Vec<Tile>,
    pub rasterizer_pool: RasterizerPool,
}

impl DrawContext {
    pub fn new(config: DrawContextConfig) -> DrawContext {
        DrawContext {
            scratch_tiles: Vec::with_capacity(config.scratch_tile_capacity),
            rasterizer_pool: RasterizerPool::new(
                config.rasterizer_pool_initial,
                config.rasterizer_pool_max,
            ),
            config,
        }
    }

    /// Borrow a scratch tile slot from the pool, growing it up to
    /// `scratch_tile_capacity` before falling back to a fresh allocation.
    pub fn scratch_tile(&mut self) -> Tile {
        self.scratch_tiles.pop().unwrap_or_else(Tile::blank)
    }

    pub fn release_scratch_tile(&mut self, tile: Tile) {
        if self.scratch_tiles.len() < self.config.scratch_tile_capacity {
            self.scratch_tiles.push(tile);
        }
    }
}

impl Default for DrawContext {
    fn default() -> Self {
        DrawContext::new(DrawContextConfig::default())
    }
}
