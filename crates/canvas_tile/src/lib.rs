//! Fixed-size, reference-counted pixel tiles — the unit of storage,
//! diffing and rendering.

use std::sync::{Arc, OnceLock};

use canvas_error::CanvasError;
use canvas_pixel::Bgra;
use canvas_traits::ImageCodec;

pub const TILE_SIZE: u32 = 64;
pub const TILE_PIXEL_COUNT: usize = (TILE_SIZE * TILE_SIZE) as usize;
pub const TILE_BYTE_LEN: usize = TILE_PIXEL_COUNT * 4;

#[derive(Debug)]
struct TileData {
    pixels: Box<[u8; TILE_BYTE_LEN]>,
    /// Authorship tag, carried for downstream bookkeeping only. Never
    /// compared when deciding whether two tiles are pixel-identical.
    context_id: u32,
}

/// An immutable, `Arc`-shared 64x64 pixel block. `Clone` is an atomic
/// refcount bump, never a pixel copy.
#[derive(Debug, Clone)]
pub struct Tile(Arc<TileData>);

fn blank_storage() -> &'static Arc<TileData> {
    static BLANK: OnceLock<Arc<TileData>> = OnceLock::new();
    BLANK.get_or_init(|| {
        Arc::new(TileData {
            pixels: Box::new([0u8; TILE_BYTE_LEN]),
            context_id: 0,
        })
    })
}

impl Tile {
    /// The shared blank singleton: every all-zero tile in the document
    /// points at the same allocation.
    pub fn blank() -> Tile {
        Tile(blank_storage().clone())
    }

    pub fn is_blank(&self) -> bool {
        Arc::ptr_eq(&self.0, blank_storage()) || self.0.pixels.iter().all(|byte| *byte == 0)
    }

    pub fn from_solid_color(context_id: u32, color: Bgra) -> Tile {
        if color.is_fully_transparent() {
            return Tile::blank();
        }
        let mut pixels = Box::new([0u8; TILE_BYTE_LEN]);
        let bytes = color.to_bytes();
        for chunk in pixels.chunks_exact_mut(4) {
            chunk.copy_from_slice(&bytes);
        }
        Tile(Arc::new(TileData { pixels, context_id }))
    }

    pub fn from_compressed(
        context_id: u32,
        bytes: &[u8],
        codec: &dyn ImageCodec,
    ) -> Result<Tile, CanvasError> {
        let raw = codec.inflate(bytes, TILE_BYTE_LEN)?;
        if raw.len() != TILE_BYTE_LEN {
            return Err(CanvasError::decode_error(format!(
                "tile payload decompressed to {} bytes, expected {TILE_BYTE_LEN}",
                raw.len()
            )));
        }
        let mut pixels = Box::new([0u8; TILE_BYTE_LEN]);
        pixels.copy_from_slice(&raw);
        let tile = Tile(Arc::new(TileData { pixels, context_id }));
        if tile.is_blank() {
            return Ok(Tile::blank());
        }
        Ok(tile)
    }

    pub fn to_compressed(&self, codec: &dyn ImageCodec) -> Vec<u8> {
        codec.deflate(self.0.pixels.as_slice())
    }

    pub fn context_id(&self) -> u32 {
        self.0.context_id
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> Bgra {
        pixel_at(self.0.pixels.as_slice(), x, y)
    }

    pub fn raw_bytes(&self) -> &[u8; TILE_BYTE_LEN] {
        &self.0.pixels
    }

    /// Shallow-clone into a uniquely-owned, mutable staging buffer.
    pub fn transient_from(&self) -> TransientTile {
        TransientTile {
            pixels: self.0.pixels.clone(),
            context_id: self.0.context_id,
        }
    }

    /// `Arc` pointer identity — used by diffing, never pixel content.
    pub fn ptr_eq(&self, other: &Tile) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

fn pixel_index(x: u32, y: u32) -> usize {
    assert!(x < TILE_SIZE && y < TILE_SIZE, "tile pixel out of bounds");
    (y as usize * TILE_SIZE as usize + x as usize) * 4
}

fn pixel_at(pixels: &[u8], x: u32, y: u32) -> Bgra {
    let index = pixel_index(x, y);
    Bgra::from_bytes([pixels[index], pixels[index + 1], pixels[index + 2], pixels[index + 3]])
}

/// A uniquely-owned, mutable 64x64 pixel buffer staged for edits before
/// being frozen back into an immutable [`Tile`].
#[derive(Debug, Clone)]
pub struct TransientTile {
    pixels: Box<[u8; TILE_BYTE_LEN]>,
    context_id: u32,
}

impl TransientTile {
    pub fn new_blank() -> TransientTile {
        TransientTile {
            pixels: Box::new([0u8; TILE_BYTE_LEN]),
            context_id: 0,
        }
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn set_context_id(&mut self, context_id: u32) {
        self.context_id = context_id;
    }

    pub fn get_pixel(&self, x: u32, y: u32) -> Bgra {
        pixel_at(self.pixels.as_slice(), x, y)
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: Bgra) {
        let index = pixel_index(x, y);
        let bytes = color.to_bytes();
        self.pixels[index..index + 4].copy_from_slice(&bytes);
    }

    pub fn fill(&mut self, color: Bgra) {
        let bytes = color.to_bytes();
        for chunk in self.pixels.chunks_exact_mut(4) {
            chunk.copy_from_slice(&bytes);
        }
    }

    /// Freeze into an immutable, shareable tile. Returns the shared blank
    /// singleton instead of a fresh allocation when the buffer turned out
    /// to be all-zero, so two separately-edited-back-to-blank tiles
    /// still compare pointer-equal.
    pub fn persist(self) -> Tile {
        if self.pixels.iter().all(|byte| *byte == 0) {
            return Tile::blank();
        }
        Tile(Arc::new(TileData {
            pixels: self.pixels,
            context_id: self.context_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct IdentityCodec;

    impl ImageCodec for IdentityCodec {
        fn inflate(&self, bytes: &[u8], expected_len: usize) -> Result<Vec<u8>, CanvasError> {
            if bytes.len() != expected_len {
                return Err(CanvasError::decode_error("length mismatch"));
            }
            Ok(bytes.to_vec())
        }

        fn deflate(&self, bytes: &[u8]) -> Vec<u8> {
            bytes.to_vec()
        }
    }

    #[test]
    fn blank_tiles_share_one_allocation() {
        let a = Tile::blank();
        let b = Tile::blank();
        assert!(a.ptr_eq(&b));
    }

    #[test]
    fn from_solid_color_is_uniform() {
        let color = Bgra { b: 10, g: 20, r: 30, a: 255 };
        let tile = Tile::from_solid_color(7, color);
        assert_eq!(tile.get_pixel(0, 0), color);
        assert_eq!(tile.get_pixel(63, 63), color);
        assert_eq!(tile.context_id(), 7);
    }

    #[test]
    fn from_solid_color_transparent_returns_blank_singleton() {
        let tile = Tile::from_solid_color(3, Bgra::TRANSPARENT);
        assert!(tile.ptr_eq(&Tile::blank()));
    }

    #[test]
    fn transient_persist_roundtrips_pixel_edits() {
        let mut transient = Tile::blank().transient_from();
        let color = Bgra { b: 1, g: 2, r: 3, a: 255 };
        transient.set_pixel(5, 9, color);
        let tile = transient.persist();
        assert_eq!(tile.get_pixel(5, 9), color);
        assert_eq!(tile.get_pixel(0, 0), Bgra::TRANSPARENT);
    }

    #[test]
    fn persist_of_all_zero_buffer_returns_blank_singleton() {
        let transient = TransientTile::new_blank();
        let tile = transient.persist();
        assert!(tile.ptr_eq(&Tile::blank()));
    }

    #[test]
    fn compress_then_decompress_is_identity_with_identity_codec() {
        let codec = IdentityCodec;
        let color = Bgra { b: 9, g: 8, r: 7, a: 255 };
        let tile = Tile::from_solid_color(1, color);
        let compressed = tile.to_compressed(&codec);
        let decoded = Tile::from_compressed(2, &compressed, &codec).expect("decode");
        assert_eq!(decoded.get_pixel(0, 0), color);
        assert_eq!(decoded.raw_bytes(), tile.raw_bytes());
    }

    #[test]
    fn from_compressed_rejects_size_mismatch() {
        let codec = IdentityCodec;
        let error = Tile::from_compressed(0, &[0u8; 4], &codec).unwrap_err();
        assert!(matches!(error, CanvasError::DecodeError(_)));
    }
}
