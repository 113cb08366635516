//! `Image`: a variable-sized RGBA pixel buffer, pure value type with no
//! refcount. Also hosts the [`Quad`] type and the
//! [`ImageTransform`] collaborator contract — the
//! perspective-quad rasterizer itself is an external collaborator; this
//! crate only defines what it is handed and what it must hand back.

use canvas_error::CanvasError;
use canvas_pixel::Bgra;
use canvas_traits::ImageCodec;

/// A variable-sized RGBA pixel buffer. Width/height fit in 16 bits (spec
/// invariant); arithmetic that combines them widens to `i64` before
/// multiplying so the "product fits a machine word" invariant never
/// overflows on the way there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    width: u16,
    height: u16,
    pixels: Box<[u8]>,
}

impl Image {
    pub fn new(width: u16, height: u16) -> Image {
        let pixel_count = width as usize * height as usize;
        Image {
            width,
            height,
            pixels: vec![0u8; pixel_count * 4].into_boxed_slice(),
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Decompress a full-size RGBA payload via the codec collaborator.
    /// Pixels arrive in canonical BGRA byte order regardless of host
    /// endianness (the codec, not this type, is responsible for any
    /// byte-swapping on big-endian hosts).
    pub fn from_compressed(
        width: u16,
        height: u16,
        bytes: &[u8],
        codec: &dyn ImageCodec,
    ) -> Result<Image, CanvasError> {
        let expected_len = width as usize * height as usize * 4;
        let raw = codec.inflate(bytes, expected_len)?;
        if raw.len() != expected_len {
            return Err(CanvasError::decode_error(format!(
                "image payload decompressed to {} bytes, expected {expected_len}",
                raw.len()
            )));
        }
        Ok(Image {
            width,
            height,
            pixels: raw.into_boxed_slice(),
        })
    }

    /// Decode a 1-bit-per-pixel monochrome payload: MSB-first within each
    /// byte, each row padded to a 4-byte boundary. Set bits decode to
    /// opaque white, clear bits to fully transparent.
    pub fn from_compressed_monochrome(
        width: u16,
        height: u16,
        bytes: &[u8],
        codec: &dyn ImageCodec,
    ) -> Result<Image, CanvasError> {
        let row_bytes = (width as usize).div_ceil(8).div_ceil(4) * 4;
        let expected_len = row_bytes * height as usize;
        let raw = codec.inflate(bytes, expected_len)?;
        if raw.len() != expected_len {
            return Err(CanvasError::decode_error(format!(
                "monochrome payload decompressed to {} bytes, expected {expected_len}",
                raw.len()
            )));
        }

        let mut pixels = vec![0u8; width as usize * height as usize * 4];
        for y in 0..height as usize {
            let row = &raw[y * row_bytes..(y + 1) * row_bytes];
            for x in 0..width as usize {
                let byte = row[x / 8];
                let bit = (byte >> (7 - (x % 8))) & 1;
                let color = if bit == 1 {
                    Bgra { b: 255, g: 255, r: 255, a: 255 }
                } else {
                    Bgra::TRANSPARENT
                };
                let index = (y * width as usize + x) * 4;
                pixels[index..index + 4].copy_from_slice(&color.to_bytes());
            }
        }

        Ok(Image { width, height, pixels: pixels.into_boxed_slice() })
    }

    pub fn get_pixel(&self, x: i64, y: i64) -> Bgra {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return Bgra::TRANSPARENT;
        }
        let index = (y as usize * self.width as usize + x as usize) * 4;
        Bgra::from_bytes([
            self.pixels[index],
            self.pixels[index + 1],
            self.pixels[index + 2],
            self.pixels[index + 3],
        ])
    }

    pub fn set_pixel(&mut self, x: i64, y: i64, color: Bgra) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        let index = (y as usize * self.width as usize + x as usize) * 4;
        self.pixels[index..index + 4].copy_from_slice(&color.to_bytes());
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.pixels
    }

    /// Copy a `w`x`h` rectangle starting at `(x, y)`. The rectangle may
    /// extend outside this image; pixels outside the source are zero.
    pub fn subimage(&self, x: i64, y: i64, w: u16, h: u16) -> Image {
        let mut out = Image::new(w, h);
        for row in 0..h as i64 {
            for col in 0..w as i64 {
                let color = self.get_pixel(x + col, y + row);
                out.set_pixel(col, row, color);
            }
        }
        out
    }
}

/// An [`Image`] paired with the position of its top-left corner in the
/// coordinate space it will be composited into. Used for pre-rendered
/// brush dabs passed to `brush_stamp_apply`: the `Paint` collaborator
/// hands back a coverage mask already positioned relative to the stroke.
#[derive(Debug, Clone)]
pub struct PositionedImage {
    pub image: Image,
    pub left: i32,
    pub top: i32,
}

/// A destination quadrilateral in canvas coordinates, ordered
/// top-left, top-right, bottom-right, bottom-left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad {
    pub points: [(f32, f32); 4],
}

impl Quad {
    pub fn translated(&self, dx: f32, dy: f32) -> Quad {
        Quad {
            points: self.points.map(|(x, y)| (x + dx, y + dy)),
        }
    }

    /// Integer bounding rectangle as `(min_x, min_y, width, height)`.
    pub fn bounding_rect(&self) -> (i64, i64, i64, i64) {
        let xs = self.points.map(|(x, _)| x);
        let ys = self.points.map(|(_, y)| y);
        let min_x = xs.iter().cloned().fold(f32::INFINITY, f32::min).floor() as i64;
        let max_x = xs.iter().cloned().fold(f32::NEG_INFINITY, f32::max).ceil() as i64;
        let min_y = ys.iter().cloned().fold(f32::INFINITY, f32::min).floor() as i64;
        let max_y = ys.iter().cloned().fold(f32::NEG_INFINITY, f32::max).ceil() as i64;
        (min_x, min_y, (max_x - min_x).max(0), (max_y - min_y).max(0))
    }

    pub fn bounding_area(&self) -> i64 {
        let (_, _, w, h) = self.bounding_rect();
        w * h
    }
}

/// The perspective-quad rasterizer collaborator: maps
/// `src` through a 3x3 matrix derived from `quad` into `dst`, which is
/// preallocated to the quad's bounding-box size. Pixels outside the
/// transformed quad are left untouched in `dst`.
pub trait ImageTransform {
    fn transform(&self, src: &Image, dst: &mut Image, quad: Quad) -> Result<(), CanvasError>;
}

/// Compute the quad's bounding rectangle, allocate a destination image of
/// that size, translate the quad into rectangle-local coordinates, and
/// run the collaborator rasterizer. Returns the destination image and the
/// bounding rectangle's top-left corner in canvas coordinates.
pub fn image_transform(
    img: &Image,
    dst_quad: Quad,
    transform: &dyn ImageTransform,
) -> Result<(Image, i32, i32), CanvasError> {
    let (min_x, min_y, width, height) = dst_quad.bounding_rect();
    if width <= 0 || height <= 0 {
        return Err(CanvasError::invalid_argument(
            "destination quad bounding rectangle is empty",
        ));
    }
    let width = u16::try_from(width)
        .map_err(|_| CanvasError::invalid_argument("destination quad too wide"))?;
    let height = u16::try_from(height)
        .map_err(|_| CanvasError::invalid_argument("destination quad too tall"))?;

    let mut dst = Image::new(width, height);
    let local_quad = dst_quad.translated(-(min_x as f32), -(min_y as f32));
    transform.transform(img, &mut dst, local_quad)?;

    let offset_x = i32::try_from(min_x)
        .map_err(|_| CanvasError::invalid_argument("destination quad offset out of range"))?;
    let offset_y = i32::try_from(min_y)
        .map_err(|_| CanvasError::invalid_argument("destination quad offset out of range"))?;
    Ok((dst, offset_x, offset_y))
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
    fn new_image_is_zero_filled() {
        let image = Image::new(4, 4);
        assert_eq!(image.get_pixel(0, 0), Bgra::TRANSPARENT);
        assert_eq!(image.get_pixel(3, 3), Bgra::TRANSPARENT);
    }

    #[test]
    fn subimage_exterior_pixels_are_zero() {
        let mut source = Image::new(4, 4);
        source.set_pixel(0, 0, Bgra { b: 1, g: 2, r: 3, a: 255 });
        let out = source.subimage(-2, -2, 4, 4);
        assert_eq!(out.get_pixel(0, 0), Bgra::TRANSPARENT);
        assert_eq!(out.get_pixel(2, 2), Bgra { b: 1, g: 2, r: 3, a: 255 });
    }

    #[test]
    fn from_compressed_monochrome_decodes_bits_msb_first() {
        let codec = IdentityCodec;
        // width=8 -> 1 row byte, no padding needed beyond the 4-byte row alignment.
        let row = [0b1010_0000u8, 0, 0, 0];
        let image = Image::from_compressed_monochrome(8, 1, &row, &codec).expect("decode");
        assert_eq!(image.get_pixel(0, 0), Bgra { b: 255, g: 255, r: 255, a: 255 });
        assert_eq!(image.get_pixel(1, 0), Bgra::TRANSPARENT);
        assert_eq!(image.get_pixel(2, 0), Bgra { b: 255, g: 255, r: 255, a: 255 });
        assert_eq!(image.get_pixel(3, 0), Bgra::TRANSPARENT);
    }

    #[test]
    fn quad_bounding_rect_covers_all_corners() {
        let quad = Quad {
            points: [(1.0, 1.0), (10.0, 2.0), (9.0, 11.0), (0.5, 9.0)],
        };
        let (min_x, min_y, w, h) = quad.bounding_rect();
        assert_eq!(min_x, 0);
        assert_eq!(min_y, 1);
        assert_eq!(w, 10);
        assert_eq!(h, 10);
    }

    struct PassthroughTransform;

    impl ImageTransform for PassthroughTransform {
        fn transform(&self, src: &Image, dst: &mut Image, _quad: Quad) -> Result<(), CanvasError> {
            for y in 0..dst.height() as i64 {
                for x in 0..dst.width() as i64 {
                    dst.set_pixel(x, y, src.get_pixel(x, y));
                }
            }
            Ok(())
        }
    }

    #[test]
    fn image_transform_returns_bounding_rect_offset() {
        let mut source = Image::new(4, 4);
        source.set_pixel(1, 1, Bgra { b: 9, g: 9, r: 9, a: 255 });
        let quad = Quad {
            points: [(2.0, 2.0), (6.0, 2.0), (6.0, 6.0), (2.0, 6.0)],
        };
        let (result, offset_x, offset_y) =
            image_transform(&source, quad, &PassthroughTransform).expect("transform");
        assert_eq!(offset_x, 2);
        assert_eq!(offset_y, 2);
        assert_eq!(result.width(), 4);
        assert_eq!(result.height(), 4);
    }

    #[test]
    fn image_transform_rejects_empty_quad() {
        let source = Image::new(4, 4);
        let quad = Quad {
            points: [(2.0, 2.0), (2.0, 2.0), (2.0, 2.0), (2.0, 2.0)],
        };
        let error = image_transform(&source, quad, &PassthroughTransform).unwrap_err();
        assert!(matches!(error, CanvasError::InvalidArgument(_)));
    }
}
