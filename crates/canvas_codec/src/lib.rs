//! Reference, test-grade implementations of the collaborator traits the
//! core data model only names as trait contracts: zlib inflate/deflate
//! ([`ZlibCodec`]), a hand-rolled perspective-quad rasterizer
//! ([`PerspectiveRasterizer`]), and (behind the `codec-png` feature) an
//! 8-bit-RGBA-always PNG reader/writer ([`PngImageCodec`]). None of these
//! are required by the interpreter crate — they exist so the round-trip
//! property tests exercise real codec/transform behavior instead of a
//! mock.

use std::cell::RefCell;
use std::io::{Read, Write};

use canvas_error::CanvasError;
use canvas_image::{Image, ImageTransform, Quad};
use canvas_message::{DrawContextConfig, RasterizerPool};
use canvas_pixel::Bgra;
use canvas_traits::ImageCodec;

/// zlib deflate/inflate of raw pixel payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZlibCodec;

impl ImageCodec for ZlibCodec {
    fn inflate(&self, bytes: &[u8], expected_len: usize) -> Result<Vec<u8>, CanvasError> {
        let mut decoder = flate2::read::ZlibDecoder::new(bytes);
        let mut out = Vec::with_capacity(expected_len);
        decoder
            .read_to_end(&mut out)
            .map_err(|error| CanvasError::decode_error(error.to_string()))?;
        if out.len() != expected_len {
            return Err(CanvasError::decode_error(format!(
                "inflated to {} bytes, expected {expected_len}",
                out.len()
            )));
        }
        Ok(out)
    }

    fn deflate(&self, bytes: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(bytes).expect("writing to an in-memory Vec cannot fail");
        encoder.finish().expect("finishing an in-memory zlib stream cannot fail")
    }
}

// ---------------------------------------------------------------------
// Perspective-quad rasterizer
// ---------------------------------------------------------------------

/// Row-major 3x3 matrix. Hand-rolled rather than pulling in a
/// linear-algebra crate for one small fixed-size transform.
#[derive(Debug, Clone, Copy)]
struct Mat3([f32; 9]);

impl Mat3 {
    /// Apply to a homogeneous point with implicit `z = 1`, returning the
    /// unnormalized `(x, y, w)`.
    fn apply(&self, x: f32, y: f32) -> (f32, f32, f32) {
        let m = &self.0;
        (
            m[0] * x + m[1] * y + m[2],
            m[3] * x + m[4] * y + m[5],
            m[6] * x + m[7] * y + m[8],
        )
    }

    fn determinant(&self) -> f32 {
        let [a, b, c, d, e, f, g, h, i] = self.0;
        a * (e * i - f * h) - b * (d * i - f * g) + c * (d * h - e * g)
    }

    /// Adjugate-over-determinant inverse. `None` when the matrix is
    /// singular.
    fn invert(&self) -> Option<Mat3> {
        let det = self.determinant();
        if det.abs() < 1e-9 {
            return None;
        }
        let [a, b, c, d, e, f, g, h, i] = self.0;
        let inv_det = 1.0 / det;
        Some(Mat3([
            (e * i - f * h) * inv_det,
            (c * h - b * i) * inv_det,
            (b * f - c * e) * inv_det,
            (f * g - d * i) * inv_det,
            (a * i - c * g) * inv_det,
            (c * d - a * f) * inv_det,
            (d * h - e * g) * inv_det,
            (b * g - a * h) * inv_det,
            (a * e - b * d) * inv_det,
        ]))
    }
}

/// Derive the projective mapping from the unit square `(0,0)-(1,1)` to
/// `quad` (Heckbert's square-to-quadrilateral construction): `quad`'s
/// corners are, in order, the images of `(0,0)`, `(1,0)`, `(1,1)`,
/// `(0,1)`.
fn square_to_quad(quad: Quad) -> Result<Mat3, CanvasError> {
    let [(x0, y0), (x1, y1), (x2, y2), (x3, y3)] = quad.points;

    let dx1 = x1 - x2;
    let dx2 = x3 - x2;
    let dx3 = x0 - x1 + x2 - x3;
    let dy1 = y1 - y2;
    let dy2 = y3 - y2;
    let dy3 = y0 - y1 + y2 - y3;

    let denom = dx1 * dy2 - dx2 * dy1;
    let (g, h) = if denom.abs() < 1e-9 {
        (0.0, 0.0)
    } else {
        ((dx3 * dy2 - dx2 * dy3) / denom, (dx1 * dy3 - dx3 * dy1) / denom)
    };

    let matrix = Mat3([
        x1 - x0 + g * x1,
        x3 - x0 + h * x3,
        x0,
        y1 - y0 + g * y1,
        y3 - y0 + h * y3,
        y0,
        g,
        h,
        1.0,
    ]);

    if matrix.determinant().abs() < 1e-9 {
        return Err(CanvasError::invalid_argument("destination quad is degenerate"));
    }
    Ok(matrix)
}

fn bilinear_sample(src: &Image, x: f32, y: f32) -> Bgra {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let x0i = x0 as i64;
    let y0i = y0 as i64;

    let p00 = src.get_pixel(x0i, y0i);
    let p10 = src.get_pixel(x0i + 1, y0i);
    let p01 = src.get_pixel(x0i, y0i + 1);
    let p11 = src.get_pixel(x0i + 1, y0i + 1);

    let lerp = |c00: u8, c10: u8, c01: u8, c11: u8| -> u8 {
        let top = c00 as f32 * (1.0 - fx) + c10 as f32 * fx;
        let bottom = c01 as f32 * (1.0 - fx) + c11 as f32 * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    };

    Bgra {
        b: lerp(p00.b, p10.b, p01.b, p11.b),
        g: lerp(p00.g, p10.g, p01.g, p11.g),
        r: lerp(p00.r, p10.r, p01.r, p11.r),
        a: lerp(p00.a, p10.a, p01.a, p11.a),
    }
}

fn scale_coverage(pixel: Bgra, coverage: f32) -> Bgra {
    let scale = |c: u8| ((c as f32) * coverage).round().clamp(0.0, 255.0) as u8;
    Bgra {
        b: scale(pixel.b),
        g: scale(pixel.g),
        r: scale(pixel.r),
        a: scale(pixel.a),
    }
}

const SUBSAMPLE_OFFSETS: [(f32, f32); 4] = [(0.25, 0.25), (0.75, 0.25), (0.25, 0.75), (0.75, 0.75)];

/// Maps `src` through the quad's derived 3x3 projective transform into
/// `dst`: the matrix is inverted once, then swept per destination pixel.
/// Edges are antialiased by 2x2 coverage supersampling rather than a full
/// scanline edge-function rasterizer — functionally equivalent (smooth,
/// partially-covered boundary pixels, untouched exterior) with a much
/// smaller implementation.
pub struct PerspectiveRasterizer {
    // Scratch memory a more elaborate span renderer could use; reserved
    // eagerly per call so the pool's doubling/cap policy is exercised by
    // every transform, not just ones that happen to need it.
    pool: RefCell<RasterizerPool>,
}

impl PerspectiveRasterizer {
    pub fn new(config: DrawContextConfig) -> PerspectiveRasterizer {
        PerspectiveRasterizer {
            pool: RefCell::new(RasterizerPool::new(
                config.rasterizer_pool_initial,
                config.rasterizer_pool_max,
            )),
        }
    }
}

impl Default for PerspectiveRasterizer {
    fn default() -> Self {
        PerspectiveRasterizer::new(DrawContextConfig::default())
    }
}

impl ImageTransform for PerspectiveRasterizer {
    fn transform(&self, src: &Image, dst: &mut Image, quad: Quad) -> Result<(), CanvasError> {
        if src.width() == 0 || src.height() == 0 || dst.width() == 0 || dst.height() == 0 {
            return Ok(());
        }

        let forward = square_to_quad(quad)?;
        let inverse = forward
            .invert()
            .ok_or_else(|| CanvasError::invalid_argument("perspective transform matrix is not invertible"))?;

        self.pool.borrow_mut().reserve(dst.width() as usize * 4)?;

        for y in 0..dst.height() as i64 {
            for x in 0..dst.width() as i64 {
                let mut hits = 0u32;
                let mut accum_u = 0.0f32;
                let mut accum_v = 0.0f32;
                for (ox, oy) in SUBSAMPLE_OFFSETS {
                    let px = x as f32 + ox;
                    let py = y as f32 + oy;
                    let (u, v, w) = inverse.apply(px, py);
                    if w.abs() < 1e-6 {
                        continue;
                    }
                    let (u, v) = (u / w, v / w);
                    if (0.0..=1.0).contains(&u) && (0.0..=1.0).contains(&v) {
                        hits += 1;
                        accum_u += u;
                        accum_v += v;
                    }
                }
                if hits == 0 {
                    continue;
                }
                let coverage = hits as f32 / SUBSAMPLE_OFFSETS.len() as f32;
                let u = accum_u / hits as f32;
                let v = accum_v / hits as f32;
                let sample = bilinear_sample(
                    src,
                    u * src.width() as f32 - 0.5,
                    v * src.height() as f32 - 0.5,
                );
                let pixel = if coverage >= 1.0 { sample } else { scale_coverage(sample, coverage) };
                dst.set_pixel(x, y, pixel);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// PNG codec (reference only, feature-gated)
// ---------------------------------------------------------------------

#[cfg(feature = "codec-png")]
mod png_support {
    //! Accepts any bit depth (scaled to 8), paletted (expanded),
    //! grayscale (expanded), always yields 8-bit RGBA; writer emits
    //! 8-bit RGBA, no interlace, default compression and filter.

    use super::*;

    fn premultiply(r: u8, g: u8, b: u8, a: u8) -> Bgra {
        let pm = |c: u8| ((c as u32 * a as u32 + 127) / 255) as u8;
        Bgra { b: pm(b), g: pm(g), r: pm(r), a }
    }

    fn unpremultiply(pixel: Bgra) -> (u8, u8, u8, u8) {
        if pixel.a == 0 {
            return (0, 0, 0, 0);
        }
        let un = |c: u8| ((c as u32 * 255 + pixel.a as u32 / 2) / pixel.a as u32).min(255) as u8;
        (un(pixel.r), un(pixel.g), un(pixel.b), pixel.a)
    }

    /// Reference PNG reader/writer: not an [`ImageCodec`] (that trait is
    /// the raw zlib payload contract `ZlibCodec` implements) — a PNG
    /// carries its own container format around a deflate stream, so it
    /// gets its own pair of methods instead.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PngImageCodec;

    impl PngImageCodec {
        pub fn encode(&self, image: &Image) -> Result<Vec<u8>, CanvasError> {
            let mut bytes = Vec::new();
            {
                let mut encoder =
                    png::Encoder::new(&mut bytes, image.width() as u32, image.height() as u32);
                encoder.set_color(png::ColorType::Rgba);
                encoder.set_depth(png::BitDepth::Eight);
                let mut writer = encoder
                    .write_header()
                    .map_err(|error| CanvasError::io_error(error.to_string()))?;

                let mut rgba = Vec::with_capacity(image.width() as usize * image.height() as usize * 4);
                for y in 0..image.height() as i64 {
                    for x in 0..image.width() as i64 {
                        let (r, g, b, a) = unpremultiply(image.get_pixel(x, y));
                        rgba.extend_from_slice(&[r, g, b, a]);
                    }
                }
                writer
                    .write_image_data(&rgba)
                    .map_err(|error| CanvasError::io_error(error.to_string()))?;
            }
            Ok(bytes)
        }

        pub fn decode(&self, bytes: &[u8]) -> Result<Image, CanvasError> {
            self.decode_with_warnings(bytes, &mut |_| {})
        }

        /// Same as [`Self::decode`], but non-fatal codec conditions (none
        /// currently raised by this reader, but kept so callers have a
        /// stable place to wire `log::warn!`/`tracing::warn!`) are routed
        /// through `warn` instead of being silently dropped.
        pub fn decode_with_warnings(
            &self,
            bytes: &[u8],
            warn: &mut dyn FnMut(&str),
        ) -> Result<Image, CanvasError> {
            let mut decoder = png::Decoder::new(bytes);
            decoder.set_transformations(png::Transformations::normalize_to_color8());
            let mut reader = decoder
                .read_info()
                .map_err(|error| CanvasError::decode_error(error.to_string()))?;
            let mut buf = vec![0u8; reader.output_buffer_size()];
            let info = reader
                .next_frame(&mut buf)
                .map_err(|error| CanvasError::decode_error(error.to_string()))?;

            if info.width > 32767 || info.height > 32767 {
                return Err(CanvasError::decode_error("png dimensions exceed 32767"));
            }
            let width = info.width as u16;
            let height = info.height as u16;
            let pixel_count = width as usize * height as usize;

            let mut image = Image::new(width, height);
            let set = |image: &mut Image, index: usize, pixel: Bgra| {
                image.set_pixel((index % width as usize) as i64, (index / width as usize) as i64, pixel);
            };

            match info.color_type {
                png::ColorType::Rgba => {
                    if buf.len() < pixel_count * 4 {
                        return Err(CanvasError::decode_error("png row length mismatch"));
                    }
                    for index in 0..pixel_count {
                        let o = index * 4;
                        set(&mut image, index, premultiply(buf[o], buf[o + 1], buf[o + 2], buf[o + 3]));
                    }
                }
                png::ColorType::Rgb => {
                    if buf.len() < pixel_count * 3 {
                        return Err(CanvasError::decode_error("png row length mismatch"));
                    }
                    for index in 0..pixel_count {
                        let o = index * 3;
                        set(&mut image, index, premultiply(buf[o], buf[o + 1], buf[o + 2], 255));
                    }
                }
                png::ColorType::GrayscaleAlpha => {
                    if buf.len() < pixel_count * 2 {
                        return Err(CanvasError::decode_error("png row length mismatch"));
                    }
                    for index in 0..pixel_count {
                        let o = index * 2;
                        let gray = buf[o];
                        set(&mut image, index, premultiply(gray, gray, gray, buf[o + 1]));
                    }
                }
                png::ColorType::Grayscale => {
                    if buf.len() < pixel_count {
                        return Err(CanvasError::decode_error("png row length mismatch"));
                    }
                    for index in 0..pixel_count {
                        let gray = buf[index];
                        set(&mut image, index, premultiply(gray, gray, gray, 255));
                    }
                }
                png::ColorType::Indexed => {
                    warn("indexed color type survived normalize_to_color8 transformations");
                    return Err(CanvasError::decode_error("unexpected indexed color type"));
                }
            }

            Ok(image)
        }
    }

}

#[cfg(feature = "codec-png")]
pub use png_support::PngImageCodec;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_round_trip_is_identity() {
        let codec = ZlibCodec;
        let payload: Vec<u8> = (0u8..=255).cycle().take(4096).collect();
        let compressed = codec.deflate(&payload);
        let decompressed = codec.inflate(&compressed, payload.len()).expect("inflate");
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn zlib_inflate_rejects_size_mismatch() {
        let codec = ZlibCodec;
        let compressed = codec.deflate(&[1, 2, 3, 4]);
        let error = codec.inflate(&compressed, 999).unwrap_err();
        assert!(matches!(error, CanvasError::DecodeError(_)));
    }

    #[test]
    fn identity_quad_transform_copies_source_into_destination() {
        let rasterizer = PerspectiveRasterizer::default();
        let mut src = Image::new(4, 4);
        src.set_pixel(1, 1, Bgra { b: 9, g: 9, r: 9, a: 255 });
        let mut dst = Image::new(4, 4);
        let quad = Quad {
            points: [(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 4.0)],
        };
        rasterizer.transform(&src, &mut dst, quad).expect("transform");
        assert_eq!(dst.get_pixel(1, 1), Bgra { b: 9, g: 9, r: 9, a: 255 });
        assert_eq!(dst.get_pixel(0, 0), Bgra::TRANSPARENT);
    }

    #[test]
    fn degenerate_quad_is_rejected() {
        let rasterizer = PerspectiveRasterizer::default();
        let src = Image::new(2, 2);
        let mut dst = Image::new(2, 2);
        let quad = Quad {
            points: [(1.0, 1.0), (1.0, 1.0), (1.0, 1.0), (1.0, 1.0)],
        };
        let error = rasterizer.transform(&src, &mut dst, quad).unwrap_err();
        assert!(matches!(error, CanvasError::InvalidArgument(_)));
    }
}
