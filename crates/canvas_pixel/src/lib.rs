//! Pixel representation and compositing math shared by every layer of the
//! canvas: 32-bit premultiplied BGRA pixels and the blend-mode compositing
//! functions used when flattening tiles.

/// A single premultiplied-alpha BGRA pixel. Field order matches the
/// canonical in-memory byte layout (`[b, g, r, a]`), not a semantic
/// preference — wire payloads and tile buffers are laid out this way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bgra {
    pub b: u8,
    pub g: u8,
    pub r: u8,
    pub a: u8,
}

impl Bgra {
    pub const TRANSPARENT: Bgra = Bgra { b: 0, g: 0, r: 0, a: 0 };

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Bgra {
            b: bytes[0],
            g: bytes[1],
            r: bytes[2],
            a: bytes[3],
        }
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        [self.b, self.g, self.r, self.a]
    }

    pub fn is_fully_transparent(self) -> bool {
        self == Bgra::TRANSPARENT
    }

    /// Straight (non-premultiplied) channel values as floats in `[0, 1]`.
    /// `a == 0` returns black, matching the convention that a fully
    /// transparent premultiplied pixel carries no recoverable color.
    fn straight(self) -> [f32; 4] {
        let a = self.a as f32 / 255.0;
        if self.a == 0 {
            return [0.0, 0.0, 0.0, 0.0];
        }
        [
            (self.b as f32 / 255.0) / a,
            (self.g as f32 / 255.0) / a,
            (self.r as f32 / 255.0) / a,
            a,
        ]
    }

    fn from_straight(straight: [f32; 4]) -> Self {
        let [b, g, r, a] = straight;
        let a = a.clamp(0.0, 1.0);
        let to_u8 = |channel: f32| ((channel.clamp(0.0, 1.0) * a) * 255.0).round() as u8;
        Bgra {
            b: to_u8(b),
            g: to_u8(g),
            r: to_u8(r),
            a: (a * 255.0).round() as u8,
        }
    }
}

/// Known compositing operators. Variants map 1:1 onto wire-protocol
/// integers; `UnknownMessage`/`InvalidArgument` handling for out-of-range
/// values lives at the decode boundary, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Normal,
    Erase,
    Multiply,
    Divide,
    Darken,
    Lighten,
    Screen,
    Overlay,
    HardLight,
    SoftLight,
    ColorDodge,
    ColorBurn,
    Difference,
    Exclusion,
    Replace,
}

/// Wire tag did not map to a known [`BlendMode`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownBlendMode(pub u8);

impl TryFrom<u8> for BlendMode {
    type Error = UnknownBlendMode;

    /// Maps the wire-protocol integer tags onto blend mode variants.
    /// Order matches the enum declaration; values outside this range are
    /// the interpreter's "unknown blend mode" failure case.
    fn try_from(tag: u8) -> Result<Self, UnknownBlendMode> {
        match tag {
            0 => Ok(BlendMode::Normal),
            1 => Ok(BlendMode::Erase),
            2 => Ok(BlendMode::Multiply),
            3 => Ok(BlendMode::Divide),
            4 => Ok(BlendMode::Darken),
            5 => Ok(BlendMode::Lighten),
            6 => Ok(BlendMode::Screen),
            7 => Ok(BlendMode::Overlay),
            8 => Ok(BlendMode::HardLight),
            9 => Ok(BlendMode::SoftLight),
            10 => Ok(BlendMode::ColorDodge),
            11 => Ok(BlendMode::ColorBurn),
            12 => Ok(BlendMode::Difference),
            13 => Ok(BlendMode::Exclusion),
            14 => Ok(BlendMode::Replace),
            other => Err(UnknownBlendMode(other)),
        }
    }
}

impl BlendMode {
    /// The subset of blend modes brush/drawing operations (FillRect,
    /// PutImage, DrawDabs, ...) may use. `Replace` is reserved for
    /// whole-layer/background replacement semantics and is deliberately
    /// excluded: brush operations only ever draw from the
    /// brush-compatible subset.
    pub fn is_brush_compatible(self) -> bool {
        !matches!(self, BlendMode::Replace)
    }

    fn separable_blend(self, backdrop: f32, source: f32) -> f32 {
        match self {
            BlendMode::Normal | BlendMode::Replace | BlendMode::Erase => source,
            BlendMode::Multiply => backdrop * source,
            BlendMode::Divide => {
                if source >= 1.0 {
                    1.0
                } else {
                    (backdrop / (1.0 - source)).min(1.0)
                }
            }
            BlendMode::Darken => backdrop.min(source),
            BlendMode::Lighten => backdrop.max(source),
            BlendMode::Screen => backdrop + source - backdrop * source,
            BlendMode::Overlay => BlendMode::HardLight.separable_blend(source, backdrop),
            BlendMode::HardLight => {
                if source <= 0.5 {
                    2.0 * backdrop * source
                } else {
                    1.0 - 2.0 * (1.0 - backdrop) * (1.0 - source)
                }
            }
            BlendMode::SoftLight => {
                if source <= 0.5 {
                    backdrop - (1.0 - 2.0 * source) * backdrop * (1.0 - backdrop)
                } else {
                    let d = if backdrop <= 0.25 {
                        ((16.0 * backdrop - 12.0) * backdrop + 4.0) * backdrop
                    } else {
                        backdrop.sqrt()
                    };
                    backdrop + (2.0 * source - 1.0) * (d - backdrop)
                }
            }
            BlendMode::ColorDodge => {
                if backdrop <= 0.0 {
                    0.0
                } else if source >= 1.0 {
                    1.0
                } else {
                    (backdrop / (1.0 - source)).min(1.0)
                }
            }
            BlendMode::ColorBurn => {
                if backdrop >= 1.0 {
                    1.0
                } else if source <= 0.0 {
                    0.0
                } else {
                    1.0 - ((1.0 - backdrop) / source).min(1.0)
                }
            }
            BlendMode::Difference => (backdrop - source).abs(),
            BlendMode::Exclusion => backdrop + source - 2.0 * backdrop * source,
        }
    }

    /// Composite `source` over `backdrop` using this blend mode, following
    /// the Adobe-style separable blend compositing formula operating on
    /// straight (unassociated) alpha, then re-premultiplying the result.
    /// `Erase` is handled specially: it subtracts source alpha coverage
    /// from the backdrop instead of mixing color.
    pub fn composite(self, backdrop: Bgra, source: Bgra, source_opacity: f32) -> Bgra {
        let source_opacity = source_opacity.clamp(0.0, 1.0);
        if self == BlendMode::Erase {
            let backdrop_alpha = backdrop.a as f32 / 255.0;
            let erase_alpha = (source.a as f32 / 255.0) * source_opacity;
            let result_alpha = (backdrop_alpha * (1.0 - erase_alpha)).clamp(0.0, 1.0);
            let [bb, bg, br, _] = backdrop.straight();
            return Bgra::from_straight([bb, bg, br, result_alpha]);
        }

        let [bb, bg, br, ba] = backdrop.straight();
        let [sb, sg, sr, sa] = source.straight();
        let sa = sa * source_opacity;
        if sa <= 0.0 {
            return backdrop;
        }

        let result_alpha = sa + ba * (1.0 - sa);
        if result_alpha <= 0.0 {
            return Bgra::TRANSPARENT;
        }

        let mix_channel = |backdrop_channel: f32, source_channel: f32| {
            let blended = self.separable_blend(backdrop_channel, source_channel);
            let straight_mixed = (1.0 - ba) * source_channel + ba * blended;
            ((1.0 - sa) * ba * backdrop_channel + sa * straight_mixed) / result_alpha
        };

        Bgra::from_straight([
            mix_channel(bb, sb),
            mix_channel(bg, sg),
            mix_channel(br, sr),
            result_alpha,
        ])
    }
}
