//! `CanvasState`: the atomic unit of snapshot and publication.
//!
//! A `CanvasState` is `(width, height, optional background tile,
//! LayerList)`, `Arc`-shared like every other immutable node in the
//! workspace. `TransientCanvasState` is the uniquely-owned builder a
//! command handler mutates before freezing the result back with
//! [`TransientCanvasState::persist`]. There is no explicit `Discarded`
//! state to model: dropping a `TransientCanvasState` without calling
//! `persist` simply runs its fields' `Drop` impls, releasing whatever it
//! had started to own. That is the entire "Building / Persisted /
//! Discarded" state machine in a language with ownership instead of
//! hand-rolled refcounts.

use std::sync::Arc;

use canvas_error::CanvasError;
use canvas_image::Image;
use canvas_list::{LayerList, TransientLayerList};
use canvas_pixel::Bgra;
use canvas_tile::{Tile, TILE_SIZE};

pub const MAX_DIMENSION: u16 = 32767;

struct CanvasStateData {
    width: u16,
    height: u16,
    background: Option<Tile>,
    layers: LayerList,
}

/// Immutable, `Arc`-shared canvas snapshot. `Clone` is an atomic refcount
/// bump; the result is safe to share across threads and hold onto for as
/// long as a diff or render pass needs the old snapshot.
#[derive(Clone)]
pub struct CanvasState(Arc<CanvasStateData>);

impl CanvasState {
    /// The empty canvas: zero dimensions, no background, no layers. The
    /// starting point of every fresh document, before its first
    /// CanvasResize.
    pub fn empty() -> CanvasState {
        CanvasState(Arc::new(CanvasStateData {
            width: 0,
            height: 0,
            background: None,
            layers: LayerList::new_empty(),
        }))
    }

    pub fn width(&self) -> u16 {
        self.0.width
    }

    pub fn height(&self) -> u16 {
        self.0.height
    }

    pub fn background(&self) -> Option<&Tile> {
        self.0.background.as_ref()
    }

    pub fn layers(&self) -> &LayerList {
        &self.0.layers
    }

    /// Validate the invariant carried at every boundary: canvas
    /// width/height must fall in `[0, 32767]`.
    pub fn validate_dimensions(width: i64, height: i64) -> Result<(u16, u16), CanvasError> {
        if width < 0 || width > MAX_DIMENSION as i64 || height < 0 || height > MAX_DIMENSION as i64
        {
            return Err(CanvasError::invalid_argument(format!(
                "canvas dimensions {width}x{height} out of range [0, {MAX_DIMENSION}]"
            )));
        }
        Ok((width as u16, height as u16))
    }

    /// Flatten the full canvas to one RGBA image, always sized
    /// `(width, height)` regardless of layer content.
    /// `include_background` gates whether the background tile is tiled in
    /// beneath the layer stack (scenario 2) or left transparent.
    pub fn to_image(&self, include_background: bool) -> Image {
        let mut image = Image::new(self.0.width, self.0.height);
        if include_background {
            if let Some(background) = &self.0.background {
                tile_background_into(&mut image, background);
            }
        }
        for (content, props) in self.0.layers.iter() {
            if !props.visible() {
                continue;
            }
            let opacity = props.opacity_fraction();
            let blend_mode = props.blend_mode();
            for y in 0..self.0.height as i64 {
                for x in 0..self.0.width as i64 {
                    let source = content.get_pixel(x, y);
                    if source.is_fully_transparent() {
                        continue;
                    }
                    let backdrop = image.get_pixel(x, y);
                    let blended = blend_mode.composite(backdrop, source, opacity);
                    image.set_pixel(x, y, blended);
                }
            }
        }
        image
    }

    /// Shallow-clone into a uniquely-owned, mutable staging builder.
    pub fn transient_from(&self) -> TransientCanvasState {
        TransientCanvasState {
            width: self.0.width,
            height: self.0.height,
            background: self.0.background.clone(),
            layers: LayersSlot::Shared(self.0.layers.clone()),
        }
    }

    /// `Arc` pointer identity, used by diffing to short-circuit identical
    /// background tiles without touching pixels.
    pub fn background_ptr_eq(&self, other: &CanvasState) -> bool {
        match (&self.0.background, &other.0.background) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        }
    }
}

fn tile_background_into(image: &mut Image, background: &Tile) {
    for y in 0..image.height() as i64 {
        for x in 0..image.width() as i64 {
            let local_x = (x as u32) % TILE_SIZE;
            let local_y = (y as u32) % TILE_SIZE;
            image.set_pixel(x, y, background.get_pixel(local_x, local_y));
        }
    }
}

enum LayersSlot {
    Shared(LayerList),
    Owned(TransientLayerList),
}

/// Uniquely-owned, mutable staging version of a [`CanvasState`] (the
/// "Building" half of its lifecycle). A command handler
/// mutates this freely; nothing it touches is observable from any other
/// snapshot until [`TransientCanvasState::persist`] freezes it.
pub struct TransientCanvasState {
    width: u16,
    height: u16,
    background: Option<Tile>,
    layers: LayersSlot,
}

impl TransientCanvasState {
    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn set_dimensions(&mut self, width: u16, height: u16) {
        self.width = width;
        self.height = height;
    }

    pub fn background(&self) -> Option<&Tile> {
        self.background.as_ref()
    }

    pub fn set_background(&mut self, background: Option<Tile>) {
        self.background = background;
    }

    /// Borrow the layer list builder, promoting it from a shared
    /// reference to an owned builder the first time a command actually
    /// needs to mutate layers (copy-on-write).
    pub fn layers_mut(&mut self) -> &mut TransientLayerList {
        if let LayersSlot::Shared(layers) = &self.layers {
            self.layers = LayersSlot::Owned(layers.transient_from());
        }
        match &mut self.layers {
            LayersSlot::Owned(builder) => builder,
            LayersSlot::Shared(_) => unreachable!("just promoted to owned"),
        }
    }

    pub fn persist(self) -> CanvasState {
        let layers = match self.layers {
            LayersSlot::Shared(layers) => layers,
            LayersSlot::Owned(builder) => builder.persist(),
        };
        CanvasState(Arc::new(CanvasStateData {
            width: self.width,
            height: self.height,
            background: self.background,
            layers,
        }))
    }
}

/// Background payload helper shared by `CanvasBackground` and
/// `LayerCreate`'s fill color: converts a solid color into
/// an optional tile, collapsing fully-transparent fills to "no tile".
pub fn solid_color_tile(context_id: u32, color: Option<Bgra>) -> Option<Tile> {
    match color {
        Some(color) if !color.is_fully_transparent() => {
            Some(Tile::from_solid_color(context_id, color))
        }
        _ => None,
    }
}
