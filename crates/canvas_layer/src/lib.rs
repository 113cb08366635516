//! `LayerContent`/`LayerProps`: one layer's pixel grid and metadata,
//! plus the sublayer structure used for indirect brush accumulation.

use std::sync::Arc;

use canvas_error::CanvasError;
use canvas_image::{Image, PositionedImage};
use canvas_pixel::{BlendMode, Bgra};
use canvas_tile::{Tile, TransientTile, TILE_SIZE};

fn tiles_per_axis(extent: u16) -> u32 {
    (extent as u32).div_ceil(TILE_SIZE)
}

// ---------------------------------------------------------------------
// LayerProps
// ---------------------------------------------------------------------

#[derive(Debug, PartialEq)]
struct LayerPropsData {
    layer_id: u32,
    title: String,
    opacity: u8,
    blend_mode: BlendMode,
    visible: bool,
    censored: bool,
    fixed: bool,
    /// Non-zero when this (content, props) pair is a sublayer rather than
    /// a top-level layer; the value is the stroke's context_id.
    sublayer_id: u32,
}

/// Immutable, `Arc`-shared layer metadata. Small enough that mutation is
/// modeled as "build a new immutable value" rather than a separate
/// transient/builder type: the persistent/transient duality is
/// reserved for the large, expensive-to-copy nodes — tiles and the layer
/// tree — not an eight-field struct.
#[derive(Debug, Clone)]
pub struct LayerProps(Arc<LayerPropsData>);

impl PartialEq for LayerProps {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl LayerProps {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layer_id: u32,
        title: impl Into<String>,
        opacity: u8,
        blend_mode: BlendMode,
        visible: bool,
        censored: bool,
        fixed: bool,
        sublayer_id: u32,
    ) -> LayerProps {
        LayerProps(Arc::new(LayerPropsData {
            layer_id,
            title: title.into(),
            opacity,
            blend_mode,
            visible,
            censored,
            fixed,
            sublayer_id,
        }))
    }

    pub fn layer_id(&self) -> u32 {
        self.0.layer_id
    }

    pub fn title(&self) -> &str {
        &self.0.title
    }

    pub fn opacity(&self) -> u8 {
        self.0.opacity
    }

    pub fn opacity_fraction(&self) -> f32 {
        self.0.opacity as f32 / 255.0
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.0.blend_mode
    }

    pub fn visible(&self) -> bool {
        self.0.visible
    }

    pub fn censored(&self) -> bool {
        self.0.censored
    }

    pub fn fixed(&self) -> bool {
        self.0.fixed
    }

    pub fn sublayer_id(&self) -> u32 {
        self.0.sublayer_id
    }

    fn with_data(&self, mutate: impl FnOnce(&mut LayerPropsData)) -> LayerProps {
        let mut data = LayerPropsData::clone_from(&self.0);
        mutate(&mut data);
        LayerProps(Arc::new(data))
    }

    pub fn with_opacity(&self, opacity: u8) -> LayerProps {
        self.with_data(|data| data.opacity = opacity)
    }

    pub fn with_blend_mode(&self, blend_mode: BlendMode) -> LayerProps {
        self.with_data(|data| data.blend_mode = blend_mode)
    }

    pub fn with_censored(&self, censored: bool) -> LayerProps {
        self.with_data(|data| data.censored = censored)
    }

    pub fn with_fixed(&self, fixed: bool) -> LayerProps {
        self.with_data(|data| data.fixed = fixed)
    }

    pub fn with_visible(&self, visible: bool) -> LayerProps {
        self.with_data(|data| data.visible = visible)
    }

    pub fn with_title(&self, title: impl Into<String>) -> LayerProps {
        self.with_data(|data| data.title = title.into())
    }

    /// Whether changing `self` to `other`'s props would require
    /// re-rendering every tile, even if no pixel actually changed:
    /// opacity, blend mode, visibility and censor state all
    /// affect what gets flattened; title and the `fixed` lock do not.
    pub fn affects_rendering(&self, other: &LayerProps) -> bool {
        self.0.opacity != other.0.opacity
            || self.0.blend_mode != other.0.blend_mode
            || self.0.visible != other.0.visible
            || self.0.censored != other.0.censored
    }
}

impl LayerPropsData {
    fn clone_from(data: &LayerPropsData) -> LayerPropsData {
        LayerPropsData {
            layer_id: data.layer_id,
            title: data.title.clone(),
            opacity: data.opacity,
            blend_mode: data.blend_mode,
            visible: data.visible,
            censored: data.censored,
            fixed: data.fixed,
            sublayer_id: data.sublayer_id,
        }
    }
}

// ---------------------------------------------------------------------
// LayerContent
// ---------------------------------------------------------------------

struct LayerContentData {
    width: u16,
    height: u16,
    tiles_w: u32,
    tiles_h: u32,
    tiles: Box<[Tile]>,
    sublayers: Box<[(LayerContent, LayerProps)]>,
}

/// Immutable, `Arc`-shared layer pixel grid plus its sublayers.
#[derive(Clone)]
pub struct LayerContent(Arc<LayerContentData>);

impl LayerContent {
    pub fn width(&self) -> u16 {
        self.0.width
    }

    pub fn height(&self) -> u16 {
        self.0.height
    }

    pub fn tiles_w(&self) -> u32 {
        self.0.tiles_w
    }

    pub fn tiles_h(&self) -> u32 {
        self.0.tiles_h
    }

    pub fn tile_at(&self, tile_x: u32, tile_y: u32) -> Tile {
        if tile_x >= self.0.tiles_w || tile_y >= self.0.tiles_h {
            return Tile::blank();
        }
        self.0.tiles[(tile_y * self.0.tiles_w + tile_x) as usize].clone()
    }

    pub fn sub_contents(&self) -> impl Iterator<Item = &LayerContent> {
        self.0.sublayers.iter().map(|(content, _)| content)
    }

    pub fn sub_props(&self) -> impl Iterator<Item = &LayerProps> {
        self.0.sublayers.iter().map(|(_, props)| props)
    }

    pub fn find_sublayer(&self, sublayer_id: u32) -> Option<(&LayerContent, &LayerProps)> {
        self.0
            .sublayers
            .iter()
            .map(|(content, props)| (content, props))
            .find(|(_, props)| props.sublayer_id() == sublayer_id)
    }

    pub fn has_sublayers(&self) -> bool {
        !self.0.sublayers.is_empty()
    }

    pub fn get_pixel(&self, x: i64, y: i64) -> Bgra {
        if x < 0 || y < 0 || x >= self.0.width as i64 || y >= self.0.height as i64 {
            return Bgra::TRANSPARENT;
        }
        let tile_x = (x as u32) / TILE_SIZE;
        let tile_y = (y as u32) / TILE_SIZE;
        let local_x = (x as u32) % TILE_SIZE;
        let local_y = (y as u32) % TILE_SIZE;
        self.tile_at(tile_x, tile_y).get_pixel(local_x, local_y)
    }

    /// Flatten every tile into one RGBA image.
    pub fn to_image(&self) -> Image {
        let mut image = Image::new(self.0.width, self.0.height);
        for y in 0..self.0.height as i64 {
            for x in 0..self.0.width as i64 {
                image.set_pixel(x, y, self.get_pixel(x, y));
            }
        }
        image
    }

    /// Extract a rectangular region, optionally gated by a monochrome
    /// mask: pixels where `mask` is transparent are excluded from the
    /// result even if the layer has content there.
    pub fn select(&self, x: i64, y: i64, width: u16, height: u16, mask: Option<&Image>) -> Image {
        let mut out = Image::new(width, height);
        for row in 0..height as i64 {
            for col in 0..width as i64 {
                let mut color = self.get_pixel(x + col, y + row);
                if let Some(mask) = mask {
                    if mask.get_pixel(col, row).a == 0 {
                        color = Bgra::TRANSPARENT;
                    }
                }
                out.set_pixel(col, row, color);
            }
        }
        out
    }

    /// Produce a resized transient layer content: pixels are translated
    /// by `(left, top)` and the newly exposed area is blank.
    pub fn resize(
        &self,
        context_id: u32,
        top: i32,
        right: i32,
        bottom: i32,
        left: i32,
    ) -> TransientLayerContent {
        let new_width = (self.0.width as i64 + left as i64 + right as i64)
            .clamp(0, u16::MAX as i64) as u16;
        let new_height = (self.0.height as i64 + top as i64 + bottom as i64)
            .clamp(0, u16::MAX as i64) as u16;

        let mut builder = TransientLayerContent::new_blank(new_width, new_height);
        for y in 0..new_height as i64 {
            for x in 0..new_width as i64 {
                let color = self.get_pixel(x - left as i64, y - top as i64);
                if color.is_fully_transparent() {
                    continue;
                }
                builder.set_pixel(context_id, x as u32, y as u32, color);
            }
        }
        builder
    }

    /// Compare against the previous snapshot of this same layer slot,
    /// ignoring props (see [`LayerProps::affects_rendering`] for that
    /// half of the comparison).
    pub fn diff_against(&self, previous: Option<&LayerContent>) -> ContentDiff {
        let Some(previous) = previous else {
            return ContentDiff::AllChanged;
        };
        if self.0.width != previous.0.width || self.0.height != previous.0.height {
            return ContentDiff::AllChanged;
        }
        let mut changed = Vec::new();
        for tile_y in 0..self.0.tiles_h {
            for tile_x in 0..self.0.tiles_w {
                let a = &self.0.tiles[(tile_y * self.0.tiles_w + tile_x) as usize];
                let b = &previous.0.tiles[(tile_y * previous.0.tiles_w + tile_x) as usize];
                if !a.ptr_eq(b) {
                    changed.push((tile_x, tile_y));
                }
            }
        }
        ContentDiff::Tiles(changed)
    }

    /// Composite one tile of this layer onto `target`, honoring opacity
    /// and blend mode. Blank source tiles are a no-op.
    pub fn flatten_tile_to(
        &self,
        tile_x: u32,
        tile_y: u32,
        target: &mut TransientTile,
        opacity: u8,
        blend_mode: BlendMode,
    ) {
        let source = self.tile_at(tile_x, tile_y);
        composite_tile_into(target, &source, blend_mode, opacity as f32 / 255.0);
    }

    /// Shallow-clone into a uniquely-owned, mutable staging builder.
    pub fn transient_from(&self) -> TransientLayerContent {
        TransientLayerContent {
            width: self.0.width,
            height: self.0.height,
            tiles_w: self.0.tiles_w,
            tiles_h: self.0.tiles_h,
            tiles: self.0.tiles.iter().cloned().map(TileSlot::Shared).collect(),
            sublayers: self
                .0
                .sublayers
                .iter()
                .cloned()
                .map(|(content, props)| (ContentSlot::Shared(content), props))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentDiff {
    AllChanged,
    Tiles(Vec<(u32, u32)>),
}

fn composite_tile_into(target: &mut TransientTile, source: &Tile, blend_mode: BlendMode, opacity: f32) {
    if source.is_blank() || opacity <= 0.0 {
        return;
    }
    for y in 0..TILE_SIZE {
        for x in 0..TILE_SIZE {
            let source_pixel = source.get_pixel(x, y);
            if source_pixel.is_fully_transparent() {
                continue;
            }
            let dest_pixel = target.get_pixel(x, y);
            let blended = blend_mode.composite(dest_pixel, source_pixel, opacity);
            target.set_pixel(x, y, blended);
        }
    }
}

// ---------------------------------------------------------------------
// TransientLayerContent
// ---------------------------------------------------------------------

#[derive(Clone)]
enum TileSlot {
    Shared(Tile),
    Owned(TransientTile),
}

enum ContentSlot {
    Shared(LayerContent),
    Owned(Box<TransientLayerContent>),
}

/// Uniquely-owned, mutable staging version of a [`LayerContent`]. Tiles
/// and sublayers are only cloned into owned storage the first time a
/// write touches them (`ensure_owned_tile`/`sublayer_builder`); anything
/// left untouched is frozen back into the same `Arc` it started from.
pub struct TransientLayerContent {
    width: u16,
    height: u16,
    tiles_w: u32,
    tiles_h: u32,
    tiles: Vec<TileSlot>,
    sublayers: Vec<(ContentSlot, LayerProps)>,
}

impl TransientLayerContent {
    pub fn new_blank(width: u16, height: u16) -> TransientLayerContent {
        let tiles_w = tiles_per_axis(width).max(if width == 0 { 0 } else { 1 });
        let tiles_h = tiles_per_axis(height).max(if height == 0 { 0 } else { 1 });
        TransientLayerContent {
            width,
            height,
            tiles_w,
            tiles_h,
            tiles: vec![TileSlot::Shared(Tile::blank()); (tiles_w * tiles_h) as usize],
            sublayers: Vec::new(),
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    fn tile_index(&self, tile_x: u32, tile_y: u32) -> Option<usize> {
        if tile_x >= self.tiles_w || tile_y >= self.tiles_h {
            None
        } else {
            Some((tile_y * self.tiles_w + tile_x) as usize)
        }
    }

    fn ensure_owned_tile(&mut self, tile_x: u32, tile_y: u32) -> Option<&mut TransientTile> {
        let index = self.tile_index(tile_x, tile_y)?;
        if let TileSlot::Shared(tile) = &self.tiles[index] {
            self.tiles[index] = TileSlot::Owned(tile.transient_from());
        }
        match &mut self.tiles[index] {
            TileSlot::Owned(transient) => Some(transient),
            TileSlot::Shared(_) => unreachable!("just promoted to owned"),
        }
    }

    pub fn set_pixel(&mut self, context_id: u32, x: u32, y: u32, color: Bgra) {
        if x as u16 >= self.width || y as u16 >= self.height {
            return;
        }
        let tile_x = x / TILE_SIZE;
        let tile_y = y / TILE_SIZE;
        let local_x = x % TILE_SIZE;
        let local_y = y % TILE_SIZE;
        if let Some(tile) = self.ensure_owned_tile(tile_x, tile_y) {
            tile.set_context_id(context_id);
            tile.set_pixel(local_x, local_y, color);
        }
    }

    fn composite_pixel(
        &mut self,
        context_id: u32,
        x: i64,
        y: i64,
        blend_mode: BlendMode,
        source: Bgra,
        source_opacity: f32,
    ) {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return;
        }
        if source.is_fully_transparent() || source_opacity <= 0.0 {
            return;
        }
        let tile_x = (x as u32) / TILE_SIZE;
        let tile_y = (y as u32) / TILE_SIZE;
        let local_x = (x as u32) % TILE_SIZE;
        let local_y = (y as u32) % TILE_SIZE;
        if let Some(tile) = self.ensure_owned_tile(tile_x, tile_y) {
            tile.set_context_id(context_id);
            let current = tile.get_pixel(local_x, local_y);
            let blended = blend_mode.composite(current, source, source_opacity);
            tile.set_pixel(local_x, local_y, blended);
        }
    }

    pub fn put_image(
        &mut self,
        context_id: u32,
        blend_mode: BlendMode,
        left: i32,
        top: i32,
        image: &Image,
    ) {
        for iy in 0..image.height() as i64 {
            for ix in 0..image.width() as i64 {
                let source = image.get_pixel(ix, iy);
                self.composite_pixel(
                    context_id,
                    left as i64 + ix,
                    top as i64 + iy,
                    blend_mode,
                    source,
                    1.0,
                );
            }
        }
    }

    pub fn fill_rect(
        &mut self,
        context_id: u32,
        blend_mode: BlendMode,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
        color: Bgra,
    ) {
        for y in top as i64..bottom as i64 {
            for x in left as i64..right as i64 {
                self.composite_pixel(context_id, x, y, blend_mode, color, 1.0);
            }
        }
    }

    /// Apply a pre-rendered brush dab: `stamp.image`'s alpha channel is
    /// the dab's coverage mask, `color` supplies the pigment (brush
    /// parameter interpretation itself is the `Paint` collaborator's job;
    /// this just composites the result).
    pub fn brush_stamp_apply(
        &mut self,
        context_id: u32,
        color: Bgra,
        blend_mode: BlendMode,
        stamp: &PositionedImage,
    ) {
        let color_straight = color.to_straight_rgb();
        for iy in 0..stamp.image.height() as i64 {
            for ix in 0..stamp.image.width() as i64 {
                let coverage = stamp.image.get_pixel(ix, iy).a as f32 / 255.0;
                if coverage <= 0.0 {
                    continue;
                }
                let source_opacity = (color.a as f32 / 255.0) * coverage;
                let source = Bgra::from_straight_rgb(color_straight, 1.0);
                self.composite_pixel(
                    context_id,
                    stamp.left as i64 + ix,
                    stamp.top as i64 + iy,
                    blend_mode,
                    source,
                    source_opacity,
                );
            }
        }
    }

    pub fn put_tile(
        &mut self,
        context_id: u32,
        tile: Tile,
        tile_x: u32,
        tile_y: u32,
        repeat: bool,
    ) -> Result<(), CanvasError> {
        if repeat {
            for index in 0..self.tiles.len() {
                self.tiles[index] = TileSlot::Shared(tile.clone());
            }
            let _ = context_id;
            return Ok(());
        }
        let index = self
            .tile_index(tile_x, tile_y)
            .ok_or_else(|| CanvasError::invalid_argument("put_tile coordinates out of range"))?;
        self.tiles[index] = TileSlot::Shared(tile);
        Ok(())
    }

    /// Composite `other`'s pixels onto self at the same absolute tile
    /// coordinates (layers always share the canvas's (0,0) origin).
    pub fn merge(&mut self, _context_id: u32, other: &LayerContent, opacity: u8, blend_mode: BlendMode) {
        let opacity = opacity as f32 / 255.0;
        for tile_y in 0..other.tiles_h().min(self.tiles_h) {
            for tile_x in 0..other.tiles_w().min(self.tiles_w) {
                let source = other.tile_at(tile_x, tile_y);
                if source.is_blank() {
                    continue;
                }
                if let Some(target) = self.ensure_owned_tile(tile_x, tile_y) {
                    composite_tile_into(target, &source, blend_mode, opacity);
                }
            }
        }
    }

    /// Materialize transient tiles for a new grid size; existing tiles
    /// are carried over at matching grid positions, the rest start blank.
    /// Unlike [`LayerContent::resize`] this never translates pixel
    /// content — it only changes how many tiles exist.
    pub fn resize_to(self, new_width: u16, new_height: u16) -> TransientLayerContent {
        let mut resized = TransientLayerContent::new_blank(new_width, new_height);
        for tile_y in 0..self.tiles_h.min(resized.tiles_h) {
            for tile_x in 0..self.tiles_w.min(resized.tiles_w) {
                let src_index = (tile_y * self.tiles_w + tile_x) as usize;
                let dst_index = (tile_y * resized.tiles_w + tile_x) as usize;
                resized.tiles[dst_index] = match &self.tiles[src_index] {
                    TileSlot::Shared(tile) => TileSlot::Shared(tile.clone()),
                    TileSlot::Owned(transient) => TileSlot::Owned(transient.clone()),
                };
            }
        }
        resized
    }

    // -- sublayers --------------------------------------------------

    pub fn find_sublayer_index(&self, sublayer_id: u32) -> Option<usize> {
        self.sublayers
            .iter()
            .position(|(_, props)| props.sublayer_id() == sublayer_id)
    }

    /// Return the index of the sublayer for `sublayer_id`, creating an
    /// empty one sized to this layer if none exists yet.
    pub fn get_or_create_sublayer(
        &mut self,
        sublayer_id: u32,
        opacity: u8,
        blend_mode: BlendMode,
    ) -> usize {
        if let Some(index) = self.find_sublayer_index(sublayer_id) {
            return index;
        }
        let content = TransientLayerContent::new_blank(self.width, self.height);
        let props = LayerProps::new(0, "", opacity, blend_mode, true, false, false, sublayer_id);
        self.sublayers.push((ContentSlot::Owned(Box::new(content)), props));
        self.sublayers.len() - 1
    }

    pub fn sublayer_mut(&mut self, index: usize) -> &mut TransientLayerContent {
        let (slot, _) = &mut self.sublayers[index];
        if let ContentSlot::Shared(content) = slot {
            *slot = ContentSlot::Owned(Box::new(content.transient_from()));
        }
        match slot {
            ContentSlot::Owned(builder) => builder,
            ContentSlot::Shared(_) => unreachable!("just promoted to owned"),
        }
    }

    pub fn sublayer_props(&self, index: usize) -> &LayerProps {
        &self.sublayers[index].1
    }

    pub fn set_sublayer_props(&mut self, index: usize, props: LayerProps) {
        self.sublayers[index].1 = props;
    }

    /// Remove and freeze a sublayer, for merging it into the parent.
    pub fn take_sublayer(&mut self, index: usize) -> (LayerContent, LayerProps) {
        let (slot, props) = self.sublayers.remove(index);
        let content = match slot {
            ContentSlot::Shared(content) => content,
            ContentSlot::Owned(builder) => builder.persist(),
        };
        (content, props)
    }

    pub fn has_any_sublayer(&self) -> bool {
        !self.sublayers.is_empty()
    }

    /// Freeze a read-only snapshot of the current builder state without
    /// consuming it. Used when a command needs to read through a layer it
    /// has already started mutating earlier in the same transaction (e.g.
    /// `layer_create` duplicating a just-edited source layer).
    pub fn snapshot(&self) -> LayerContent {
        let tiles = self
            .tiles
            .iter()
            .map(|slot| match slot {
                TileSlot::Shared(tile) => tile.clone(),
                TileSlot::Owned(transient) => transient.clone().persist(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let sublayers = self
            .sublayers
            .iter()
            .map(|(slot, props)| {
                let content = match slot {
                    ContentSlot::Shared(content) => content.clone(),
                    ContentSlot::Owned(builder) => builder.snapshot(),
                };
                (content, props.clone())
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        LayerContent(Arc::new(LayerContentData {
            width: self.width,
            height: self.height,
            tiles_w: self.tiles_w,
            tiles_h: self.tiles_h,
            tiles,
            sublayers,
        }))
    }

    pub fn persist(self) -> LayerContent {
        let tiles = self
            .tiles
            .into_iter()
            .map(|slot| match slot {
                TileSlot::Shared(tile) => tile,
                TileSlot::Owned(transient) => transient.persist(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let sublayers = self
            .sublayers
            .into_iter()
            .map(|(slot, props)| {
                let content = match slot {
                    ContentSlot::Shared(content) => content,
                    ContentSlot::Owned(builder) => builder.persist(),
                };
                (content, props)
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        LayerContent(Arc::new(LayerContentData {
            width: self.width,
            height: self.height,
            tiles_w: self.tiles_w,
            tiles_h: self.tiles_h,
            tiles,
            sublayers,
        }))
    }
}

impl Bgra {
    fn to_straight_rgb(self) -> (f32, f32, f32) {
        if self.a == 0 {
            return (0.0, 0.0, 0.0);
        }
        let a = self.a as f32 / 255.0;
        (
            (self.b as f32 / 255.0) / a,
            (self.g as f32 / 255.0) / a,
            (self.r as f32 / 255.0) / a,
        )
    }

    fn from_straight_rgb(straight: (f32, f32, f32), alpha: f32) -> Bgra {
        let (b, g, r) = straight;
        let alpha = alpha.clamp(0.0, 1.0);
        let channel = |value: f32| ((value.clamp(0.0, 1.0) * alpha) * 255.0).round() as u8;
        Bgra {
            b: channel(b),
            g: channel(g),
            r: channel(r),
            a: (alpha * 255.0).round() as u8,
        }
    }
}
