//! `LayerList`/`LayerPropsList`: the ordered sequence of (LayerContent,
//! LayerProps) pairs making up a canvas, plus every routed draw
//! operation addressed by layer_id.

use canvas_error::CanvasError;
use canvas_image::{Image, PositionedImage, Quad};
use canvas_layer::{LayerContent, LayerProps, TransientLayerContent};
use canvas_pixel::{Bgra, BlendMode};
use canvas_tile::Tile;
use canvas_traits::ImageTransform;
use std::sync::Arc;

struct LayerListData {
    layers: Box<[(LayerContent, LayerProps)]>,
}

/// Immutable, `Arc`-shared ordered layer stack. Index 0 is the bottom of
/// the stack; the last entry is the top.
#[derive(Clone)]
pub struct LayerList(Arc<LayerListData>);

impl Default for LayerList {
    fn default() -> Self {
        LayerList::new_empty()
    }
}

impl LayerList {
    pub fn new_empty() -> LayerList {
        LayerList(Arc::new(LayerListData { layers: Box::new([]) }))
    }

    pub fn len(&self) -> usize {
        self.0.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.layers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LayerContent, &LayerProps)> {
        self.0.layers.iter().map(|(content, props)| (content, props))
    }

    pub fn position_of(&self, layer_id: u32) -> Option<usize> {
        self.0.layers.iter().position(|(_, props)| props.layer_id() == layer_id)
    }

    pub fn get(&self, layer_id: u32) -> Option<(&LayerContent, &LayerProps)> {
        let index = self.position_of(layer_id)?;
        Some((&self.0.layers[index].0, &self.0.layers[index].1))
    }

    pub fn get_at(&self, index: usize) -> Option<(&LayerContent, &LayerProps)> {
        self.0.layers.get(index).map(|(content, props)| (content, props))
    }

    pub fn contains(&self, layer_id: u32) -> bool {
        self.position_of(layer_id).is_some()
    }

    /// Read-only check used to implement PenUp's laziness:
    /// the caller can decide not to build a transient list at all when
    /// this returns `false`.
    pub fn any_sublayer_with_id(&self, context_id: u32) -> bool {
        self.0
            .layers
            .iter()
            .any(|(content, _)| content.find_sublayer(context_id).is_some())
    }

    /// Shallow-clone into a uniquely-owned, mutable staging builder.
    pub fn transient_from(&self) -> TransientLayerList {
        TransientLayerList {
            layers: self.0.layers.iter().cloned().map(LayerSlot::Shared).collect(),
        }
    }
}

// ---------------------------------------------------------------------
// TransientLayerList
// ---------------------------------------------------------------------

enum LayerSlot {
    Shared((LayerContent, LayerProps)),
    Owned((TransientLayerContent, LayerProps)),
}

impl LayerSlot {
    fn layer_id(&self) -> u32 {
        self.props().layer_id()
    }

    fn props(&self) -> &LayerProps {
        match self {
            LayerSlot::Shared((_, props)) => props,
            LayerSlot::Owned((_, props)) => props,
        }
    }

    fn set_props(&mut self, props: LayerProps) {
        match self {
            LayerSlot::Shared((_, p)) | LayerSlot::Owned((_, p)) => *p = props,
        }
    }

    fn content_snapshot(&self) -> LayerContent {
        match self {
            LayerSlot::Shared((content, _)) => content.clone(),
            LayerSlot::Owned((builder, _)) => builder.snapshot(),
        }
    }
}

/// Uniquely-owned, mutable staging version of a [`LayerList`]. Only
/// layers actually touched by a command are promoted from `Shared` to
/// `Owned`; the rest freeze back into the same `Arc` they started from.
pub struct TransientLayerList {
    layers: Vec<LayerSlot>,
}

impl TransientLayerList {
    pub fn new_empty() -> TransientLayerList {
        TransientLayerList { layers: Vec::new() }
    }

    pub fn reserve(&mut self, additional: usize) {
        self.layers.reserve(additional);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn position_of(&self, layer_id: u32) -> Option<usize> {
        self.layers.iter().position(|slot| slot.layer_id() == layer_id)
    }

    pub fn contains(&self, layer_id: u32) -> bool {
        self.position_of(layer_id).is_some()
    }

    pub fn props(&self, layer_id: u32) -> Option<&LayerProps> {
        let index = self.position_of(layer_id)?;
        Some(self.layers[index].props())
    }

    fn ensure_owned(&mut self, index: usize) -> &mut (TransientLayerContent, LayerProps) {
        if let LayerSlot::Shared((content, props)) = &self.layers[index] {
            self.layers[index] = LayerSlot::Owned((content.transient_from(), props.clone()));
        }
        match &mut self.layers[index] {
            LayerSlot::Owned(pair) => pair,
            LayerSlot::Shared(_) => unreachable!("just promoted to owned"),
        }
    }

    fn require_index(&self, layer_id: u32) -> Result<usize, CanvasError> {
        self.position_of(layer_id)
            .ok_or_else(|| CanvasError::not_found(format!("layer_id={layer_id}")))
    }

    // -- layer lifecycle ---------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn layer_create(
        &mut self,
        layer_id: u32,
        source_id: Option<u32>,
        fill_tile: Option<Tile>,
        insert: bool,
        copy: bool,
        canvas_w: u16,
        canvas_h: u16,
        title: impl Into<String>,
    ) -> Result<(), CanvasError> {
        if self.contains(layer_id) {
            return Err(CanvasError::already_exists(format!("layer_id={layer_id}")));
        }

        let content = if copy {
            let source_id = source_id.ok_or_else(|| {
                CanvasError::invalid_argument("layer_create: copy requires source_id")
            })?;
            let source_index = self.require_index(source_id)?;
            self.layers[source_index].content_snapshot()
        } else {
            let mut builder = TransientLayerContent::new_blank(canvas_w, canvas_h);
            if let Some(tile) = fill_tile {
                builder.put_tile(0, tile, 0, 0, true)?;
            }
            builder.persist()
        };

        let insert_at = if insert {
            let source_id = source_id.ok_or_else(|| {
                CanvasError::invalid_argument("layer_create: insert requires source_id")
            })?;
            self.require_index(source_id)? + 1
        } else {
            self.layers.len()
        };

        let props = LayerProps::new(layer_id, title, 255, BlendMode::Normal, true, false, false, 0);
        self.layers.insert(insert_at, LayerSlot::Shared((content, props)));
        Ok(())
    }

    pub fn layer_attr(
        &mut self,
        layer_id: u32,
        sublayer_id: u32,
        opacity: u8,
        blend_mode: BlendMode,
        censored: bool,
        fixed: bool,
    ) -> Result<(), CanvasError> {
        let index = self.require_index(layer_id)?;

        if sublayer_id == 0 {
            let updated = self.layers[index]
                .props()
                .with_opacity(opacity)
                .with_blend_mode(blend_mode)
                .with_censored(censored)
                .with_fixed(fixed);
            self.layers[index].set_props(updated);
            return Ok(());
        }

        let (builder, _) = self.ensure_owned(index);
        let sub_index = builder
            .find_sublayer_index(sublayer_id)
            .ok_or_else(|| CanvasError::not_found(format!("sublayer_id={sublayer_id}")))?;
        let updated = builder
            .sublayer_props(sub_index)
            .with_opacity(opacity)
            .with_blend_mode(blend_mode)
            .with_censored(censored)
            .with_fixed(fixed);
        builder.set_sublayer_props(sub_index, updated);
        Ok(())
    }

    pub fn layer_retitle(&mut self, layer_id: u32, title: impl Into<String>) -> Result<(), CanvasError> {
        let index = self.require_index(layer_id)?;
        let updated = self.layers[index].props().with_title(title);
        self.layers[index].set_props(updated);
        Ok(())
    }

    pub fn layer_visibility(&mut self, layer_id: u32, visible: bool) -> Result<(), CanvasError> {
        let index = self.require_index(layer_id)?;
        let updated = self.layers[index].props().with_visible(visible);
        self.layers[index].set_props(updated);
        Ok(())
    }

    pub fn layer_reorder(&mut self, layer_ids: &[u32]) -> Result<(), CanvasError> {
        if layer_ids.len() != self.layers.len() {
            return Err(CanvasError::invalid_argument(
                "layer_reorder: permutation length does not match layer count",
            ));
        }
        let mut remaining: Vec<Option<LayerSlot>> =
            std::mem::take(&mut self.layers).into_iter().map(Some).collect();
        let mut reordered = Vec::with_capacity(remaining.len());
        for &layer_id in layer_ids {
            let index = remaining
                .iter()
                .position(|slot| matches!(slot, Some(slot) if slot.layer_id() == layer_id))
                .ok_or_else(|| {
                    CanvasError::invalid_argument(format!("layer_reorder: unknown layer_id={layer_id}"))
                })?;
            reordered.push(remaining[index].take().expect("slot already taken"));
        }
        self.layers = reordered;
        Ok(())
    }

    pub fn layer_delete(&mut self, context_id: u32, layer_id: u32, merge: bool) -> Result<(), CanvasError> {
        let index = self.require_index(layer_id)?;
        if merge && index > 0 {
            let content = self.layers[index].content_snapshot();
            let props = self.layers[index].props().clone();
            let below_index = index - 1;
            let (below_builder, _) = self.ensure_owned(below_index);
            below_builder.merge(context_id, &content, props.opacity(), props.blend_mode());
        }
        self.layers.remove(index);
        Ok(())
    }

    /// Resize-copy every layer for a CanvasResize command.
    pub fn resize_all(&mut self, context_id: u32, top: i32, right: i32, bottom: i32, left: i32) {
        for slot in &mut self.layers {
            let props = slot.props().clone();
            let resized = match slot {
                LayerSlot::Shared((content, _)) => content.resize(context_id, top, right, bottom, left),
                LayerSlot::Owned((builder, _)) => builder.snapshot().resize(context_id, top, right, bottom, left),
            };
            *slot = LayerSlot::Owned((resized, props));
        }
    }

    /// PenUp: merge every sublayer tagged `context_id` into its parent
    /// layer. The caller is expected to have already checked
    /// [`LayerList::any_sublayer_with_id`] so this is only invoked when
    /// there is real work to do.
    pub fn penup_merge(&mut self, context_id: u32) {
        for index in 0..self.layers.len() {
            let has_sublayer = match &self.layers[index] {
                LayerSlot::Shared((content, _)) => content.find_sublayer(context_id).is_some(),
                LayerSlot::Owned((builder, _)) => builder.find_sublayer_index(context_id).is_some(),
            };
            if !has_sublayer {
                continue;
            }
            let (builder, _) = self.ensure_owned(index);
            let sub_index = builder
                .find_sublayer_index(context_id)
                .expect("checked has_sublayer above");
            let (content, props) = builder.take_sublayer(sub_index);
            builder.merge(context_id, &content, props.opacity(), props.blend_mode());
        }
    }

    // -- routed draw operations ---------------------------------------

    /// Unlike `fill_rect`/`draw_dabs`, PutImage accepts any known blend
    /// mode (including `Replace`) — §4.5 only fails it on a decompress
    /// error or an unknown mode, both already handled before this is
    /// called (`parse_blend_mode` in the interpreter).
    pub fn put_image(
        &mut self,
        layer_id: u32,
        context_id: u32,
        blend_mode: BlendMode,
        left: i32,
        top: i32,
        image: &Image,
    ) -> Result<(), CanvasError> {
        let index = self.require_index(layer_id)?;
        let (builder, _) = self.ensure_owned(index);
        builder.put_image(context_id, blend_mode, left, top, image);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn fill_rect(
        &mut self,
        layer_id: u32,
        context_id: u32,
        blend_mode: BlendMode,
        left: i32,
        top: i32,
        right: i32,
        bottom: i32,
        color: Bgra,
    ) -> Result<(), CanvasError> {
        require_brush_compatible(blend_mode)?;
        if left >= right || top >= bottom {
            return Err(CanvasError::invalid_argument("fill_rect: empty rectangle"));
        }
        let index = self.require_index(layer_id)?;
        let (builder, _) = self.ensure_owned(index);
        builder.fill_rect(context_id, blend_mode, left, top, right, bottom, color);
        Ok(())
    }

    pub fn put_tile(
        &mut self,
        layer_id: u32,
        sublayer_id: u32,
        context_id: u32,
        tile: Tile,
        tile_x: u32,
        tile_y: u32,
        repeat: bool,
    ) -> Result<(), CanvasError> {
        let index = self.require_index(layer_id)?;
        let (builder, _) = self.ensure_owned(index);
        if sublayer_id == 0 {
            builder.put_tile(context_id, tile, tile_x, tile_y, repeat)
        } else {
            let sub_index = builder.get_or_create_sublayer(sublayer_id, 255, BlendMode::Normal);
            builder.sublayer_mut(sub_index).put_tile(context_id, tile, tile_x, tile_y, repeat)
        }
    }

    /// Cut a (possibly masked) rectangle out of the layer and paste it
    /// back in, perspective-transformed into `dst_quad`. The source
    /// rectangle is erased with `BlendMode::Erase`
    /// gated by `mask` (an opaque synthetic mask when none is supplied),
    /// so a masked move never disturbs pixels the mask excludes.
    #[allow(clippy::too_many_arguments)]
    pub fn region_move(
        &mut self,
        layer_id: u32,
        context_id: u32,
        src_x: i64,
        src_y: i64,
        src_w: u16,
        src_h: u16,
        dst_quad: Quad,
        mask: Option<&Image>,
        transform: &dyn ImageTransform,
    ) -> Result<(), CanvasError> {
        if src_w == 0 || src_h == 0 {
            return Err(CanvasError::invalid_argument("region_move: src_rect must be positive"));
        }
        let index = self.require_index(layer_id)?;
        let (builder, _) = self.ensure_owned(index);

        let selected = builder.snapshot().select(src_x, src_y, src_w, src_h, mask);

        let eraser = match mask {
            Some(mask_image) => mask_image.clone(),
            None => opaque_image(src_w, src_h),
        };
        builder.put_image(context_id, BlendMode::Erase, src_x as i32, src_y as i32, &eraser);

        let (transformed, offset_x, offset_y) =
            canvas_image::image_transform(&selected, dst_quad, transform)?;
        builder.put_image(context_id, BlendMode::Normal, offset_x, offset_y, &transformed);
        Ok(())
    }

    /// Composite brush dabs onto the layer: in
    /// direct mode dabs composite straight in with `blend_mode`; in
    /// indirect mode they accumulate into an ephemeral sublayer keyed by
    /// `context_id` with NORMAL, and the sublayer itself carries
    /// `blend_mode`/the color's alpha as its own opacity.
    pub fn draw_dabs(
        &mut self,
        layer_id: u32,
        context_id: u32,
        color: Bgra,
        blend_mode: BlendMode,
        indirect: bool,
        stamps: &[PositionedImage],
    ) -> Result<(), CanvasError> {
        require_brush_compatible(blend_mode)?;
        let index = self.require_index(layer_id)?;
        let (builder, _) = self.ensure_owned(index);

        if indirect {
            // The color's alpha byte becomes the sublayer's own opacity
            // (applied once, at merge time); dabs inside the sublayer
            // must not apply it a second time, or a PenUp merge would
            // produce a darker/more-transparent result than the
            // equivalent direct-mode stroke.
            let full_alpha_color = Bgra { a: 255, ..color };
            let sub_index = builder.get_or_create_sublayer(context_id, color.a, blend_mode);
            let sublayer = builder.sublayer_mut(sub_index);
            for stamp in stamps {
                sublayer.brush_stamp_apply(context_id, full_alpha_color, BlendMode::Normal, stamp);
            }
        } else {
            for stamp in stamps {
                builder.brush_stamp_apply(context_id, color, blend_mode, stamp);
            }
        }
        Ok(())
    }

    pub fn persist(self) -> LayerList {
        let layers = self
            .layers
            .into_iter()
            .map(|slot| match slot {
                LayerSlot::Shared(pair) => pair,
                LayerSlot::Owned((builder, props)) => (builder.persist(), props),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        LayerList(Arc::new(LayerListData { layers }))
    }
}

fn require_brush_compatible(blend_mode: BlendMode) -> Result<(), CanvasError> {
    if blend_mode.is_brush_compatible() {
        Ok(())
    } else {
        Err(CanvasError::invalid_argument(format!(
            "blend mode {blend_mode:?} is not valid for a brush operation"
        )))
    }
}

fn opaque_image(width: u16, height: u16) -> Image {
    let mut image = Image::new(width, height);
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            image.set_pixel(x, y, Bgra { b: 255, g: 255, r: 255, a: 255 });
        }
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_create_rejects_duplicate_id() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 8, 8, "base").unwrap();
        let error = list
            .layer_create(1, None, None, false, false, 8, 8, "dup")
            .unwrap_err();
        assert!(matches!(error, CanvasError::AlreadyExists(_)));
    }

    #[test]
    fn layer_create_insert_places_above_source() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 8, 8, "one").unwrap();
        list.layer_create(2, None, None, false, false, 8, 8, "two").unwrap();
        list.layer_create(3, Some(1), None, true, false, 8, 8, "inserted").unwrap();

        let persisted = list.persist();
        let ids: Vec<u32> = persisted.iter().map(|(_, props)| props.layer_id()).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn layer_create_copy_duplicates_source_content() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 8, 8, "one").unwrap();
        list.fill_rect(1, 1, BlendMode::Normal, 0, 0, 4, 4, Bgra { b: 0, g: 0, r: 255, a: 255 })
            .unwrap();
        list.layer_create(2, Some(1), None, false, true, 8, 8, "copy").unwrap();

        let persisted = list.persist();
        let (content, _) = persisted.get(2).unwrap();
        assert_eq!(content.get_pixel(0, 0), Bgra { b: 0, g: 0, r: 255, a: 255 });
    }

    #[test]
    fn layer_reorder_matches_permutation() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 4, 4, "a").unwrap();
        list.layer_create(2, None, None, false, false, 4, 4, "b").unwrap();
        list.layer_reorder(&[2, 1]).unwrap();
        let persisted = list.persist();
        let ids: Vec<u32> = persisted.iter().map(|(_, props)| props.layer_id()).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn layer_reorder_rejects_unknown_id() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 4, 4, "a").unwrap();
        let error = list.layer_reorder(&[99]).unwrap_err();
        assert!(matches!(error, CanvasError::InvalidArgument(_)));
    }

    #[test]
    fn layer_delete_without_merge_restores_prior_layer_list() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 4, 4, "a").unwrap();
        let before_ids: Vec<u32> = list.persist().iter().map(|(_, props)| props.layer_id()).collect();

        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 4, 4, "a").unwrap();
        list.layer_create(2, None, None, false, false, 4, 4, "b").unwrap();
        list.layer_delete(0, 2, false).unwrap();
        let after_ids: Vec<u32> = list.persist().iter().map(|(_, props)| props.layer_id()).collect();
        assert_eq!(before_ids, after_ids);
    }

    #[test]
    fn layer_delete_merge_composites_into_layer_below() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 8, 8, "below").unwrap();
        list.layer_create(2, None, None, false, false, 8, 8, "above").unwrap();
        list.fill_rect(2, 1, BlendMode::Normal, 0, 0, 8, 8, Bgra { b: 9, g: 9, r: 9, a: 255 })
            .unwrap();
        list.layer_delete(1, 2, true).unwrap();

        let persisted = list.persist();
        assert_eq!(persisted.len(), 1);
        let (content, _) = persisted.get(1).unwrap();
        assert_eq!(content.get_pixel(0, 0), Bgra { b: 9, g: 9, r: 9, a: 255 });
    }

    #[test]
    fn fill_rect_rejects_empty_rectangle() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 8, 8, "a").unwrap();
        let error = list
            .fill_rect(1, 1, BlendMode::Normal, 4, 4, 4, 4, Bgra { b: 1, g: 1, r: 1, a: 255 })
            .unwrap_err();
        assert!(matches!(error, CanvasError::InvalidArgument(_)));
    }

    #[test]
    fn fill_rect_rejects_replace_blend_mode() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 8, 8, "a").unwrap();
        let error = list
            .fill_rect(1, 1, BlendMode::Replace, 0, 0, 4, 4, Bgra { b: 1, g: 1, r: 1, a: 255 })
            .unwrap_err();
        assert!(matches!(error, CanvasError::InvalidArgument(_)));
    }

    #[test]
    fn put_image_fails_for_missing_layer() {
        let mut list = TransientLayerList::new_empty();
        let image = Image::new(4, 4);
        let error = list.put_image(42, 1, BlendMode::Normal, 0, 0, &image).unwrap_err();
        assert!(matches!(error, CanvasError::NotFound(_)));
    }

    #[test]
    fn put_image_accepts_replace_blend_mode() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 8, 8, "a").unwrap();
        let mut image = Image::new(4, 4);
        image.set_pixel(0, 0, Bgra { b: 0, g: 0, r: 255, a: 255 });
        list.put_image(1, 1, BlendMode::Replace, 0, 0, &image).unwrap();
    }

    #[test]
    fn draw_dabs_indirect_creates_sublayer_then_merges_on_penup() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 64, 64, "a").unwrap();

        let mut stamp_image = Image::new(4, 4);
        for y in 0..4i64 {
            for x in 0..4i64 {
                stamp_image.set_pixel(x, y, Bgra { b: 0, g: 0, r: 255, a: 255 });
            }
        }
        let stamp = PositionedImage { image: stamp_image, left: 0, top: 0 };

        list.draw_dabs(1, 7, Bgra { b: 0, g: 0, r: 255, a: 0x80 }, BlendMode::Multiply, true, &[stamp])
            .unwrap();

        let persisted = list.persist();
        let (content, _) = persisted.get(1).unwrap();
        assert!(content.has_sublayers());
        assert!(persisted.any_sublayer_with_id(7));

        let mut list = persisted.transient_from();
        list.penup_merge(7);
        let persisted = list.persist();
        let (content, _) = persisted.get(1).unwrap();
        assert!(!content.has_sublayers());
        assert_eq!(content.get_pixel(0, 0), Bgra { b: 0, g: 0, r: 255, a: 128 });
    }

    #[test]
    fn penup_merge_twice_is_idempotent() {
        let mut list = TransientLayerList::new_empty();
        list.layer_create(1, None, None, false, false, 64, 64, "a").unwrap();
        let persisted = list.persist();
        assert!(!persisted.any_sublayer_with_id(5));
    }
}
