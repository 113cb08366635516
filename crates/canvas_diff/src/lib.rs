//! `CanvasDiff` and `RenderDriver`: the per-tile change bitmap that makes
//! incremental re-rendering tractable, and the flattener
//! that uses it to re-render only the tiles that actually changed.

use bitvec::prelude::*;

use canvas_layer::ContentDiff;
use canvas_pixel::Bgra;
use canvas_state::CanvasState;
use canvas_tile::{TransientTile, TILE_SIZE};

fn tiles_per_axis(extent: u16) -> u32 {
    (extent as u32).div_ceil(TILE_SIZE)
}

/// Per-tile change bitmap for one pair of canvas snapshots, plus a
/// sticky "did any layer property change" flag.
pub struct CanvasDiff {
    xtiles: u32,
    ytiles: u32,
    changed: BitVec,
    layer_props_changed: bool,
}

impl Default for CanvasDiff {
    fn default() -> Self {
        CanvasDiff::new()
    }
}

impl CanvasDiff {
    pub fn new() -> CanvasDiff {
        CanvasDiff {
            xtiles: 0,
            ytiles: 0,
            changed: BitVec::new(),
            layer_props_changed: false,
        }
    }

    pub fn xtiles(&self) -> u32 {
        self.xtiles
    }

    pub fn ytiles(&self) -> u32 {
        self.ytiles
    }

    /// Resize the bitmap to the new canvas's tile grid. If either
    /// dimension changed, every tile is conservatively marked changed.
    /// TODO: this could be narrowed to only newly added tiles, but that
    /// requires tracking which tiles are newly-added vs.
    /// pre-existing-but-shifted, which is left unresolved for now.
    pub fn begin(&mut self, old_w: u16, old_h: u16, new_w: u16, new_h: u16, layer_props_changed: bool) {
        self.xtiles = tiles_per_axis(new_w);
        self.ytiles = tiles_per_axis(new_h);
        self.changed = bitvec![0; (self.xtiles * self.ytiles) as usize];
        self.layer_props_changed = layer_props_changed;
        if old_w != new_w || old_h != new_h {
            self.check_all();
        }
    }

    fn index(&self, tile_x: u32, tile_y: u32) -> usize {
        (tile_y * self.xtiles + tile_x) as usize
    }

    fn mark(&mut self, tile_x: u32, tile_y: u32) {
        if tile_x < self.xtiles && tile_y < self.ytiles {
            let index = self.index(tile_x, tile_y);
            self.changed.set(index, true);
        }
    }

    fn mark_region(&mut self, tiles_w: u32, tiles_h: u32) {
        for tile_y in 0..tiles_h.min(self.ytiles) {
            for tile_x in 0..tiles_w.min(self.xtiles) {
                self.mark(tile_x, tile_y);
            }
        }
    }

    /// For every currently-unchanged tile, invoke `f(index)`; mark the
    /// tile changed if it returns `true`. `f` closes over whatever
    /// payload it needs, the idiomatic Rust substitute for a `void*`
    /// userdata pointer.
    pub fn check(&mut self, mut f: impl FnMut(usize) -> bool) {
        for index in 0..self.changed.len() {
            if !self.changed[index] && f(index) {
                self.changed.set(index, true);
            }
        }
    }

    pub fn check_all(&mut self) {
        self.changed.fill(true);
    }

    pub fn each_index(&self, mut f: impl FnMut(usize)) {
        for index in 0..self.changed.len() {
            if self.changed[index] {
                f(index);
            }
        }
    }

    pub fn each_pos(&self, mut f: impl FnMut(u32, u32)) {
        let xtiles = self.xtiles;
        self.each_index(|index| {
            let index = index as u32;
            f(index % xtiles, index / xtiles);
        });
    }

    pub fn tiles_changed(&self) -> bool {
        self.changed.any()
    }

    pub fn layer_props_changed_reset(&mut self) -> bool {
        let value = self.layer_props_changed;
        self.layer_props_changed = false;
        value
    }
}

/// Compare `new` against `old` (absent on the very first snapshot) and
/// produce the tile-level dirty set.
pub fn canvas_state_diff(
    new: &CanvasState,
    old: Option<&CanvasState>,
    layer_props_changed: bool,
) -> CanvasDiff {
    let mut diff = CanvasDiff::new();
    let Some(old) = old else {
        diff.begin(0, 0, new.width(), new.height(), layer_props_changed);
        return diff;
    };

    diff.begin(old.width(), old.height(), new.width(), new.height(), layer_props_changed);
    if diff.tiles_changed() {
        // Dimensions differ; `begin` already marked everything.
        return diff;
    }

    if !new.background_ptr_eq(old) {
        diff.check_all();
        return diff;
    }

    diff_layer_lists(new, old, &mut diff);
    diff
}

fn diff_layer_lists(new: &CanvasState, old: &CanvasState, diff: &mut CanvasDiff) {
    let new_ids: Vec<u32> = new.layers().iter().map(|(_, props)| props.layer_id()).collect();
    let old_ids: Vec<u32> = old.layers().iter().map(|(_, props)| props.layer_id()).collect();
    if new_ids != old_ids {
        // Layer added, removed, or reordered: compositing order changed,
        // so the whole stack needs re-flattening.
        diff.check_all();
        return;
    }

    for (content, props) in new.layers().iter() {
        let (prev_content, prev_props) = old
            .layers()
            .get(props.layer_id())
            .expect("layer id sets matched above");

        if props.affects_rendering(prev_props) {
            diff.mark_region(content.tiles_w(), content.tiles_h());
            continue;
        }

        match content.diff_against(Some(prev_content)) {
            ContentDiff::AllChanged => diff.mark_region(content.tiles_w(), content.tiles_h()),
            ContentDiff::Tiles(positions) => {
                for (tile_x, tile_y) in positions {
                    diff.mark(tile_x, tile_y);
                }
            }
        }
    }
}

/// Flattens the tiles a [`CanvasDiff`] marks dirty into a target preview
/// layer, instead of re-rendering the whole canvas on every snapshot.
pub struct RenderDriver;

impl RenderDriver {
    /// Resize `target` to the canvas's current dimensions, then
    /// re-composite every tile `diff` marks changed (background +
    /// visible layers bottom-to-top).
    pub fn canvas_state_render(
        new: &CanvasState,
        target: canvas_layer::TransientLayerContent,
        diff: &CanvasDiff,
    ) -> canvas_layer::TransientLayerContent {
        let mut target = if target.width() != new.width() || target.height() != new.height() {
            target.resize_to(new.width(), new.height())
        } else {
            target
        };

        diff.each_pos(|tile_x, tile_y| {
            let mut scratch = TransientTile::new_blank();
            if let Some(background) = new.background() {
                composite_background_tile(&mut scratch, background);
            }
            for (content, props) in new.layers().iter() {
                if !props.visible() {
                    continue;
                }
                content.flatten_tile_to(tile_x, tile_y, &mut scratch, props.opacity(), props.blend_mode());
            }
            let tile = scratch.persist();
            target
                .put_tile(0, tile, tile_x, tile_y, false)
                .expect("tile_x/tile_y come from diff's own bounds");
        });

        target
    }
}

/// The background tile is a flat repeating pattern tiled across the
/// whole canvas; compositing it onto a freshly-blank scratch tile is
/// just a direct pixel copy (Normal-over-transparent reduces to the
/// source).
fn composite_background_tile(scratch: &mut TransientTile, background: &canvas_tile::Tile) {
    if background.is_blank() {
        return;
    }
    for y in 0..TILE_SIZE {
        for x in 0..TILE_SIZE {
            let pixel: Bgra = background.get_pixel(x, y);
            if pixel.is_fully_transparent() {
                continue;
            }
            scratch.set_pixel(x, y, pixel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_layer::TransientLayerContent;
    use canvas_pixel::BlendMode;

    #[test]
    fn diff_of_snapshot_against_itself_has_no_changed_tiles() {
        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(128, 128);
        transient
            .layers_mut()
            .layer_create(1, None, None, false, false, 128, 128, "a")
            .unwrap();
        let state = transient.persist();

        let diff = canvas_state_diff(&state, Some(&state), false);
        assert!(!diff.tiles_changed());
    }

    #[test]
    fn diff_against_absent_old_marks_everything_changed() {
        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(64, 64);
        let state = transient.persist();

        let diff = canvas_state_diff(&state, None, false);
        assert!(diff.tiles_changed());
    }

    #[test]
    fn diff_after_single_tile_edit_marks_only_that_tile() {
        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(128, 128);
        transient
            .layers_mut()
            .layer_create(1, None, None, false, false, 128, 128, "a")
            .unwrap();
        let before = transient.persist();

        let mut transient = before.transient_from();
        transient
            .layers_mut()
            .fill_rect(1, 1, BlendMode::Normal, 0, 0, 4, 4, Bgra { b: 1, g: 1, r: 1, a: 255 })
            .unwrap();
        let after = transient.persist();

        let diff = canvas_state_diff(&after, Some(&before), false);
        let mut changed = Vec::new();
        diff.each_pos(|x, y| changed.push((x, y)));
        assert_eq!(changed, vec![(0, 0)]);
    }

    #[test]
    fn diff_after_resize_marks_all_changed() {
        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(64, 64);
        let before = transient.persist();

        let mut transient = before.transient_from();
        transient.set_dimensions(128, 64);
        let after = transient.persist();

        let diff = canvas_state_diff(&after, Some(&before), false);
        assert!(diff.tiles_changed());
        assert_eq!(diff.xtiles(), 2);
    }

    #[test]
    fn layer_props_changed_reset_reads_then_clears() {
        let mut diff = CanvasDiff::new();
        diff.begin(0, 0, 64, 64, true);
        assert!(diff.layer_props_changed_reset());
        assert!(!diff.layer_props_changed_reset());
    }

    #[test]
    fn render_driver_flattens_only_dirty_tiles_into_target() {
        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(128, 64);
        transient
            .layers_mut()
            .layer_create(1, None, None, false, false, 128, 64, "a")
            .unwrap();
        transient
            .layers_mut()
            .fill_rect(1, 1, BlendMode::Normal, 0, 0, 4, 4, Bgra { b: 0, g: 0, r: 255, a: 255 })
            .unwrap();
        let state = transient.persist();

        let diff = canvas_state_diff(&state, None, false);
        let target = TransientLayerContent::new_blank(0, 0);
        let rendered = RenderDriver::canvas_state_render(&state, target, &diff);
        let image = rendered.persist().to_image();
        assert_eq!(image.get_pixel(0, 0), Bgra { b: 0, g: 0, r: 255, a: 255 });
        assert_eq!(image.get_pixel(100, 40), Bgra::TRANSPARENT);
    }
}
