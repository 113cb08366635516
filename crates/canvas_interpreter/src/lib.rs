//! `handle`: the single entry point that turns one decoded [`Message`]
//! plus a prior [`CanvasState`] into the next [`CanvasState`], or a
//! [`CanvasError`] if the message cannot be applied. Never mutates the
//! snapshot it was handed — on failure the caller still holds the
//! original, untouched state.

use canvas_error::CanvasError;
use canvas_image::{Image, ImageTransform, Quad};
use canvas_message::{parse_blend_mode, DrawContext, DrawDabs, Message, TilePayload};
use canvas_pixel::Bgra;
use canvas_state::{solid_color_tile, CanvasState};
use canvas_tile::Tile;
use canvas_traits::ImageCodec;

/// The two collaborators a command may need to decode or rasterize a
/// payload. Bundled together rather than threaded as two loose
/// parameters, since every message that needs one tends to need both
/// (an indirect region move masks with a monochrome codec payload and
/// rasterizes through a transform in the same call).
pub struct Collaborators<'a> {
    pub codec: &'a dyn ImageCodec,
    pub transform: &'a dyn ImageTransform,
}

/// Apply one message to `state`, using `context` for scratch resources
/// and `collaborators` for decode/rasterize operations outside this
/// crate's scope. Returns the next snapshot, or the error the message
/// failed with — `state` itself is never touched.
pub fn handle(
    state: &CanvasState,
    context: &mut DrawContext,
    collaborators: &Collaborators,
    message: Message,
) -> Result<CanvasState, CanvasError> {
    match message {
        Message::CanvasResize { top, right, bottom, left } => {
            handle_canvas_resize(state, top, right, bottom, left)
        }
        Message::LayerCreate { layer_id, source_id, fill_color, insert, copy, title } => {
            let mut transient = state.transient_from();
            let fill_tile = solid_color_tile(0, fill_color);
            transient.layers_mut().layer_create(
                layer_id,
                source_id,
                fill_tile,
                insert,
                copy,
                transient.width(),
                transient.height(),
                title,
            )?;
            Ok(transient.persist())
        }
        Message::LayerAttr { layer_id, sublayer_id, opacity, blend_mode, censored, fixed } => {
            let blend_mode = parse_blend_mode(blend_mode)?;
            let mut transient = state.transient_from();
            transient
                .layers_mut()
                .layer_attr(layer_id, sublayer_id, opacity, blend_mode, censored, fixed)?;
            Ok(transient.persist())
        }
        Message::LayerOrder { layer_ids } => {
            let mut transient = state.transient_from();
            transient.layers_mut().layer_reorder(&layer_ids)?;
            Ok(transient.persist())
        }
        Message::LayerRetitle { layer_id, title } => {
            let mut transient = state.transient_from();
            transient.layers_mut().layer_retitle(layer_id, title)?;
            Ok(transient.persist())
        }
        Message::LayerVisibility { layer_id, visible } => {
            let mut transient = state.transient_from();
            transient.layers_mut().layer_visibility(layer_id, visible)?;
            Ok(transient.persist())
        }
        Message::LayerDelete { context_id, layer_id, merge } => {
            let mut transient = state.transient_from();
            transient.layers_mut().layer_delete(context_id, layer_id, merge)?;
            Ok(transient.persist())
        }
        Message::PutImage { context_id, layer_id, blend_mode, x, y, width, height, compressed_bytes } => {
            let blend_mode = parse_blend_mode(blend_mode)?;
            let image = Image::from_compressed(width, height, &compressed_bytes, collaborators.codec)?;
            let mut transient = state.transient_from();
            transient.layers_mut().put_image(layer_id, context_id, blend_mode, x, y, &image)?;
            Ok(transient.persist())
        }
        Message::FillRect { context_id, layer_id, blend_mode, x, y, width, height, color } => {
            handle_fill_rect(state, context_id, layer_id, blend_mode, x, y, width, height, color)
        }
        Message::RegionMove { context_id, layer_id, src_x, src_y, src_width, src_height, dst_quad, mask_bytes } => {
            handle_region_move(
                state,
                context,
                collaborators,
                context_id,
                layer_id,
                src_x,
                src_y,
                src_width,
                src_height,
                dst_quad,
                mask_bytes,
            )
        }
        Message::PutTile { context_id, layer_id, sublayer_id, tile_x, tile_y, repeat, payload } => {
            let tile = build_tile(context_id, payload, collaborators.codec)?;
            let mut transient = state.transient_from();
            transient
                .layers_mut()
                .put_tile(layer_id, sublayer_id, context_id, tile, tile_x, tile_y, repeat)?;
            Ok(transient.persist())
        }
        Message::CanvasBackground { context_id, payload } => {
            let tile = build_tile(context_id, payload, collaborators.codec)?;
            let mut transient = state.transient_from();
            transient.set_background(Some(tile));
            Ok(transient.persist())
        }
        Message::PenUp { context_id } => handle_penup(state, context_id),
        Message::DrawDabsClassic(dabs) | Message::DrawDabsPixel(dabs) | Message::DrawDabsPixelSquare(dabs) => {
            handle_draw_dabs(state, dabs)
        }
        Message::Unknown { kind } => Err(CanvasError::unknown_message(kind)),
    }
}

fn handle_canvas_resize(
    state: &CanvasState,
    top: i32,
    right: i32,
    bottom: i32,
    left: i32,
) -> Result<CanvasState, CanvasError> {
    let new_width = state.width() as i64 + left as i64 + right as i64;
    let new_height = state.height() as i64 + top as i64 + bottom as i64;
    if new_width < 1 || new_height < 1 {
        return Err(CanvasError::invalid_argument(format!(
            "canvas_resize: resulting dimensions {new_width}x{new_height} must be at least 1x1"
        )));
    }
    let (width, height) = CanvasState::validate_dimensions(new_width, new_height)?;

    let mut transient = state.transient_from();
    transient.layers_mut().resize_all(0, top, right, bottom, left);
    transient.set_dimensions(width, height);
    Ok(transient.persist())
}

#[allow(clippy::too_many_arguments)]
fn handle_fill_rect(
    state: &CanvasState,
    context_id: u32,
    layer_id: u32,
    blend_mode: u8,
    x: i32,
    y: i32,
    width: u16,
    height: u16,
    color: Bgra,
) -> Result<CanvasState, CanvasError> {
    let blend_mode = parse_blend_mode(blend_mode)?;
    let canvas_w = state.width() as i64;
    let canvas_h = state.height() as i64;

    let left = (x as i64).max(0);
    let top = (y as i64).max(0);
    let right = (x as i64 + width as i64).min(canvas_w);
    let bottom = (y as i64 + height as i64).min(canvas_h);
    if left >= right || top >= bottom {
        return Err(CanvasError::invalid_argument("fill_rect: effective rectangle is empty"));
    }

    let mut transient = state.transient_from();
    transient.layers_mut().fill_rect(
        layer_id,
        context_id,
        blend_mode,
        left as i32,
        top as i32,
        right as i32,
        bottom as i32,
        color,
    )?;
    Ok(transient.persist())
}

#[allow(clippy::too_many_arguments)]
fn handle_region_move(
    state: &CanvasState,
    context: &mut DrawContext,
    collaborators: &Collaborators,
    context_id: u32,
    layer_id: u32,
    src_x: i64,
    src_y: i64,
    src_width: u16,
    src_height: u16,
    dst_quad: Quad,
    mask_bytes: Option<Vec<u8>>,
) -> Result<CanvasState, CanvasError> {
    let canvas_w = state.width() as i64;
    let canvas_h = state.height() as i64;
    let max_area = (canvas_w + 1) * (canvas_h + 1);
    if dst_quad.bounding_area() > max_area {
        return Err(CanvasError::invalid_argument(
            "region_move: destination quad exceeds the canvas's area bound",
        ));
    }

    // The scratch pool backs whatever the transform collaborator needs
    // while it rasterizes; reserving here up front surfaces exhaustion
    // before any layer content is touched.
    let (_, _, bound_w, bound_h) = dst_quad.bounding_rect();
    context
        .rasterizer_pool
        .reserve(bound_w.max(0) as usize * bound_h.max(0) as usize * 4)?;

    let mask = match mask_bytes {
        Some(bytes) => Some(Image::from_compressed_monochrome(
            src_width,
            src_height,
            &bytes,
            collaborators.codec,
        )?),
        None => None,
    };

    let mut transient = state.transient_from();
    transient.layers_mut().region_move(
        layer_id,
        context_id,
        src_x,
        src_y,
        src_width,
        src_height,
        dst_quad,
        mask.as_ref(),
        collaborators.transform,
    )?;
    Ok(transient.persist())
}

fn build_tile(
    context_id: u32,
    payload: TilePayload,
    codec: &dyn ImageCodec,
) -> Result<Tile, CanvasError> {
    match payload {
        TilePayload::SolidColor(color) => Ok(Tile::from_solid_color(context_id, color)),
        TilePayload::Compressed(bytes) => Tile::from_compressed(context_id, &bytes, codec),
    }
}

fn handle_penup(state: &CanvasState, context_id: u32) -> Result<CanvasState, CanvasError> {
    if !state.layers().any_sublayer_with_id(context_id) {
        return Ok(state.clone());
    }
    let mut transient = state.transient_from();
    transient.layers_mut().penup_merge(context_id);
    Ok(transient.persist())
}

fn handle_draw_dabs(state: &CanvasState, dabs: DrawDabs) -> Result<CanvasState, CanvasError> {
    if dabs.stamps.is_empty() {
        return Ok(state.clone());
    }
    let blend_mode = parse_blend_mode(dabs.blend_mode)?;
    let mut transient = state.transient_from();
    transient.layers_mut().draw_dabs(
        dabs.layer_id,
        dabs.context_id,
        dabs.color,
        blend_mode,
        dabs.indirect,
        &dabs.stamps,
    )?;
    Ok(transient.persist())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_codec::{PerspectiveRasterizer, ZlibCodec};
    use canvas_image::PositionedImage;
    use canvas_traits::ImageCodec as _;

    fn collaborators(codec: &ZlibCodec, transform: &PerspectiveRasterizer) -> Collaborators<'_> {
        Collaborators { codec, transform }
    }

    fn apply(
        state: &CanvasState,
        context: &mut DrawContext,
        codec: &ZlibCodec,
        transform: &PerspectiveRasterizer,
        message: Message,
    ) -> Result<CanvasState, CanvasError> {
        let collaborators = collaborators(codec, transform);
        handle(state, context, &collaborators, message)
    }

    #[test]
    fn empty_canvas_resize_then_layer_create_then_fill_rect() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();
        let state = CanvasState::empty();

        let state = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::CanvasResize { top: 0, right: 8, bottom: 8, left: 0 },
        )
        .unwrap();
        assert_eq!((state.width(), state.height()), (8, 8));

        let state = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::LayerCreate {
                layer_id: 1,
                source_id: None,
                fill_color: None,
                insert: false,
                copy: false,
                title: "base".to_string(),
            },
        )
        .unwrap();
        assert_eq!(state.layers().len(), 1);

        let state = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::FillRect {
                context_id: 1,
                layer_id: 1,
                blend_mode: 0,
                x: 0,
                y: 0,
                width: 4,
                height: 4,
                color: Bgra { b: 0, g: 0, r: 255, a: 255 },
            },
        )
        .unwrap();

        let image = state.to_image(false);
        assert_eq!(image.get_pixel(0, 0), Bgra { b: 0, g: 0, r: 255, a: 255 });
        assert_eq!(image.get_pixel(7, 7), Bgra::TRANSPARENT);
    }

    #[test]
    fn put_tile_then_draw_dabs_indirect_then_penup_merges() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();

        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(64, 64);
        transient
            .layers_mut()
            .layer_create(1, None, None, false, false, 64, 64, "a")
            .unwrap();
        let state = transient.persist();

        let mut stamp_image = Image::new(4, 4);
        for y in 0..4i64 {
            for x in 0..4i64 {
                stamp_image.set_pixel(x, y, Bgra { b: 0, g: 0, r: 255, a: 255 });
            }
        }
        let stamp = PositionedImage { image: stamp_image, left: 0, top: 0 };

        let state = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::DrawDabsClassic(DrawDabs {
                context_id: 7,
                layer_id: 1,
                color: Bgra { b: 0, g: 0, r: 255, a: 0x80 },
                blend_mode: 0,
                indirect: true,
                stamps: vec![stamp],
            }),
        )
        .unwrap();
        assert!(state.layers().any_sublayer_with_id(7));

        let state = apply(&state, &mut context, &codec, &transform, Message::PenUp { context_id: 7 }).unwrap();
        assert!(!state.layers().any_sublayer_with_id(7));
        let (content, _) = state.layers().get(1).unwrap();
        assert_eq!(content.get_pixel(0, 0), Bgra { b: 0, g: 0, r: 255, a: 128 });
    }

    #[test]
    fn penup_with_no_matching_sublayer_returns_identical_snapshot() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();

        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(8, 8);
        let state = transient.persist();

        let next = apply(&state, &mut context, &codec, &transform, Message::PenUp { context_id: 99 }).unwrap();
        assert!(next.background_ptr_eq(&state));
        assert_eq!(next.layers().len(), state.layers().len());
    }

    #[test]
    fn draw_dabs_with_no_stamps_is_a_no_op() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();

        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(8, 8);
        transient.layers_mut().layer_create(1, None, None, false, false, 8, 8, "a").unwrap();
        let state = transient.persist();

        let next = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::DrawDabsClassic(DrawDabs {
                context_id: 1,
                layer_id: 1,
                color: Bgra { b: 0, g: 0, r: 0, a: 255 },
                blend_mode: 0,
                indirect: false,
                stamps: Vec::new(),
            }),
        )
        .unwrap();
        assert!(next.layers().get(1).unwrap().0.get_pixel(0, 0).is_fully_transparent());
    }

    #[test]
    fn fill_rect_fully_outside_canvas_is_invalid_argument() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();

        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(8, 8);
        transient.layers_mut().layer_create(1, None, None, false, false, 8, 8, "a").unwrap();
        let state = transient.persist();

        let error = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::FillRect {
                context_id: 1,
                layer_id: 1,
                blend_mode: 0,
                x: 20,
                y: 20,
                width: 4,
                height: 4,
                color: Bgra { b: 1, g: 1, r: 1, a: 255 },
            },
        )
        .unwrap_err();
        assert!(matches!(error, CanvasError::InvalidArgument(_)));
    }

    #[test]
    fn region_move_destination_quad_over_area_bound_is_rejected() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();

        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(4, 4);
        transient.layers_mut().layer_create(1, None, None, false, false, 4, 4, "a").unwrap();
        let state = transient.persist();

        let huge_quad = Quad {
            points: [(0.0, 0.0), (1000.0, 0.0), (1000.0, 1000.0), (0.0, 1000.0)],
        };
        let error = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::RegionMove {
                context_id: 1,
                layer_id: 1,
                src_x: 0,
                src_y: 0,
                src_width: 4,
                src_height: 4,
                dst_quad: huge_quad,
                mask_bytes: None,
            },
        )
        .unwrap_err();
        assert!(matches!(error, CanvasError::InvalidArgument(_)));
    }

    #[test]
    fn region_move_translates_pixels_by_an_axis_aligned_quad() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();

        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(8, 8);
        transient.layers_mut().layer_create(1, None, None, false, false, 8, 8, "a").unwrap();
        transient
            .layers_mut()
            .fill_rect(1, 1, canvas_pixel::BlendMode::Normal, 0, 0, 2, 2, Bgra { b: 0, g: 0, r: 255, a: 255 })
            .unwrap();
        let state = transient.persist();

        let dst_quad = Quad {
            points: [(4.0, 4.0), (6.0, 4.0), (6.0, 6.0), (4.0, 6.0)],
        };
        let state = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::RegionMove {
                context_id: 1,
                layer_id: 1,
                src_x: 0,
                src_y: 0,
                src_width: 2,
                src_height: 2,
                dst_quad,
                mask_bytes: None,
            },
        )
        .unwrap();

        let (content, _) = state.layers().get(1).unwrap();
        assert_eq!(content.get_pixel(0, 0), Bgra::TRANSPARENT);
        assert_eq!(content.get_pixel(4, 4), Bgra { b: 0, g: 0, r: 255, a: 255 });
    }

    #[test]
    fn put_tile_and_canvas_background_round_trip_through_a_real_codec() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();

        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(64, 64);
        transient.layers_mut().layer_create(1, None, None, false, false, 64, 64, "a").unwrap();
        let state = transient.persist();

        let solid = canvas_tile::Tile::from_solid_color(1, Bgra { b: 7, g: 7, r: 7, a: 255 });
        let compressed = solid.to_compressed(&codec);

        let state = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::PutTile {
                context_id: 1,
                layer_id: 1,
                sublayer_id: 0,
                tile_x: 0,
                tile_y: 0,
                repeat: false,
                payload: TilePayload::Compressed(compressed.clone()),
            },
        )
        .unwrap();
        let (content, _) = state.layers().get(1).unwrap();
        assert_eq!(content.get_pixel(0, 0), Bgra { b: 7, g: 7, r: 7, a: 255 });

        let state = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::CanvasBackground { context_id: 0, payload: TilePayload::Compressed(compressed) },
        )
        .unwrap();
        assert!(state.background().is_some());
        assert_eq!(state.background().unwrap().get_pixel(0, 0), Bgra { b: 7, g: 7, r: 7, a: 255 });
    }

    #[test]
    fn layer_create_then_delete_without_merge_restores_prior_layer_list() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();

        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(8, 8);
        transient.layers_mut().layer_create(1, None, None, false, false, 8, 8, "a").unwrap();
        let before = transient.persist();

        let after = apply(
            &before,
            &mut context,
            &codec,
            &transform,
            Message::LayerCreate {
                layer_id: 2,
                source_id: None,
                fill_color: None,
                insert: false,
                copy: false,
                title: "b".to_string(),
            },
        )
        .unwrap();
        let after = apply(
            &after,
            &mut context,
            &codec,
            &transform,
            Message::LayerDelete { context_id: 0, layer_id: 2, merge: false },
        )
        .unwrap();

        let before_ids: Vec<u32> = before.layers().iter().map(|(_, props)| props.layer_id()).collect();
        let after_ids: Vec<u32> = after.layers().iter().map(|(_, props)| props.layer_id()).collect();
        assert_eq!(before_ids, after_ids);
    }

    #[test]
    fn canvas_resize_then_its_inverse_restores_dimensions_and_background() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();

        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(8, 8);
        transient.set_background(Some(canvas_tile::Tile::from_solid_color(
            0,
            Bgra { b: 5, g: 5, r: 5, a: 255 },
        )));
        let state = transient.persist();

        let grown = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::CanvasResize { top: 2, right: 2, bottom: 2, left: 2 },
        )
        .unwrap();
        assert_eq!((grown.width(), grown.height()), (12, 12));

        let restored = apply(
            &grown,
            &mut context,
            &codec,
            &transform,
            Message::CanvasResize { top: -2, right: -2, bottom: -2, left: -2 },
        )
        .unwrap();
        assert_eq!((restored.width(), restored.height()), (8, 8));
        assert!(restored.background_ptr_eq(&state));
    }

    #[test]
    fn canvas_resize_to_zero_width_or_height_is_invalid_argument() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();

        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(8, 8);
        let state = transient.persist();

        let error = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::CanvasResize { top: 0, right: -8, bottom: 0, left: 0 },
        )
        .unwrap_err();
        assert!(matches!(error, CanvasError::InvalidArgument(_)));
        assert_eq!((state.width(), state.height()), (8, 8));
    }

    #[test]
    fn unknown_message_is_rejected() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();
        let state = CanvasState::empty();

        let error = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::Unknown { kind: "future-extension".to_string() },
        )
        .unwrap_err();
        assert!(matches!(error, CanvasError::UnknownMessage(_)));
    }

    #[test]
    fn decode_error_from_codec_propagates_without_mutating_state() {
        let codec = ZlibCodec;
        let transform = PerspectiveRasterizer::default();
        let mut context = DrawContext::default();

        let mut transient = CanvasState::empty().transient_from();
        transient.set_dimensions(8, 8);
        transient.layers_mut().layer_create(1, None, None, false, false, 8, 8, "a").unwrap();
        let state = transient.persist();

        let garbage = codec.deflate(&[1, 2, 3]);
        let error = apply(
            &state,
            &mut context,
            &codec,
            &transform,
            Message::PutImage {
                context_id: 1,
                layer_id: 1,
                blend_mode: 0,
                x: 0,
                y: 0,
                width: 4,
                height: 4,
                compressed_bytes: garbage,
            },
        )
        .unwrap_err();
        assert!(matches!(error, CanvasError::DecodeError(_)));
        assert_eq!(state.layers().len(), 1);
    }
}
