//! Reference-counting properties of the handlers, run against every headless
//! backend available.
//!
//! ```bash
//! cargo test --test handler_tests
//! ```

mod common;

use rstest::rstest;

use common::{flat_object, indexed_triangle, textured_quad, TestBackend, TestContext};
use render_environment::backend::dummy::ObjectKind;
use render_environment::resources::{DataBuffer, Descriptor, FrameBuffer, GraphicsObject, Texture};
use render_environment::{HandlerError, RenderError};

// ============================================================================
// Counting
// ============================================================================

/// N handles create one native; N releases destroy it; one more is an
/// over-release.
#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::wgpu(TestBackend::Wgpu)]
fn test_handle_n_times_release_n_times(#[case] backend: TestBackend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let buffer = Descriptor::new(DataBuffer::from_f32(4, &[0.25; 16]).with_label("weights"));

    for _ in 0..3 {
        ctx.renderer.handle_data_buffer(&buffer).unwrap();
    }
    let native = ctx.renderer.data_buffers().get_internal(&buffer).unwrap().buffer;
    assert_eq!(ctx.renderer.data_buffers().count(&buffer), 3);
    assert_eq!(ctx.renderer.data_buffers().len(), 1);

    assert_eq!(ctx.renderer.release_data_buffer(&buffer).unwrap(), 2);
    assert_eq!(ctx.renderer.release_data_buffer(&buffer).unwrap(), 1);
    // Same native for as long as the descriptor is live
    assert_eq!(ctx.renderer.data_buffers().get_internal(&buffer).unwrap().buffer, native);

    assert_eq!(ctx.renderer.release_data_buffer(&buffer).unwrap(), 0);
    assert!(ctx.renderer.data_buffers().get_internal(&buffer).is_none());
    assert!(ctx.reporter.is_empty());

    let error = ctx.renderer.release_data_buffer(&buffer).unwrap_err();
    assert!(matches!(error, RenderError::Handler(HandlerError::OverRelease { .. })));
    assert_eq!(ctx.reporter.len(), 1);
}

/// An over-release of one descriptor leaves the others untouched
#[test]
fn test_over_release_does_not_corrupt_others() {
    let mut ctx = TestContext::dummy();
    let kept = Descriptor::new(DataBuffer::from_f32(1, &[1.0]));
    let never_handled = Descriptor::new(DataBuffer::from_f32(1, &[1.0]));

    ctx.renderer.handle_data_buffer(&kept).unwrap();
    assert!(ctx.renderer.release_data_buffer(&never_handled).is_err());
    assert_eq!(ctx.renderer.data_buffers().count(&kept), 1);
    assert_eq!(ctx.dummy_backend().unwrap().live_count(ObjectKind::Buffer), 1);
}

/// Descriptors with equal content are still distinct resources
#[test]
fn test_identity_not_content() {
    let mut ctx = TestContext::dummy();
    let a = Descriptor::new(DataBuffer::from_f32(1, &[1.0, 2.0]));
    let b = Descriptor::new(DataBuffer::from_f32(1, &[1.0, 2.0]));

    ctx.renderer.handle_data_buffer(&a).unwrap();
    ctx.renderer.handle_data_buffer(&b).unwrap();
    ctx.renderer.handle_data_buffer(&a.clone()).unwrap();

    assert_eq!(ctx.renderer.data_buffers().len(), 2);
    assert_eq!(ctx.renderer.data_buffers().count(&a), 2);
    assert_eq!(ctx.renderer.data_buffers().count(&b), 1);
}

/// Lookups never change counts
#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::wgpu(TestBackend::Wgpu)]
fn test_get_internal_does_not_count(#[case] backend: TestBackend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let (object, index, vertices) = indexed_triangle();
    let unknown = Descriptor::new(GraphicsObject::triangles());

    ctx.renderer.handle_graphics_object(&object).unwrap();
    for _ in 0..5 {
        assert!(ctx.renderer.graphics_objects().get_internal(&object).is_some());
        assert!(ctx.renderer.graphics_objects().get_internal(&unknown).is_none());
        assert!(ctx.renderer.data_buffers().get_internal(&index).is_some());
    }
    assert_eq!(ctx.renderer.graphics_objects().count(&object), 1);
    assert_eq!(ctx.renderer.graphics_objects().count(&unknown), 0);
    assert_eq!(ctx.renderer.data_buffers().count(&vertices), 1);

    assert_eq!(ctx.renderer.release_graphics_object(&object).unwrap(), 0);
    assert!(ctx.renderer.graphics_objects().get_internal(&object).is_none());
}

// ============================================================================
// Dependency propagation
// ============================================================================

/// Handle G (index I, vertices V) twice, then release it twice
#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::wgpu(TestBackend::Wgpu)]
fn test_graphics_object_end_to_end(#[case] backend: TestBackend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let (g, i, v) = indexed_triangle();

    ctx.renderer.handle_graphics_object(&g).unwrap();
    ctx.renderer.handle_graphics_object(&g).unwrap();
    assert_eq!(ctx.renderer.graphics_objects().count(&g), 2);
    assert_eq!(ctx.renderer.data_buffers().count(&i), 2);
    assert_eq!(ctx.renderer.data_buffers().count(&v), 2);

    assert_eq!(ctx.renderer.release_graphics_object(&g).unwrap(), 1);
    assert_eq!(ctx.renderer.data_buffers().count(&i), 1);
    assert_eq!(ctx.renderer.data_buffers().count(&v), 1);
    assert!(ctx.renderer.graphics_objects().get_internal(&g).is_some());
    assert!(ctx.renderer.data_buffers().get_internal(&i).is_some());
    assert!(ctx.renderer.data_buffers().get_internal(&v).is_some());

    assert_eq!(ctx.renderer.release_graphics_object(&g).unwrap(), 0);
    assert!(ctx.renderer.graphics_objects().get_internal(&g).is_none());
    assert!(ctx.renderer.data_buffers().get_internal(&i).is_none());
    assert!(ctx.renderer.data_buffers().get_internal(&v).is_none());
    assert!(ctx.reporter.is_empty());
}

/// Two composites sharing one buffer keep it alive until both are released
#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::wgpu(TestBackend::Wgpu)]
fn test_shared_dependency(#[case] backend: TestBackend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let shared = Descriptor::new(DataBuffer::from_f32(3, &[0.0; 9]).with_label("X"));
    let a = Descriptor::new(GraphicsObject::triangles().with_attribute("position", &shared));
    let b = Descriptor::new(GraphicsObject::triangles().with_attribute("position", &shared));

    ctx.renderer.handle_graphics_object(&a).unwrap();
    ctx.renderer.handle_graphics_object(&b).unwrap();
    let native = ctx.renderer.data_buffers().get_internal(&shared).unwrap().buffer;

    ctx.renderer.release_graphics_object(&a).unwrap();
    assert_eq!(ctx.renderer.data_buffers().count(&shared), 1);
    assert_eq!(ctx.renderer.data_buffers().get_internal(&shared).unwrap().buffer, native);
    assert_eq!(
        ctx.renderer.graphics_objects().get_internal(&b).unwrap().attribute("position").unwrap().buffer,
        native
    );

    ctx.renderer.release_graphics_object(&b).unwrap();
    assert!(ctx.renderer.data_buffers().is_empty());
}

/// Releasing a rendered object walks the whole dependency tree
#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::wgpu(TestBackend::Wgpu)]
fn test_rendered_object_tree(#[case] backend: TestBackend) {
    let Some(mut ctx) = TestContext::new(backend) else {
        return;
    };
    let texture = Descriptor::new(Texture::checkerboard(8, [255, 255, 255, 255], [0, 0, 0, 255]));
    let object = textured_quad(&texture);

    ctx.renderer.handle_rendered_object(&object).unwrap();
    assert_eq!(ctx.renderer.programs().count(&object.program), 1);
    assert_eq!(ctx.renderer.graphics_objects().count(&object.graphics_object), 1);
    assert_eq!(ctx.renderer.textures().count(&texture), 1);
    assert_eq!(ctx.renderer.data_buffers().len(), 3);
    assert!(ctx.reporter.is_empty(), "{:?}", ctx.reporter.reports());

    // A second object sampling the same texture
    let second = textured_quad(&texture);
    ctx.renderer.handle_rendered_object(&second).unwrap();
    assert_eq!(ctx.renderer.textures().count(&texture), 2);

    ctx.renderer.release_rendered_object(&object).unwrap();
    assert!(ctx.renderer.programs().get_internal(&object.program).is_none());
    assert_eq!(ctx.renderer.textures().count(&texture), 1);

    ctx.renderer.release_rendered_object(&second).unwrap();
    assert!(ctx.renderer.textures().is_empty());
    assert!(ctx.renderer.programs().is_empty());
    assert!(ctx.renderer.graphics_objects().is_empty());
    assert!(ctx.renderer.data_buffers().is_empty());
    assert!(ctx.renderer.rendered_objects().is_empty());
}

/// A texture over a frame buffer keeps the frame buffer alive
#[test]
fn test_frame_buffer_texture() {
    let mut ctx = TestContext::dummy();
    let fb = Descriptor::new(FrameBuffer::new(32, 16).with_label("offscreen"));
    let texture = Descriptor::new(Texture::from_frame_buffer(&fb));

    ctx.renderer.handle_texture(&texture).unwrap();
    assert_eq!(ctx.renderer.frame_buffers().count(&fb), 1);
    let native = *ctx.renderer.textures().get_internal(&texture).unwrap();
    let attachment = *ctx.renderer.frame_buffers().get_internal(&fb).unwrap();
    assert!(!native.owned);
    assert_eq!(native.view, attachment.color_view);
    assert_eq!((native.width, native.height), (32, 16));

    ctx.renderer.release_texture(&texture).unwrap();
    assert!(ctx.renderer.frame_buffers().is_empty());
    assert_eq!(ctx.dummy_backend().unwrap().live_count(ObjectKind::Texture), 0);
}

// ============================================================================
// Failures
// ============================================================================

/// A failed creation leaves nothing behind and can be retried
#[test]
fn test_failed_creation_can_be_retried() {
    let mut ctx = TestContext::dummy();
    let (g, i, v) = indexed_triangle();

    // Index buffer succeeds, attribute buffer fails
    ctx.renderer.backend_mut().as_dummy_mut().unwrap().fail_after(1);
    assert!(ctx.renderer.handle_graphics_object(&g).is_err());
    assert_eq!(ctx.renderer.graphics_objects().count(&g), 0);
    assert_eq!(ctx.renderer.data_buffers().count(&i), 0);
    assert_eq!(ctx.renderer.data_buffers().count(&v), 0);
    assert_eq!(ctx.dummy_backend().unwrap().live_count(ObjectKind::Buffer), 0);

    ctx.renderer.handle_graphics_object(&g).unwrap();
    assert_eq!(ctx.renderer.graphics_objects().count(&g), 1);
    assert_eq!(ctx.renderer.data_buffers().count(&i), 1);
}

/// A mapping to a missing attribute is reported and skipped
#[test]
fn test_missing_attribute_is_reported() {
    let mut ctx = TestContext::dummy();
    let (g, _, _) = indexed_triangle();
    let object = flat_object(&g);
    let broken = Descriptor::new(
        render_environment::resources::RenderedObject::new(&object.program, &g)
            .map_attribute("position", "position")
            .map_attribute("normal", "position"),
    );

    ctx.renderer.handle_rendered_object(&broken).unwrap();
    assert_eq!(ctx.reporter.len(), 1);
    assert!(matches!(ctx.reporter.reports()[0], RenderError::MissingDependency { .. }));
    assert!(ctx.renderer.rendered_objects().get_internal(&broken).is_some());
}
