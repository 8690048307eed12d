//! Cross-thread scheduling and backend replacement tests.

mod common;

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rstest::rstest;

use common::{flat_object, indexed_triangle, textured_quad, TestBackend, TestContext};
use render_environment::backend::dummy::{DummyBackend, ObjectKind};
use render_environment::command::{self, ActivateFrameBuffer, Draw, Handle, Release, SetUniform};
use render_environment::environment::Origin;
use render_environment::resources::{Descriptor, FrameBuffer, Texture};
use render_environment::{
    geometry, Backend, Command, EnvironmentConfig, RenderError, Renderer, RenderingEnvironment,
};

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, entry: impl Into<String>) -> impl Command + 'static {
    let log = log.clone();
    let entry = entry.into();
    command::from_fn(entry.clone(), move |_: &mut Renderer| {
        log.lock().push(entry.clone());
        Ok(())
    })
}

// ============================================================================
// Ordering
// ============================================================================

/// Tasks from several threads run in enqueue order, before supplier commands
#[test]
fn test_tasks_fifo_across_threads() {
    let mut ctx = TestContext::dummy();
    let env = RenderingEnvironment::new();
    let log: Log = Arc::default();

    let supplied: Arc<dyn Command> = Arc::new(record(&log, "supplier"));
    env.add_command_supplier(move || vec![supplied.clone()]);

    for name in ["T1", "T2", "T3"] {
        let env = env.clone();
        let task = record(&log, name);
        thread::spawn(move || env.add_task(task)).join().unwrap();
    }

    assert_eq!(env.pending_tasks(), 3);
    let report = env.render_frame(&mut ctx.renderer);
    assert_eq!(report.tasks, 3);
    assert_eq!(*log.lock(), ["T1", "T2", "T3", "supplier"]);
}

/// Concurrent producers each keep their own order
#[test]
fn test_concurrent_producers_keep_their_order() {
    let mut ctx = TestContext::dummy();
    let env = RenderingEnvironment::new();
    let log: Log = Arc::default();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let env = env.clone();
            let log = log.clone();
            thread::spawn(move || {
                for i in 0..50 {
                    env.add_task(record(&log, format!("{p}:{i}")));
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert_eq!(env.pending_tasks(), 200);
    env.render_frame(&mut ctx.renderer);
    let log = log.lock();
    assert_eq!(log.len(), 200);
    for p in 0..4 {
        let mine: Vec<usize> = log
            .iter()
            .filter_map(|e| e.strip_prefix(&format!("{p}:")))
            .map(|i| i.parse().unwrap())
            .collect();
        assert_eq!(mine, (0..50).collect::<Vec<_>>());
    }
}

// ============================================================================
// Failures
// ============================================================================

/// Failing tasks and commands are logged with their origin and skipped
#[test]
fn test_failures_continue_the_frame() {
    let mut ctx = TestContext::dummy();
    let env = RenderingEnvironment::new();
    let log: Log = Arc::default();
    let (g, _, _) = indexed_triangle();
    let object = flat_object(&g);

    // Drawing something never handled
    let draw: Arc<dyn Command> = Arc::new(Draw(object.clone()));
    let after: Arc<dyn Command> = Arc::new(record(&log, "after draw"));
    let supplier = env.add_command_supplier(move || vec![draw.clone(), after.clone()]);

    env.add_task(Release::new(&object));
    env.add_task(record(&log, "after release"));

    let report = env.render_frame(&mut ctx.renderer);
    assert!(report.presented);
    assert_eq!(report.failures.len(), 2);
    assert!(matches!(report.failures[0].origin, Origin::Task { .. }));
    assert!(matches!(report.failures[1].origin, Origin::Supplier(id) if id == supplier));
    assert_eq!(*log.lock(), ["after release", "after draw"]);

    // Handled now, the same supplier draws fine
    env.add_task(Handle::new(&object));
    let report = env.render_frame(&mut ctx.renderer);
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(ctx.dummy_backend().unwrap().draws().len(), 1);
}

/// A panicking supplier does not stop the others
#[test]
fn test_panicking_supplier() {
    let mut ctx = TestContext::dummy();
    let env = RenderingEnvironment::new();
    let log: Log = Arc::default();

    env.add_command_supplier(|| -> Vec<Arc<dyn Command>> { panic!("supplier broke") });
    let ok: Arc<dyn Command> = Arc::new(record(&log, "ok"));
    env.add_command_supplier(move || vec![ok.clone()]);

    let report = env.render_frame(&mut ctx.renderer);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
        &report.failures[0].error,
        RenderError::CommandPanicked { message, .. } if message == "supplier broke"
    ));
    assert_eq!(*log.lock(), ["ok"]);
    assert_eq!(ctx.reporter.len(), 1);
}

// ============================================================================
// Render thread
// ============================================================================

/// Work enqueued from the application thread reaches the render thread
#[test]
fn test_render_thread_draws() {
    let env = RenderingEnvironment::new();
    let (frames_tx, frames_rx) = mpsc::channel::<usize>();
    let frames_tx = Mutex::new(frames_tx);

    let object = flat_object(&geometry::quad());
    let thread = env
        .spawn(EnvironmentConfig::default(), |config| {
            Ok(Renderer::from_config(
                Backend::Dummy(DummyBackend::new(config.width, config.height)),
                config,
            ))
        })
        .unwrap();

    env.handle_rendered_object(&object);
    let draw: Arc<dyn Command> = Arc::new(Draw(object.clone()));
    let uniform: Arc<dyn Command> = Arc::new(SetUniform::new(&object, "color", [0.0, 1.0, 0.0, 1.0]));
    let count_draws: Arc<dyn Command> = Arc::new(command::from_fn("count draws", move |r: &mut Renderer| {
        let draws = r.backend().as_dummy().map_or(0, |d| d.draws().len());
        frames_tx.lock().send(draws).ok();
        Ok(())
    }));
    env.add_command_supplier(move || vec![uniform.clone(), draw.clone(), count_draws.clone()]);

    env.trigger_rendering();
    let draws = frames_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(draws, 1);

    env.release_rendered_object(&object);
    thread.join();
    assert_eq!(env.pending_tasks(), 0);
}

// ============================================================================
// Backend replacement
// ============================================================================

/// Every live descriptor survives a backend swap with its count
#[rstest]
#[case::dummy(TestBackend::Dummy)]
#[case::wgpu(TestBackend::Wgpu)]
fn test_replace_backend(#[case] target: TestBackend) {
    let Some(new_backend) = target.create(64, 64) else {
        return;
    };
    let mut ctx = TestContext::dummy();
    let fb = Descriptor::new(FrameBuffer::new(16, 16));
    let offscreen = Descriptor::new(Texture::from_frame_buffer(&fb));
    let textured = textured_quad(&offscreen);
    let (g, i, v) = indexed_triangle();
    let flat = flat_object(&g);
    let gone = flat_object(&geometry::quad());

    ctx.renderer.handle_rendered_object(&textured).unwrap();
    ctx.renderer.handle_rendered_object(&flat).unwrap();
    ctx.renderer.handle_rendered_object(&flat).unwrap();
    ctx.renderer.handle_graphics_object(&g).unwrap();
    ctx.renderer.handle_rendered_object(&gone).unwrap();
    ctx.renderer.release_rendered_object(&gone).unwrap();
    ctx.renderer.set_uniform(&flat, "color", [1.0, 1.0, 0.0, 1.0]).unwrap();

    let old = ctx.renderer.replace_backend(new_backend);
    assert_eq!(old.as_dummy().unwrap().live_count(ObjectKind::Buffer), 0);
    assert_eq!(old.as_dummy().unwrap().live_count(ObjectKind::Texture), 0);

    assert_eq!(ctx.renderer.rendered_objects().count(&textured), 1);
    assert_eq!(ctx.renderer.rendered_objects().count(&flat), 2);
    assert_eq!(ctx.renderer.graphics_objects().count(&g), 3);
    assert_eq!(ctx.renderer.data_buffers().count(&i), 3);
    assert_eq!(ctx.renderer.data_buffers().count(&v), 3);
    assert_eq!(ctx.renderer.textures().count(&offscreen), 1);
    assert_eq!(ctx.renderer.frame_buffers().count(&fb), 1);
    assert!(ctx.renderer.rendered_objects().get_internal(&gone).is_none());
    assert!(ctx.renderer.programs().get_internal(&gone.program).is_none());
    assert_eq!(ctx.renderer.rendered_objects().len(), 2);

    // The texture points at the recreated frame buffer
    let texture = *ctx.renderer.textures().get_internal(&offscreen).unwrap();
    let attachment = *ctx.renderer.frame_buffers().get_internal(&fb).unwrap();
    assert_eq!(texture.view, attachment.color_view);

    // And everything still draws
    ctx.renderer.begin_frame().unwrap();
    ctx.renderer.activate_frame_buffer(Some(&fb)).unwrap();
    ctx.renderer.draw(&flat).unwrap();
    ActivateFrameBuffer(None).execute(&mut ctx.renderer).unwrap();
    ctx.renderer.draw(&textured).unwrap();
    ctx.renderer.end_frame().unwrap();
    assert!(ctx.reporter.is_empty(), "{:?}", ctx.reporter.reports());
}

/// A graphics object that cannot be recreated gives back its buffers
#[test]
fn test_replace_backend_failed_graphics_object() {
    let mut ctx = TestContext::dummy();
    let (g, i, v) = indexed_triangle();
    ctx.renderer.handle_graphics_object(&g).unwrap();

    let mut failing = DummyBackend::new(64, 64);
    failing.fail_next_creation();
    ctx.renderer.replace_backend(Backend::Dummy(failing));

    assert_eq!(ctx.renderer.graphics_objects().count(&g), 0);
    assert_eq!(ctx.renderer.data_buffers().count(&i), 0);
    assert_eq!(ctx.renderer.data_buffers().count(&v), 0);
    assert_eq!(ctx.dummy_backend().unwrap().live_count(ObjectKind::Buffer), 0);
    assert_eq!(ctx.reporter.len(), 2);

    // The object can be handled again from scratch
    ctx.renderer.handle_graphics_object(&g).unwrap();
    assert_eq!(ctx.renderer.data_buffers().count(&v), 1);
    assert_eq!(ctx.renderer.release_graphics_object(&g).unwrap(), 0);
    assert!(ctx.renderer.data_buffers().is_empty());
    assert_eq!(ctx.reporter.len(), 2);
}

/// A rendered object that cannot be recreated gives back its whole tree
#[test]
fn test_replace_backend_failed_rendered_object() {
    let mut ctx = TestContext::dummy();
    let texture = Descriptor::new(Texture::checkerboard(4, [255, 0, 0, 255], [0, 0, 255, 255]));
    let object = textured_quad(&texture);
    let (g, _, v) = indexed_triangle();

    ctx.renderer.handle_rendered_object(&object).unwrap();
    ctx.renderer.handle_rendered_object(&object).unwrap();
    ctx.renderer.handle_graphics_object(&g).unwrap();

    // Creations the dependencies need on a fresh backend
    let mut fresh = TestContext::dummy();
    fresh.renderer.handle_program(&object.program).unwrap();
    fresh.renderer.handle_texture(&texture).unwrap();
    fresh.renderer.handle_graphics_object(&object.graphics_object).unwrap();
    fresh.renderer.handle_graphics_object(&g).unwrap();
    let dependencies = fresh.dummy_backend().unwrap().created_total();

    let mut failing = DummyBackend::new(64, 64);
    failing.fail_after(dependencies);
    ctx.renderer.replace_backend(Backend::Dummy(failing));

    assert_eq!(ctx.renderer.rendered_objects().count(&object), 0);
    assert_eq!(ctx.renderer.programs().count(&object.program), 0);
    assert_eq!(ctx.renderer.graphics_objects().count(&object.graphics_object), 0);
    assert_eq!(ctx.renderer.textures().count(&texture), 0);
    assert_eq!(ctx.reporter.len(), 1);

    // Unrelated descriptors are untouched
    assert_eq!(ctx.renderer.graphics_objects().count(&g), 1);
    assert_eq!(ctx.renderer.data_buffers().count(&v), 1);
    let dummy = ctx.dummy_backend().unwrap();
    assert_eq!(dummy.live_count(ObjectKind::Texture), 0);
    assert_eq!(dummy.live_count(ObjectKind::ShaderModule), 0);
    assert_eq!(dummy.live_count(ObjectKind::Buffer), 2);
}

/// Only one rendering thread may drain an environment at a time
#[test]
fn test_second_render_thread_is_rejected() {
    let env = RenderingEnvironment::new();
    let factory = |config: &EnvironmentConfig| {
        Ok::<_, RenderError>(Renderer::from_config(
            Backend::Dummy(DummyBackend::new(config.width, config.height)),
            config,
        ))
    };

    let first = env.spawn(EnvironmentConfig::default(), factory).unwrap();
    let second = env.spawn(EnvironmentConfig::default(), factory);
    assert!(matches!(second, Err(RenderError::Backend(_))));
    assert!(first.is_running());

    // Free again once the first one is gone
    first.join();
    let third = env.spawn(EnvironmentConfig::default(), factory).unwrap();
    third.join();
}
