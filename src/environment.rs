//! Cross-thread scheduling of rendering work
//!
//! Any thread may enqueue tasks or register command suppliers on a
//! [`RenderingEnvironment`]. Only the rendering thread executes them, once
//! per frame, through [`RenderingEnvironment::render_frame`].

use crate::backend::BackendError;
use crate::command::{Command, CommandSupplier, Handle, Release, UpdateDataBuffer, UpdateTexture};
use crate::error::{panic_message, RenderError, RenderResult};
use crate::renderer::Renderer;
use crate::resources::{DataBuffer, Descriptor, FrameBuffer, GraphicsObject, Program, RenderedObject, Texture};
use crate::EnvironmentConfig;
use parking_lot::{Condvar, Mutex};
use std::backtrace::Backtrace;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Identifies a registered command supplier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SupplierId(u64);

impl fmt::Display for SupplierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "supplier #{}", self.0)
    }
}

/// Where a failed command came from
#[derive(Debug)]
pub enum Origin {
    Task {
        location: &'static Location<'static>,
        backtrace: Arc<Backtrace>,
    },
    Supplier(SupplierId),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Task { location, .. } => write!(f, "task enqueued at {location}"),
            Origin::Supplier(id) => write!(f, "{id}"),
        }
    }
}

/// A command that returned an error or panicked
#[derive(Debug)]
pub struct CommandFailure {
    pub command: String,
    pub origin: Origin,
    pub error: RenderError,
}

/// What one call to [`RenderingEnvironment::render_frame`] did
#[derive(Debug, Default)]
pub struct FrameReport {
    pub tasks: usize,
    pub commands: usize,
    pub failures: Vec<CommandFailure>,
    pub presented: bool,
}

struct Task {
    command: Box<dyn Command>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

type WakeHook = Arc<dyn Fn() + Send + Sync>;

/// Which thread is allowed to drain the queue
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Drainer {
    /// Whoever calls `render_frame`
    #[default]
    Unclaimed,
    Thread(ThreadId),
    /// The claiming thread has exited; queued work waits for a new one
    Stopped,
}

#[derive(Default)]
struct Shared {
    drainer: Mutex<Drainer>,
    tasks: Mutex<VecDeque<Task>>,
    suppliers: Mutex<Vec<(SupplierId, Arc<dyn CommandSupplier>)>>,
    next_supplier: AtomicU64,
    requested: Mutex<bool>,
    wake: Condvar,
    wake_hook: Mutex<Option<WakeHook>>,
}

/// Thread-safe front of the rendering thread. Clones share one queue.
#[derive(Clone, Default)]
pub struct RenderingEnvironment {
    shared: Arc<Shared>,
}

impl fmt::Debug for RenderingEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderingEnvironment")
            .field("pending_tasks", &self.pending_tasks())
            .field("suppliers", &self.supplier_count())
            .finish()
    }
}

/// Runs `command`, turning a panic into [`RenderError::CommandPanicked`]
fn execute_guarded(command: &dyn Command, renderer: &mut Renderer) -> RenderResult<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| command.execute(renderer))) {
        Ok(result) => result,
        Err(payload) => Err(RenderError::CommandPanicked {
            command: command.describe(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

impl RenderingEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot command for the next frame
    #[track_caller]
    pub fn add_task(&self, command: impl Command + 'static) {
        self.add_boxed_task(Box::new(command));
    }

    #[track_caller]
    pub fn add_boxed_task(&self, command: Box<dyn Command>) {
        let task = Task {
            command,
            location: Location::caller(),
            backtrace: Arc::new(Backtrace::capture()),
        };
        log::trace!("Task `{}` enqueued at {}", task.command.describe(), task.location);
        if *self.shared.drainer.lock() == Drainer::Stopped {
            log::warn!(
                "Task `{}` enqueued at {} after the rendering thread stopped",
                task.command.describe(),
                task.location
            );
        }
        self.shared.tasks.lock().push_back(task);
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.tasks.lock().len()
    }

    /// Register a per-frame command source; it is queried from the next frame on
    pub fn add_command_supplier(&self, supplier: impl CommandSupplier + 'static) -> SupplierId {
        let id = SupplierId(self.shared.next_supplier.fetch_add(1, Ordering::Relaxed));
        self.shared.suppliers.lock().push((id, Arc::new(supplier)));
        log::debug!("Registered {id}");
        id
    }

    /// Returns false when `id` was not registered
    pub fn remove_command_supplier(&self, id: SupplierId) -> bool {
        let mut suppliers = self.shared.suppliers.lock();
        let before = suppliers.len();
        suppliers.retain(|(registered, _)| *registered != id);
        let removed = suppliers.len() != before;
        if removed {
            log::debug!("Removed {id}");
        }
        removed
    }

    pub fn supplier_count(&self) -> usize {
        self.shared.suppliers.lock().len()
    }

    /// Called by [`trigger_rendering`](Self::trigger_rendering), e.g. to
    /// request a redraw from a window.
    pub fn set_wake_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.shared.wake_hook.lock() = Some(Arc::new(hook));
    }

    /// Request a frame. Never renders on the calling thread.
    pub fn trigger_rendering(&self) {
        *self.shared.requested.lock() = true;
        self.shared.wake.notify_all();

        let hook = self.shared.wake_hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Block until a frame is requested or `timeout` passes. Returns whether a
    /// frame was requested, and consumes the request.
    pub fn wait_for_trigger(&self, timeout: Option<Duration>) -> bool {
        let mut requested = self.shared.requested.lock();
        if !*requested {
            match timeout {
                Some(timeout) => {
                    self.shared.wake.wait_while_for(&mut requested, |r| !*r, timeout);
                }
                None => self.shared.wake.wait_while(&mut requested, |r| !*r),
            }
        }
        std::mem::replace(&mut *requested, false)
    }

    /// Make the calling thread the only one allowed to drain the queue until
    /// [`release_drainer`](Self::release_drainer).
    pub fn claim_drainer(&self) -> RenderResult<()> {
        let mut drainer = self.shared.drainer.lock();
        let current = thread::current().id();
        match *drainer {
            Drainer::Thread(owner) if owner != current => Err(Self::already_claimed(owner)),
            _ => {
                *drainer = Drainer::Thread(current);
                Ok(())
            }
        }
    }

    /// Give up the claim taken by the calling thread. Tasks enqueued
    /// afterwards are logged as waiting for a new drainer.
    pub fn release_drainer(&self) {
        self.unclaim(Drainer::Stopped);
    }

    fn unclaim(&self, next: Drainer) {
        let mut drainer = self.shared.drainer.lock();
        if *drainer == Drainer::Thread(thread::current().id()) {
            *drainer = next;
        }
    }

    fn already_claimed(owner: ThreadId) -> RenderError {
        BackendError::InitializationFailed(format!("rendering environment is already drained by {owner:?}")).into()
    }

    /// False, with an error logged, when another thread holds the claim
    fn may_drain(&self) -> bool {
        match *self.shared.drainer.lock() {
            Drainer::Thread(owner) if owner != thread::current().id() => {
                log::error!("{}; not draining from {:?}", Self::already_claimed(owner), thread::current().id());
                false
            }
            _ => true,
        }
    }

    /// Execute every queued task in FIFO order. Tasks queued meanwhile wait
    /// for the next call.
    pub fn run_tasks(&self, renderer: &mut Renderer, report: &mut FrameReport) {
        if !self.may_drain() {
            return;
        }
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            report.tasks += 1;
            if let Err(error) = execute_guarded(task.command.as_ref(), renderer) {
                let failure = CommandFailure {
                    command: task.command.describe(),
                    origin: Origin::Task {
                        location: task.location,
                        backtrace: task.backtrace,
                    },
                    error,
                };
                Self::log_failure(renderer, &failure);
                report.failures.push(failure);
            }
        }
    }

    fn run_suppliers(&self, renderer: &mut Renderer, report: &mut FrameReport) {
        let suppliers = self.shared.suppliers.lock().clone();
        for (id, supplier) in suppliers {
            let commands = match panic::catch_unwind(AssertUnwindSafe(|| supplier.commands())) {
                Ok(commands) => commands,
                Err(payload) => {
                    let failure = CommandFailure {
                        command: "query".to_string(),
                        origin: Origin::Supplier(id),
                        error: RenderError::CommandPanicked {
                            command: format!("{id}"),
                            message: panic_message(payload.as_ref()),
                        },
                    };
                    Self::log_failure(renderer, &failure);
                    report.failures.push(failure);
                    continue;
                }
            };

            for command in commands {
                report.commands += 1;
                if let Err(error) = execute_guarded(command.as_ref(), renderer) {
                    let failure = CommandFailure {
                        command: command.describe(),
                        origin: Origin::Supplier(id),
                        error,
                    };
                    Self::log_failure(renderer, &failure);
                    report.failures.push(failure);
                }
            }
        }
    }

    fn log_failure(renderer: &Renderer, failure: &CommandFailure) {
        match &failure.origin {
            Origin::Task { backtrace, .. } => log::error!(
                "`{}` ({}) failed: {}\n{backtrace}",
                failure.command,
                failure.origin,
                failure.error
            ),
            Origin::Supplier(_) => log::error!("`{}` ({}) failed: {}", failure.command, failure.origin, failure.error),
        }
        // Panics have not been seen by any handler yet
        if matches!(failure.error, RenderError::CommandPanicked { .. }) {
            renderer.reporter().report(&failure.error);
        }
    }

    /// Render one frame on the calling thread, which must be the rendering
    /// thread: tasks first, then supplier commands, then present.
    ///
    /// When no frame can be acquired the tasks still run and supplier
    /// commands are skipped.
    pub fn render_frame(&self, renderer: &mut Renderer) -> FrameReport {
        let mut report = FrameReport::default();
        if !self.may_drain() {
            return report;
        }
        let frame = renderer.begin_frame();
        if let Err(e) = &frame {
            log::warn!("Skipping frame: {e}");
        }

        self.run_tasks(renderer, &mut report);
        if frame.is_ok() {
            self.run_suppliers(renderer, &mut report);
            match renderer.end_frame() {
                Ok(()) => report.presented = true,
                Err(e) => log::warn!("Frame not presented: {e}"),
            }
        }
        report
    }

    /// Start a rendering thread owning the renderer built by `factory`.
    ///
    /// Returns once the renderer exists, or with the factory's error. Fails
    /// while another thread drains this environment.
    pub fn spawn<F>(&self, config: EnvironmentConfig, factory: F) -> RenderResult<RenderThread>
    where
        F: FnOnce(&EnvironmentConfig) -> RenderResult<Renderer> + Send + 'static,
    {
        let environment = self.clone();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<RenderResult<()>>(1);

        // Held until the new thread is recorded as the drainer
        let mut drainer = self.shared.drainer.lock();
        if let Drainer::Thread(owner) = *drainer {
            return Err(Self::already_claimed(owner));
        }
        let handle = thread::Builder::new()
            .name("render".to_string())
            .spawn(move || {
                let mut renderer = match factory(&config) {
                    Ok(renderer) => renderer,
                    Err(e) => {
                        thread_running.store(false, Ordering::SeqCst);
                        environment.unclaim(Drainer::Unclaimed);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                environment.render_loop(&mut renderer, &config, &thread_running);
                environment.release_drainer();
            })
            .map_err(|e| BackendError::InitializationFailed(format!("cannot spawn render thread: {e}")))?;
        *drainer = Drainer::Thread(handle.thread().id());
        drop(drainer);

        let started = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(BackendError::InitializationFailed("render thread exited early".into()).into()));
        if let Err(e) = started {
            let _ = handle.join();
            return Err(e);
        }

        log::info!("Render thread started");
        Ok(RenderThread {
            environment: self.clone(),
            handle: Some(handle),
            running,
        })
    }

    fn render_loop(&self, renderer: &mut Renderer, config: &EnvironmentConfig, running: &AtomicBool) {
        let mut frames = 0u64;
        while running.load(Ordering::SeqCst) {
            let requested = self.wait_for_trigger(config.frame_interval);
            if !running.load(Ordering::SeqCst) {
                break;
            }
            if requested || config.frame_interval.is_some() {
                let report = self.render_frame(renderer);
                frames += 1;
                if !report.failures.is_empty() {
                    log::warn!("Frame {frames}: {} commands failed", report.failures.len());
                }
            }
        }

        // Releases queued before shutdown still run
        let mut report = FrameReport::default();
        self.run_tasks(renderer, &mut report);
        renderer.release_all();
        log::info!("Render thread stopped after {frames} frames");
    }

    // Convenience enqueue helpers

    #[track_caller]
    pub fn handle_data_buffer(&self, descriptor: &Descriptor<DataBuffer>) {
        self.add_task(Handle::new(descriptor));
    }

    #[track_caller]
    pub fn release_data_buffer(&self, descriptor: &Descriptor<DataBuffer>) {
        self.add_task(Release::new(descriptor));
    }

    #[track_caller]
    pub fn handle_texture(&self, descriptor: &Descriptor<Texture>) {
        self.add_task(Handle::new(descriptor));
    }

    #[track_caller]
    pub fn release_texture(&self, descriptor: &Descriptor<Texture>) {
        self.add_task(Release::new(descriptor));
    }

    #[track_caller]
    pub fn handle_frame_buffer(&self, descriptor: &Descriptor<FrameBuffer>) {
        self.add_task(Handle::new(descriptor));
    }

    #[track_caller]
    pub fn release_frame_buffer(&self, descriptor: &Descriptor<FrameBuffer>) {
        self.add_task(Release::new(descriptor));
    }

    #[track_caller]
    pub fn handle_graphics_object(&self, descriptor: &Descriptor<GraphicsObject>) {
        self.add_task(Handle::new(descriptor));
    }

    #[track_caller]
    pub fn release_graphics_object(&self, descriptor: &Descriptor<GraphicsObject>) {
        self.add_task(Release::new(descriptor));
    }

    #[track_caller]
    pub fn handle_program(&self, descriptor: &Descriptor<Program>) {
        self.add_task(Handle::new(descriptor));
    }

    #[track_caller]
    pub fn release_program(&self, descriptor: &Descriptor<Program>) {
        self.add_task(Release::new(descriptor));
    }

    #[track_caller]
    pub fn handle_rendered_object(&self, descriptor: &Descriptor<RenderedObject>) {
        self.add_task(Handle::new(descriptor));
    }

    #[track_caller]
    pub fn release_rendered_object(&self, descriptor: &Descriptor<RenderedObject>) {
        self.add_task(Release::new(descriptor));
    }

    #[track_caller]
    pub fn update_data_buffer(&self, descriptor: &Descriptor<DataBuffer>) {
        self.add_task(UpdateDataBuffer(descriptor.clone()));
    }

    #[track_caller]
    pub fn update_texture(&self, descriptor: &Descriptor<Texture>) {
        self.add_task(UpdateTexture(descriptor.clone()));
    }
}

/// Handle to a running rendering thread
pub struct RenderThread {
    environment: RenderingEnvironment,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl RenderThread {
    pub fn environment(&self) -> &RenderingEnvironment {
        &self.environment
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the thread to stop after its current frame
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.environment.trigger_rendering();
    }

    /// Stop the thread and wait until it has released everything
    pub fn join(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Render thread panicked");
            }
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::backend::Backend;
    use crate::command::from_fn;
    use crate::error::CollectingReporter;

    fn renderer() -> (Renderer, Arc<CollectingReporter>) {
        let reporter = Arc::new(CollectingReporter::new());
        let renderer = Renderer::new(Backend::Dummy(DummyBackend::new(8, 8))).with_reporter(reporter.clone());
        (renderer, reporter)
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, entry: &str) -> impl Command + 'static {
        let log = log.clone();
        let entry = entry.to_string();
        from_fn(entry.clone(), move |_: &mut Renderer| {
            log.lock().push(entry.clone());
            Ok(())
        })
    }

    #[test]
    fn test_tasks_before_supplier_commands() {
        let (mut renderer, _) = renderer();
        let env = RenderingEnvironment::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = recorder(&log, "s1");
        let second = recorder(&log, "s2");
        let first: Arc<dyn Command> = Arc::new(first);
        let second: Arc<dyn Command> = Arc::new(second);
        env.add_command_supplier(move || vec![first.clone()]);
        env.add_command_supplier(move || vec![second.clone()]);
        env.add_task(recorder(&log, "t1"));
        env.add_task(recorder(&log, "t2"));

        let report = env.render_frame(&mut renderer);
        assert_eq!((report.tasks, report.commands), (2, 2));
        assert!(report.presented);
        assert_eq!(*log.lock(), ["t1", "t2", "s1", "s2"]);

        // Suppliers run every frame, tasks once
        let report = env.render_frame(&mut renderer);
        assert_eq!((report.tasks, report.commands), (0, 2));
    }

    #[test]
    fn test_failures_do_not_stop_the_drain() {
        let (mut renderer, reporter) = renderer();
        let env = RenderingEnvironment::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        env.add_task(from_fn("boom", |_: &mut Renderer| panic!("boom")));
        env.add_task(from_fn("fails", |_: &mut Renderer| Err(RenderError::NoActiveFrame)));
        env.add_task(recorder(&log, "after"));

        let report = env.render_frame(&mut renderer);
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(
            &report.failures[0].error,
            RenderError::CommandPanicked { message, .. } if message == "boom"
        ));
        match &report.failures[1].origin {
            Origin::Task { location, .. } => assert_eq!(location.file(), file!()),
            Origin::Supplier(_) => panic!("task failure attributed to a supplier"),
        }
        assert_eq!(*log.lock(), ["after"]);
        // Only the panic reaches the reporter
        assert_eq!(reporter.len(), 1);
    }

    #[test]
    fn test_claimed_environment_is_drained_by_its_owner_only() {
        let env = RenderingEnvironment::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        env.claim_drainer().unwrap();
        env.add_task(recorder(&log, "t"));

        let other = env.clone();
        let (report, claimed) = thread::spawn(move || {
            let (mut renderer, _) = renderer();
            (other.render_frame(&mut renderer), other.claim_drainer().is_ok())
        })
        .join()
        .unwrap();
        assert_eq!(report.tasks, 0);
        assert!(!report.presented);
        assert!(!claimed);
        assert_eq!(env.pending_tasks(), 1);

        let (mut renderer, _) = renderer();
        assert_eq!(env.render_frame(&mut renderer).tasks, 1);
        assert_eq!(*log.lock(), ["t"]);
    }

    #[test]
    fn test_released_claim_can_be_taken_again() {
        let env = RenderingEnvironment::new();
        env.claim_drainer().unwrap();
        // Claiming twice from the same thread is fine
        env.claim_drainer().unwrap();
        env.release_drainer();
        assert_eq!(*env.shared.drainer.lock(), Drainer::Stopped);

        // Still queued, waiting for the next drainer
        env.add_task(from_fn("late", |_: &mut Renderer| Ok(())));
        assert_eq!(env.pending_tasks(), 1);

        let other = env.clone();
        assert!(thread::spawn(move || other.claim_drainer().is_ok()).join().unwrap());
        assert!(matches!(*env.shared.drainer.lock(), Drainer::Thread(_)));
    }

    #[test]
    fn test_removed_supplier_is_not_queried() {
        let (mut renderer, _) = renderer();
        let env = RenderingEnvironment::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let command: Arc<dyn Command> = Arc::new(recorder(&log, "s"));

        let id = env.add_command_supplier(move || vec![command.clone()]);
        env.render_frame(&mut renderer);
        assert!(env.remove_command_supplier(id));
        assert!(!env.remove_command_supplier(id));
        env.render_frame(&mut renderer);
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_tasks_queued_during_drain_wait() {
        let (mut renderer, _) = renderer();
        let env = RenderingEnvironment::new();
        let inner = env.clone();
        let log = Arc::new(Mutex::new(Vec::new()));
        let late = log.clone();

        env.add_task(from_fn("enqueue", move |_: &mut Renderer| {
            inner.add_task(recorder(&late, "late"));
            Ok(())
        }));
        assert_eq!(env.render_frame(&mut renderer).tasks, 1);
        assert!(log.lock().is_empty());
        assert_eq!(env.pending_tasks(), 1);
        assert_eq!(env.render_frame(&mut renderer).tasks, 1);
        assert_eq!(*log.lock(), ["late"]);
    }

    #[test]
    fn test_trigger_wakes_and_calls_hook() {
        let env = RenderingEnvironment::new();
        let woken = Arc::new(AtomicBool::new(false));
        let flag = woken.clone();
        env.set_wake_hook(move || flag.store(true, Ordering::SeqCst));

        assert!(!env.wait_for_trigger(Some(Duration::from_millis(1))));
        env.trigger_rendering();
        assert!(woken.load(Ordering::SeqCst));
        assert!(env.wait_for_trigger(None));
        assert!(!env.wait_for_trigger(Some(Duration::from_millis(1))));
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let env = RenderingEnvironment::new();
        let buffer = Descriptor::new(DataBuffer::from_f32(1, &[1.0, 2.0, 3.0]));
        let thread = env
            .spawn(EnvironmentConfig::default(), |_| {
                Ok(Renderer::new(Backend::Dummy(DummyBackend::new(8, 8))))
            })
            .unwrap();
        assert!(thread.is_running());

        env.handle_data_buffer(&buffer);
        env.trigger_rendering();
        thread.join();
        assert_eq!(env.pending_tasks(), 0);
    }

    #[test]
    fn test_spawn_reports_factory_error() {
        let env = RenderingEnvironment::new();
        let result = env.spawn(EnvironmentConfig::default(), |_| Err(RenderError::NoActiveFrame));
        assert!(matches!(result, Err(RenderError::NoActiveFrame)));
    }
}
