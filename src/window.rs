//! Window management using winit

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use winit::{
    dpi::PhysicalSize,
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    window::{Window as WinitWindow, WindowBuilder},
};

use crate::backend::Extent2d;
use crate::error::{RendererError, RendererResult};
use crate::RendererConfig;

/// Wrapper around a winit window tracking its pixel size and close state
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(event_loop: &EventLoop<()>, title: &str, width: u32, height: u32) -> RendererResult<Self> {
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .build(event_loop)
            .map_err(|e| RendererError::Window(e.to_string()))?;

        // The platform may not honour the requested size
        let size = window.inner_size();
        Ok(Self {
            window: Arc::new(window),
            width: size.width,
            height: size.height,
            resized: false,
            close_requested: false,
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Current size in pixels. Zero while minimized.
    pub fn extent(&self) -> Extent2d {
        Extent2d::new(self.width, self.height)
    }

    /// Check if window was resized since the flag was last cleared
    pub fn was_resized(&self) -> bool {
        self.resized
    }

    pub fn clear_resize_flag(&mut self) {
        self.resized = false;
    }

    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Ask [`run`] to leave the event loop after the current iteration.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Handle window events
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

/// Open a window for `config` and call `callback` once per loop iteration
/// until the window is closed or the callback fails.
pub fn run<F>(config: &RendererConfig, mut callback: F) -> RendererResult<()>
where
    F: FnMut(&mut Window) -> RendererResult<()> + 'static,
{
    let event_loop = EventLoop::new().map_err(|e| RendererError::Window(e.to_string()))?;
    let mut window = Window::new(&event_loop, &config.title, config.width, config.height)?;

    let failure = Rc::new(RefCell::new(None));
    let loop_failure = Rc::clone(&failure);

    event_loop
        .run(move |event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    window.handle_event(&event);

                    if let WindowEvent::CloseRequested = event {
                        elwt.exit();
                    }
                }
                Event::AboutToWait => {
                    if let Err(e) = callback(&mut window) {
                        log::error!("Frame failed: {}", e);
                        *loop_failure.borrow_mut() = Some(e);
                        elwt.exit();
                        return;
                    }
                    if window.should_close() {
                        elwt.exit();
                        return;
                    }
                    window.request_redraw();
                }
                _ => {}
            }
        })
        .map_err(|e| RendererError::Window(e.to_string()))?;

    let failed = failure.borrow_mut().take();
    match failed {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
