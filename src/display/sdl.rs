//! SDL2 preview window.

use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::capture::encode;
use crate::capture::Frame;
use crate::pipeline::{PipelineHandle, Stimulus};
use crate::DisplayConfig;

const IDLE_POLL: Duration = Duration::from_millis(5);

/// Renders pipeline frames and forwards key presses as stimuli.
///
/// SDL contexts are not `Send`; the window lives on the thread that created it.
pub struct PreviewWindow {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
}

impl PreviewWindow {
    pub fn new(sdl_context: &sdl2::Sdl, config: &DisplayConfig) -> Result<Self> {
        let video_subsystem = sdl_context.video().map_err(|e| eyre!(e))?;

        let window = video_subsystem
            .window("qrscan", config.width, config.height)
            .position_centered()
            .resizable()
            .build()?;

        let canvas = window.into_canvas().present_vsync().build()?;
        let texture_creator = canvas.texture_creator();

        Ok(Self {
            canvas,
            texture_creator,
        })
    }

    pub fn render_frame(&mut self, frame: &Frame) -> Result<()> {
        let rgb = encode::to_rgb(frame)?;
        let (width, height) = rgb.dimensions();

        let mut texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::RGB24, width, height)
            .map_err(|e| eyre!(e))?;
        texture
            .update(None, rgb.as_raw(), (width * 3) as usize)
            .map_err(|e| eyre!(e))?;

        self.canvas.clear();
        self.canvas.copy(&texture, None, None).map_err(|e| eyre!(e))?;
        self.canvas.present();
        Ok(())
    }

    /// Pump events and frames until the pipeline is cancelled. Device switches
    /// are dispatched on `runtime` so the window keeps rendering meanwhile.
    pub fn run(&mut self, sdl_context: &sdl2::Sdl, pipeline: &PipelineHandle, runtime: &Handle) -> Result<()> {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;
        let cancel = pipeline.cancel_token();

        while !cancel.is_cancelled() {
            for event in event_pump.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        keycode: Some(Keycode::Escape),
                        ..
                    } => {
                        info!("Quit event received");
                        pipeline.stop();
                    }
                    Event::TextInput { text, .. } => {
                        for stimulus in text.chars().filter_map(Stimulus::from_key) {
                            self.dispatch(stimulus, pipeline, runtime);
                        }
                    }
                    _ => {}
                }
            }

            match pipeline.next_display_frame() {
                Some(frame) => {
                    let rendered = self.render_frame(&frame);
                    frame.release();
                    if let Err(err) = rendered {
                        debug!("failed to render frame: {err}");
                    }
                }
                None => std::thread::sleep(IDLE_POLL),
            }
        }

        info!("preview window closed");
        Ok(())
    }

    fn dispatch(&self, stimulus: Stimulus, pipeline: &PipelineHandle, runtime: &Handle) {
        match stimulus {
            Stimulus::Stop => pipeline.stop(),
            Stimulus::SelectDevice(_) => {
                let pipeline = pipeline.clone();
                runtime.spawn(async move {
                    if let Err(err) = pipeline.dispatch(stimulus).await {
                        warn!("{err}");
                    }
                });
            }
        }
    }
}
