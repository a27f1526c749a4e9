//! Video surfaces.
//!
//! With the `gstreamer` feature, videos are decoded by a GStreamer pipeline
//! ending in an appsink. Without it every video fails to prepare and the
//! orchestrator skips it like any other broken item.

use crate::surface::{Surface, SurfaceSignal};
use url::Url;

/// Stand-in used when the player is built without video support.
#[derive(Debug, Default)]
pub struct UnsupportedVideoSurface;

impl Surface for UnsupportedVideoSurface {
    fn prepare(&mut self, uri: &Url, signal: SurfaceSignal) {
        tracing::warn!("Cannot play {}: built without video support", uri);
        signal.failed("video playback requires the gstreamer feature");
    }

    fn show(&mut self) {}

    fn hide(&mut self) {}

    fn clear(&mut self) {}
}

#[cfg(feature = "gstreamer")]
pub use self::gst_surface::{GstVideoSurface, VideoFrame};

#[cfg(feature = "gstreamer")]
mod gst_surface {
    use super::*;
    use anyhow::{Context, Result};
    use gstreamer as gst;
    use gstreamer::prelude::*;
    use gstreamer_app as gst_app;
    use gstreamer_video as gst_video;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::thread::JoinHandle;

    /// Latest decoded frame.
    #[derive(Clone)]
    pub struct VideoFrame {
        pub pixels: Vec<u8>,
        pub width: u32,
        pub height: u32,
    }

    /// A running pipeline and the thread watching its bus.
    struct Playback {
        pipeline: gst::Pipeline,
        stop: Arc<AtomicBool>,
        bus_thread: Option<JoinHandle<()>>,
    }

    impl Playback {
        fn shutdown(mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Err(e) = self.pipeline.set_state(gst::State::Null) {
                tracing::warn!("Failed to stop pipeline: {}", e);
            }
            if let Some(thread) = self.bus_thread.take() {
                let _ = thread.join();
            }
        }
    }

    /// Plays a video through `uridecodebin ! videoconvert ! videoscale ! appsink`.
    ///
    /// `prepare` prerolls the pipeline; the surface is ready once the first
    /// frame reaches the sink. Playback starts on `show`.
    pub struct GstVideoSurface {
        name: String,
        playback: Option<Playback>,
        frame: Arc<Mutex<Option<VideoFrame>>>,
        visible: bool,
        paused: bool,
    }

    impl GstVideoSurface {
        /// Initializes GStreamer on first use.
        pub fn new(name: impl Into<String>) -> Result<Self> {
            gst::init().context("Failed to initialize GStreamer")?;
            tracing::debug!("GStreamer initialized: {}", gst::version_string());
            Ok(Self {
                name: name.into(),
                playback: None,
                frame: Arc::new(Mutex::new(None)),
                visible: false,
                paused: false,
            })
        }

        pub fn current_frame(&self) -> Option<VideoFrame> {
            self.frame.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }

        pub fn is_visible(&self) -> bool {
            self.visible
        }

        fn stop(&mut self) {
            if let Some(playback) = self.playback.take() {
                playback.shutdown();
            }
        }

        fn set_state(&self, state: gst::State) {
            if let Some(playback) = &self.playback {
                if let Err(e) = playback.pipeline.set_state(state) {
                    tracing::warn!("{}: failed to set pipeline to {:?}: {}", self.name, state, e);
                }
            }
        }

        fn build(&self, uri: &Url, signal: SurfaceSignal) -> Result<Playback> {
            let pipeline = gst::Pipeline::new();

            let src = gst::ElementFactory::make("uridecodebin")
                .property("uri", uri.as_str())
                .build()
                .context("Failed to create uridecodebin")?;
            let convert = gst::ElementFactory::make("videoconvert")
                .build()
                .context("Failed to create videoconvert")?;
            let scale = gst::ElementFactory::make("videoscale")
                .build()
                .context("Failed to create videoscale")?;
            let appsink = gst_app::AppSink::builder()
                .caps(
                    &gst_video::VideoCapsBuilder::new()
                        .format(gst_video::VideoFormat::Rgba)
                        .build(),
                )
                .build();

            pipeline
                .add_many([&src, &convert, &scale, appsink.upcast_ref()])
                .context("Failed to add elements to pipeline")?;
            gst::Element::link_many([&convert, &scale, appsink.upcast_ref()])
                .context("Failed to link elements")?;

            let convert_weak = convert.downgrade();
            src.connect_pad_added(move |_src, src_pad| {
                let Some(convert) = convert_weak.upgrade() else {
                    return;
                };
                let Some(sink_pad) = convert.static_pad("sink") else {
                    return;
                };
                if sink_pad.is_linked() {
                    return;
                }
                let caps = src_pad.current_caps().unwrap_or_else(|| src_pad.query_caps(None));
                let is_video = caps
                    .structure(0)
                    .map(|s| s.name().starts_with("video/"))
                    .unwrap_or(false);
                if is_video {
                    if let Err(e) = src_pad.link(&sink_pad) {
                        tracing::error!("Failed to link pads: {:?}", e);
                    }
                }
            });

            let announced = Arc::new(AtomicBool::new(false));
            let preroll_frame = self.frame.clone();
            let sample_frame = self.frame.clone();
            let preroll_signal = signal.clone();
            let preroll_announced = announced.clone();

            appsink.set_callbacks(
                gst_app::AppSinkCallbacks::builder()
                    .new_preroll(move |appsink| {
                        let sample = appsink.pull_preroll().map_err(|_| gst::FlowError::Eos)?;
                        store_frame(&sample, &preroll_frame)?;
                        if !preroll_announced.swap(true, Ordering::SeqCst) {
                            preroll_signal.ready();
                        }
                        Ok(gst::FlowSuccess::Ok)
                    })
                    .new_sample(move |appsink| {
                        let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                        store_frame(&sample, &sample_frame)?;
                        Ok(gst::FlowSuccess::Ok)
                    })
                    .build(),
            );

            let bus = pipeline.bus().context("Pipeline has no bus")?;
            let stop = Arc::new(AtomicBool::new(false));
            let thread_stop = stop.clone();
            let name = self.name.clone();
            let bus_thread = std::thread::Builder::new()
                .name(format!("{}-bus", self.name))
                .spawn(move || watch_bus(&name, bus, thread_stop, signal, announced))
                .context("Failed to spawn bus thread")?;

            pipeline
                .set_state(gst::State::Paused)
                .context("Failed to preroll pipeline")?;

            Ok(Playback {
                pipeline,
                stop,
                bus_thread: Some(bus_thread),
            })
        }
    }

    fn store_frame(
        sample: &gst::Sample,
        frame: &Mutex<Option<VideoFrame>>,
    ) -> std::result::Result<(), gst::FlowError> {
        let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
        let caps = sample.caps().ok_or(gst::FlowError::Error)?;
        let info = gst_video::VideoInfo::from_caps(caps).map_err(|_| gst::FlowError::Error)?;
        let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;

        *frame.lock().unwrap_or_else(PoisonError::into_inner) = Some(VideoFrame {
            pixels: map.as_slice().to_vec(),
            width: info.width(),
            height: info.height(),
        });
        Ok(())
    }

    /// Relay end-of-stream and errors until the pipeline is torn down.
    fn watch_bus(
        name: &str,
        bus: gst::Bus,
        stop: Arc<AtomicBool>,
        signal: SurfaceSignal,
        announced: Arc<AtomicBool>,
    ) {
        while !stop.load(Ordering::SeqCst) {
            let Some(msg) = bus.timed_pop(gst::ClockTime::from_mseconds(100)) else {
                continue;
            };
            match msg.view() {
                gst::MessageView::Eos(_) => {
                    tracing::debug!("{}: end of stream", name);
                    signal.ended();
                    return;
                }
                gst::MessageView::Error(err) => {
                    tracing::error!("{}: GStreamer error: {} ({:?})", name, err.error(), err.debug());
                    announced.store(true, Ordering::SeqCst);
                    signal.failed(err.error().to_string());
                    return;
                }
                _ => {}
            }
        }
    }

    impl Surface for GstVideoSurface {
        fn prepare(&mut self, uri: &Url, signal: SurfaceSignal) {
            self.stop();
            *self.frame.lock().unwrap_or_else(PoisonError::into_inner) = None;
            self.paused = false;

            match self.build(uri, signal.clone()) {
                Ok(playback) => self.playback = Some(playback),
                Err(e) => {
                    tracing::warn!("{}: failed to open {}: {:#}", self.name, uri, e);
                    signal.failed(format!("{:#}", e));
                }
            }
        }

        fn show(&mut self) {
            self.visible = true;
            if !self.paused {
                self.set_state(gst::State::Playing);
            }
        }

        fn hide(&mut self) {
            self.visible = false;
            self.set_state(gst::State::Paused);
        }

        fn clear(&mut self) {
            self.stop();
            *self.frame.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }

        fn set_paused(&mut self, paused: bool) {
            self.paused = paused;
            if self.visible {
                self.set_state(if paused {
                    gst::State::Paused
                } else {
                    gst::State::Playing
                });
            }
        }
    }

    impl Drop for GstVideoSurface {
        fn drop(&mut self) {
            self.stop();
        }
    }
}
