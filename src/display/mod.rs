//! Optional live preview.
//!
//! The window only renders frames and turns key presses into
//! [`Stimulus`](crate::Stimulus) values; it never touches capture or detection
//! state directly.

#[cfg(feature = "preview")]
mod sdl;

#[cfg(feature = "preview")]
pub use sdl::PreviewWindow;

/// Whether a preview window can be opened in this build and environment.
pub fn preview_available() -> bool {
    cfg!(feature = "preview") && has_display_server(|key| std::env::var_os(key).is_some())
}

fn has_display_server(is_set: impl Fn(&str) -> bool) -> bool {
    ["DISPLAY", "WAYLAND_DISPLAY"].into_iter().any(is_set)
}
