#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like HDMI
#![allow(clippy::upper_case_acronyms)]

//! # hwcomposer: hardware display composition
//!
//! This crate decides how the layers of a frame reach the screen of a set-top box or TV class
//! device: which layers are scanned out by a hardware plane of their own, which ones are merged
//! by a composer, when buffers may be reused and when the screen has to stay blank.
//!
//! ## Structure of the crate
//!
//! - [`hw`] discovers the crtcs, connectors and planes of the display hardware through a
//!   [`DisplayDevice`](hw::DisplayDevice) and hands them out through the
//!   [`HwDisplayManager`](hw::HwDisplayManager)
//! - [`framebuffer`] and [`sync`] describe the buffers of a frame and their fences
//! - [`composer`] merges layers that did not get a plane
//! - [`display`] ties everything together for one connector in a [`HwcDisplay`](display::HwcDisplay)
//! - [`vsync`] paces the frames, [`power`] decides when the screen is blanked
//! - [`system_control`] is the interface to the system service tracking display modes
//! - [`backend`] contains in-memory implementations of the hardware interfaces
//!
//! The manager is an ordinary value, created once by the embedder and shared through an
//! [`Arc`](std::sync::Arc) by all displays.
//!
//! ### Threads
//!
//! Nothing here spawns an event loop. Frames are validated and presented on the embedder's
//! thread, every [`HwcVsync`](vsync::HwcVsync) runs one thread delivering ticks. A
//! [`calloop`] channel can receive them inside an event loop.
//!
//! ### Logging
//!
//! This crate makes extensive use of [`tracing`] for its internal logging. Every display
//! carries a span naming its connector and crtc.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod composer;
pub mod config;
pub mod display;
mod error;
pub mod framebuffer;
pub mod hw;
pub mod power;
pub mod sync;
pub mod system_control;
pub mod utils;
pub mod vsync;

pub use self::error::{Error, Result};
