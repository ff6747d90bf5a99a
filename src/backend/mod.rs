//! Implementations of the hardware interfaces
//!
//! The display core only talks to hardware through the [`DisplayDevice`](crate::hw::DisplayDevice)
//! and [`Blitter`](crate::composer::Blitter) traits. This module provides implementations of
//! them that do not need any driver:
//!
//! - [`virtual_device`]: display hardware and a 2D blitter simulated in memory

pub mod virtual_device;
