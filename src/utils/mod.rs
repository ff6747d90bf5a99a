//! Various utilities functions and types

mod bits_map;
mod clock;
mod geometry;

pub use self::bits_map::BitsMap;
pub use self::clock::{Clock, ClockSource, Monotonic, Time};
pub use self::geometry::{Buffer, Coordinate, Physical, Point, Raw, Rectangle, Size, Transform};
