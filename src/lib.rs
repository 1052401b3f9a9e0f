//! Saturn48 — a Saturn-class (HP-48 S/SX/G/GX) calculator core.
//!
//! Emulates the 4-bit Saturn CPU, its six-controller MMU, the device
//! register block with both hardware timers, and the LCD controller,
//! enough to run unmodified calculator ROM and RAM images.  The crate is
//! headless: the host owns the event loop, calls [`Machine::tick`] once
//! per frame with the elapsed wall-clock time, feeds keys in, and blits
//! the RGBA buffer out.  Diagnostics go through the `log` facade; the
//! host binds the sink.
//!
//! ```no_run
//! use std::path::Path;
//! use saturn48::{Machine, Variant};
//!
//! let mut hp = Machine::init(
//!     Path::new("rom"),
//!     Path::new("ram"),
//!     Path::new("hp48"),
//!     Variant::Gx,
//! )?;
//! hp.tick(16.7);
//! if hp.is_display_dirty() {
//!     let (pixels, w, h, _stride) = hp.display_buffer();
//!     // blit w x h RGBA pixels
//!     # let _ = (pixels, w, h);
//!     hp.clear_display_dirty();
//! }
//! # Ok::<(), saturn48::Error>(())
//! ```

pub mod error;
pub mod lcd;
pub mod machine;
pub mod romio;
pub mod saturn;
pub mod snapshot;

pub use error::{Error, Result};
pub use lcd::{DISPLAY_HEIGHT, DISPLAY_WIDTH};
pub use machine::Machine;
pub use saturn::Variant;
