pub use core::convert::TryFrom;
