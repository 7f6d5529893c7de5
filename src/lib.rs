//! coap-builder: a draft-ietf-core-coap-09 CoAP message serializer
//!
//! This crate turns an in-memory, structured description of a CoAP message
//! (see [`coap::Message`]) into the exact byte sequence that travels on the
//! wire to a constrained-device endpoint. It does not do any I/O -- there is
//! no socket code here -- and it does not parse; it only builds.
//!
//! Like `jnet`, the crate this one started from, there's no heap allocation
//! anywhere: the caller supplies the destination buffer, sized ahead of time
//! with [`coap::calc_size`].
//!
//! # Examples
//!
//! ```
//! use coap_builder::coap::{self, Code, Config, Message, Type};
//!
//! let message = Message {
//!     version: 1,
//!     ty: Type::Confirmable,
//!     code: Code::from(coap::Method::Get),
//!     message_id: 0x1234,
//!     token: None,
//!     content_type: None,
//!     uri_path: Some(b"temp"),
//!     options: None,
//!     payload: None,
//! };
//!
//! let config = Config::default();
//! let len = coap::calc_size(&message, &config);
//! let mut buf = [0u8; 32];
//! let written = coap::build(&mut buf[..], &message, &config).unwrap();
//! assert_eq!(written, len);
//! assert_eq!(&buf[..written as usize], &[0x41, 0x01, 0x12, 0x34, 0x94, b't', b'e', b'm', b'p']);
//! ```

#![deny(missing_docs)]
#![deny(rust_2018_compatibility)]
#![deny(rust_2018_idioms)]
#![deny(warnings)]
#![no_std]

#[cfg(test)]
#[macro_use]
extern crate pretty_assertions;

#[cfg(any(feature = "std", test))]
extern crate std;

#[macro_use]
mod macros;

mod traits;

// Application layer
pub mod coap;
