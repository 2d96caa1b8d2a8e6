// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Suspension primitives: one-shot batons and the promises built on them.

mod baton;
mod promise;

pub use baton::Baton;
pub use promise::{await_promise, Promise};
