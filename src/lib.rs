//! `netframe` is a small client/server framework for exchanging typed,
//! length-prefixed binary messages over TCP. Each endpoint drives a
//! single-threaded reactor on a dedicated worker thread; fully-assembled
//! messages are handed off onto a thread-safe inbox for the application to
//! drain.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod logging;
pub mod net;
