#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod codec;
pub mod zmq_send;

pub use codec::{decode_batch, encode_batch, WireError};
pub use zmq_send::ZmqSender;
