#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod augment;
pub mod bench;
pub mod dataset;
pub mod decode;
pub mod pipeline;
pub mod sink;
