// Client façade and the tasks it owns.
#![allow(clippy::module_inception)]
pub mod barrier;
pub mod client;
pub(crate) mod sampler;
pub mod subscription;
pub mod sugar;
