//! Trajectory accumulation for the collection loop.
//!
//! - `TransitionBuffer`: per-policy, per-environment episode lists that are cut
//!   into fixed-length chunks and can be rolled back episode by episode

pub mod transition_buffer;

pub use transition_buffer::TransitionBuffer;

#[cfg(test)]
mod tests;
