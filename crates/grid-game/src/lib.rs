//! Grid Game: a hidden-grid information sharing game over a noisy channel.
//!
//! Four participants each see part of a hidden 2x2 grid of colored shapes and
//! must agree on every cell through short, corrupted messages. This crate
//! supplies the concrete environment, prompts, vLLM transport, experiment
//! runner and result aggregation on top of `quorum-kernel`.

pub mod conversation;
pub mod environment;
pub mod experiment;
pub mod generator;
pub mod report;
pub mod results;
pub mod vllm_client;
