//! Integration layer wiring capture, conversation and speech together

pub mod config;
pub mod hooks;
pub mod orchestrator;

pub use config::{BargeInAction, ColloquyConfig};
pub use hooks::{event_channel, ChannelEventHooks, EventHooks, NoopEventHooks, OrchestratorEvent};
pub use orchestrator::{CaptureSink, Orchestrator, OrchestratorBuilder, OrchestratorStatus};
