//! LLM backend selection
//!
//! Backends implement the [`LlmProvider`] trait and are chosen by
//! [`ProviderSelector`], which prefers local kinds, honors the cloud policy
//! and caches availability probes for a bounded time.

pub mod anthropic;
pub mod config;
pub mod ollama;
pub mod on_device;
pub mod openai;
pub mod openai_compat;
mod probe;
pub mod selector;
pub mod types;

pub use config::{CloudSettings, EndpointSettings, OnDeviceSettings, SelectorConfig, mask_secret};
pub use selector::{HttpProviderFactory, ProviderFactory, ProviderSelector};
pub use types::{LlmProvider, ProviderHandle, ProviderKind, ProviderStatus};
