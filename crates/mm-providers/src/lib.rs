//! Provider integration layer: the adapter contract, one adapter per provider
//! family, credential management, and the dispatching client with retry and
//! per-provider concurrency limits.

pub mod adapter;
pub mod anthropic;
pub mod client;
pub mod google;
pub mod keys;
pub mod ollama;
pub mod openai;

pub use adapter::{AdapterError, MockAdapter, ProviderAdapter};
pub use anthropic::AnthropicAdapter;
pub use client::{ApiClientManager, ClientError, RetryPolicy};
pub use google::GoogleAdapter;
pub use keys::{ApiKeyManager, KeyError};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
