//! Provider adapter module.
//!
//! Providers perform the actual side effects. The engine only sees the
//! [`ResourceProvider`] trait; adapters are picked per resource type by the
//! [`ProviderRegistry`].

mod adapter;
mod http;
mod memory;
mod registry;

pub use adapter::{
    Attributes, CreateOutcome, ProviderOperation, ProviderResult, ResourceProvider,
};
#[cfg(test)]
pub use adapter::MockResourceProvider;
pub use http::HttpProvider;
pub use memory::{MemoryProvider, ProviderCall, StoredResource};
pub use registry::ProviderRegistry;
