pub mod memory;
pub mod opensearch;
pub mod opensearch_metadata;

pub use memory::{InMemoryMetadataStore, InMemorySearchIndex};
pub use opensearch::{OpenSearchClient, OpenSearchIndex};
pub use opensearch_metadata::OpenSearchMetadataStore;
