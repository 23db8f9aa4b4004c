pub mod embeddings;
pub mod oracle;
pub mod transport;
