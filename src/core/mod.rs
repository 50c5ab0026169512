//! Remote service clients
//!
//! HTTP implementations of the backend traits used by the pipeline.

pub mod heygen;
pub mod openai;

pub use heygen::HeyGenClient;
pub use openai::OpenAiClient;
