//! Response assembly pipeline: config transport, upstream relay, reply
//! normalization and client-side stream assembly.

pub mod assembler;
pub mod cache;
pub mod crypto;
pub mod extractor;
pub mod markup;
pub mod normalizer;
pub mod products;
pub mod rate_limiter;
pub mod relay;
pub mod reply_json;
pub mod types;
pub mod upstream;
