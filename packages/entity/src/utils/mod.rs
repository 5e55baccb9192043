mod canonical_json;

pub use canonical_json::{canonical_json, CanonicalJsonError};
