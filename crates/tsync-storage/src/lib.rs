//! Object storage, Parquet table codec and HTTP fetch utilities.

use sha2::{Digest, Sha256};

mod codec;
mod http;
mod object_store;

pub use codec::{CodecError, TableCodec};
pub use http::{
    FetchError, FetchRequest, FetchedResponse, HttpClientConfig, HttpFetcher, RequestPacer,
    RetryPolicy,
};
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore, ObjectStoreError};

pub const CRATE_NAME: &str = "tsync-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
