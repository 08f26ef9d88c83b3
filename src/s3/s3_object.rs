use std::fmt;

/// A bucket key pair for an S3 object.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct S3Object {
    /// The bucket the object is in.
    pub bucket: String,
    /// The key of the object within the bucket.
    pub key: String,
}

impl S3Object {
    /// Create a new [S3Object]. Any leading `/` is trimmed from the key.
    pub fn new(bucket: impl AsRef<str>, key: impl AsRef<str>) -> Self {
        S3Object {
            bucket: bucket.as_ref().to_owned(),
            key: key.as_ref().trim_start_matches('/').to_owned(),
        }
    }

    /// The location of the buffered logs of one invocation:
    /// `[prefix/]function_name/shard_id/sequence_number`.
    ///
    /// An empty prefix is ignored and trailing `/`s on the prefix are not doubled up.
    pub fn for_invocation_logs(
        bucket: impl AsRef<str>,
        prefix: Option<&str>,
        function_name: &str,
        shard_id: &str,
        sequence_number: &str,
    ) -> Self {
        let mut key = String::new();
        if let Some(prefix) = prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            key.push_str(prefix);
            key.push('/');
        }
        key.push_str(&format!("{function_name}/{shard_id}/{sequence_number}"));
        S3Object::new(bucket, key)
    }
}

impl fmt::Display for S3Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}
