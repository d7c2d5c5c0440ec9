use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::Value;

use super::codec;

/// The identity of one wrapped function.
///
/// A fresh, random [`FunctionKey`] is generated every time a function is wrapped, so two wrapped
/// functions never share cache entries, even if they are the very same function. This is
/// intentional: hashing the function itself could not tell apart two closures that only differ
/// in their captured state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionKey(Arc<str>);

impl FunctionKey {
    /// Generates a new, unique function identity.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string().into())
    }

    /// Derives a deterministic function identity from a caller chosen `name`.
    ///
    /// **NOTE**: Every function wrapped with the same name shares its cache entries with all the
    /// others, in this process and in every other process using the same store. This trades away
    /// the collision safety of [`FunctionKey::random`] for reproducible keys, which is mostly
    /// useful for tests, or to deliberately share a cache across deployments.
    pub fn from_name(name: &str) -> Self {
        Self(hex::encode(Sha256::digest(name)).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The fingerprint of the arguments of one call.
///
/// This is the hex-encoded SHA-256 digest of the canonical JSON serialization of the argument
/// list. Object keys are always serialized in sorted order, so argument lists that are equal by
/// value produce the same fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgsHash(Arc<str>);

impl ArgsHash {
    pub fn from_args(args: &[Value]) -> Self {
        let canonical = codec::to_json_array(args).to_string();
        Self(hex::encode(Sha256::digest(canonical)).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArgsHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The namespace all cache keys of one [`Memoizer`](crate::Memoizer) live in.
///
/// Changing the custom namespace (for example on every deploy) invalidates all previously
/// cached results at once without touching the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyNamespace(Arc<str>);

impl KeyNamespace {
    pub fn new(base: &str, custom: Option<&str>) -> Self {
        let namespace = match custom {
            Some(custom) if !custom.is_empty() => format!("{base}:{custom}"),
            _ => base.to_owned(),
        };
        Self(namespace.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The key under which one call's result is stored.
///
/// Formatted as `<namespace>[:<custom-namespace>]:<function-key>:<args-hash>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: KeyNamespace,
    function_key: FunctionKey,
    args_hash: ArgsHash,
}

impl CacheKey {
    pub fn new(namespace: &KeyNamespace, function_key: &FunctionKey, args_hash: ArgsHash) -> Self {
        Self {
            namespace: namespace.clone(),
            function_key: function_key.clone(),
            args_hash,
        }
    }

    pub fn function_key(&self) -> &FunctionKey {
        &self.function_key
    }

    pub fn args_hash(&self) -> &ArgsHash {
        &self.args_hash
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.namespace.as_str(),
            self.function_key,
            self.args_hash
        )
    }
}
