// Value container with ownership provenance. Application-supplied call
// arguments (PARAMS) must be deep-copied exactly once before the kernel may
// hold them across an await or store them; returned and parsed values are
// already owned and are never copied again.

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::RpcError;
use super::value::Value;

/// Where a payload's value came from, which decides who owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// Call arguments straight from the application. Copy before storing.
    Params,
    /// A return value handed over by a target. The kernel owns it.
    Return,
    /// Deep-copied or freshly parsed. Safe to hold.
    Owned,
}

#[derive(Debug, Clone)]
pub struct Payload {
    pub value: Value,
    provenance: Provenance,
}

impl Payload {
    pub fn from_params(value: Value) -> Self {
        Payload {
            value,
            provenance: Provenance::Params,
        }
    }

    pub fn from_return(value: Value) -> Self {
        Payload {
            value,
            provenance: Provenance::Return,
        }
    }

    pub fn owned(value: Value) -> Self {
        Payload {
            value,
            provenance: Provenance::Owned,
        }
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Deep-copy iff the payload is still PARAMS. Cloning the tree also
    /// clones (dups) every capability in it, so the copy holds its own
    /// refcounts. Idempotent: a payload is copied at most once.
    pub fn ensure_owned(&mut self) {
        if self.provenance == Provenance::Params {
            self.value = self.value.clone();
            self.provenance = Provenance::Owned;
        } else if self.provenance == Provenance::Return {
            self.provenance = Provenance::Owned;
        }
    }

    pub fn into_owned(mut self) -> Payload {
        self.ensure_owned();
        self
    }
}

/// Replace every promise inside a value with its resolution, depth-first.
/// This is what makes promise-bearing arguments settle before a target sees
/// them. Stubs are left alone.
pub fn settle(value: Value) -> BoxFuture<'static, Result<Value, RpcError>> {
    async move {
        match value {
            Value::Promise(promise) => {
                let resolved = promise.await_value().await?;
                settle(resolved).await
            }
            Value::Array(items) => {
                let mut settled = Vec::with_capacity(items.len());
                for item in items {
                    settled.push(settle(item).await?);
                }
                Ok(Value::Array(settled))
            }
            Value::Object(map) => {
                let mut settled = indexmap::IndexMap::with_capacity(map.len());
                for (key, item) in map {
                    settled.insert(key, settle(item).await?);
                }
                Ok(Value::Object(settled))
            }
            other => Ok(other),
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_copy_is_detached() {
        let original = Value::Array(vec![Value::from(1), Value::from(2)]);
        let mut payload = Payload::from_params(original.clone());
        payload.ensure_owned();
        assert_eq!(payload.provenance(), Provenance::Owned);

        // Mutating the owned copy leaves the application's value alone.
        if let Value::Array(items) = &mut payload.value {
            items.push(Value::from(3));
        }
        assert_eq!(original, Value::Array(vec![Value::from(1), Value::from(2)]));
    }

    #[test]
    fn ensure_owned_is_idempotent() {
        let mut payload = Payload::from_params(Value::from("x"));
        payload.ensure_owned();
        let once = payload.value.clone();
        payload.ensure_owned();
        assert_eq!(payload.value, once);
        assert_eq!(payload.provenance(), Provenance::Owned);
    }

    #[test]
    fn return_values_are_adopted_without_copy() {
        let payload = Payload::from_return(Value::from(7)).into_owned();
        assert_eq!(payload.provenance(), Provenance::Owned);
    }

    #[tokio::test]
    async fn settle_passes_plain_values_through() {
        let v = Value::Array(vec![Value::from(1), Value::from("two")]);
        assert_eq!(settle(v.clone()).await.unwrap(), v);
    }
}
