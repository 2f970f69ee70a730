//! Method registry - the named method surface of a coordinator

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

/// An asynchronous method handler taking positional arguments
#[async_trait]
pub trait Method: Send + Sync {
    async fn call(&self, args: Vec<Value>) -> Result<Value>;
}

/// Adapter turning an async closure into a [`Method`]
struct FnMethod<F>(F);

#[async_trait]
impl<F, Fut> Method for FnMethod<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>) -> Result<Value> {
        (self.0)(args).await
    }
}

/// Wrap an async closure as a shareable method
pub fn method_fn<F, Fut>(f: F) -> Arc<dyn Method>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnMethod(f))
}

/// Named handlers; a later registration under the same name replaces the earlier one
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<dyn Method>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method` under `name`, returning the handler it replaced
    pub fn register(&mut self, name: impl Into<String>, method: Arc<dyn Method>) -> Option<Arc<dyn Method>> {
        let name = name.into();
        debug!(%name, "MethodRegistry::register: called");
        self.methods.insert(name, method)
    }

    /// Register an async closure under `name`
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.register(name, method_fn(f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Method>> {
        self.methods.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Registered method names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Decode positional argument `index` of `method`
pub fn decode_arg<T: DeserializeOwned>(args: &[Value], index: usize, method: &str) -> Result<T> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| eyre!("{} expects an argument at position {}", method, index))?;
    serde_json::from_value(value).context(format!("{} received an invalid argument at position {}", method, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn add(args: Vec<Value>) -> Result<Value> {
        let a: i64 = decode_arg(&args, 0, "add")?;
        let b: i64 = decode_arg(&args, 1, "add")?;
        Ok(json!(a + b))
    }

    #[tokio::test]
    async fn test_register_and_call() {
        let mut registry = MethodRegistry::new();
        registry.register_fn("add", add);

        assert!(registry.contains("add"));
        let method = registry.get("add").unwrap();
        assert_eq!(method.call(vec![json!(2), json!(3)]).await.unwrap(), json!(5));
    }

    async fn nothing(_args: Vec<Value>) -> Result<Value> {
        Ok(Value::Null)
    }

    #[tokio::test]
    async fn test_later_registration_replaces() {
        let mut registry = MethodRegistry::new();
        registry.register_fn("version", nothing);
        let replaced = registry.register("version", method_fn(add));

        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);
        let method = registry.get("version").unwrap();
        assert_eq!(method.call(vec![json!(1), json!(1)]).await.unwrap(), json!(2));
    }

    #[test]
    fn test_decode_arg_errors() {
        let args = vec![json!("not a number")];
        let err = decode_arg::<u32>(&args, 0, "pong").unwrap_err();
        assert!(err.to_string().contains("invalid argument"));

        let err = decode_arg::<u32>(&args, 3, "pong").unwrap_err();
        assert!(err.to_string().contains("position 3"));
    }

    #[test]
    fn test_names_sorted() {
        let mut registry = MethodRegistry::new();
        registry.register_fn("loadAd", nothing);
        registry.register_fn("confirmAd", nothing);
        assert_eq!(registry.names(), vec!["confirmAd".to_string(), "loadAd".to_string()]);
        assert!(!registry.is_empty());
    }
}
