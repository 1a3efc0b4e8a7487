//! Registered blueprint types.
//!
//! Types are registered explicitly at startup. Each registration carries
//! the DAY0 request validator, the DAY2 route table and the named-operation
//! table. Handlers are written against the concrete blueprint type and
//! typed request/response values; the builder erases them so a worker can
//! dispatch on a path or a name and JSON payload.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::context::BlueprintContext;
use super::{Blueprint, BlueprintError, DynBlueprint};

/// Future returned by operation handlers.
pub type OperationFuture<'a, T> = BoxFuture<'a, Result<T, BlueprintError>>;

type Handler = dyn for<'a> Fn(
        &'a mut (dyn DynBlueprint + 'static),
        &'a mut BlueprintContext,
        Value,
    ) -> OperationFuture<'a, Value>
    + Send
    + Sync;

type Validator = fn(&Value) -> Result<(), serde_json::Error>;

fn validate_as<T: DeserializeOwned>(payload: &Value) -> Result<(), serde_json::Error> {
    T::deserialize(payload).map(drop)
}

fn fresh<B: Blueprint>() -> Box<dyn DynBlueprint> {
    Box::new(B::default())
}

fn load<B: Blueprint>(state: Value) -> Result<Box<dyn DynBlueprint>, serde_json::Error> {
    if state.is_null() {
        return Ok(fresh::<B>());
    }
    Ok(Box::new(serde_json::from_value::<B>(state)?))
}

fn handler<F>(f: F) -> Arc<Handler>
where
    F: for<'a> Fn(
            &'a mut (dyn DynBlueprint + 'static),
            &'a mut BlueprintContext,
            Value,
        ) -> OperationFuture<'a, Value>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// A DAY2 route or named operation of one blueprint type.
#[derive(Clone)]
pub struct Operation {
    handler: Arc<Handler>,
    validator: Validator,
}

impl Operation {
    fn new<B, Req, Resp, F>(f: F) -> Self
    where
        B: Blueprint,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        F: for<'a> Fn(&'a mut B, &'a mut BlueprintContext, Req) -> OperationFuture<'a, Resp>
            + Send
            + Sync
            + 'static,
    {
        let f = Arc::new(f);
        let handler = handler(move |blueprint, ctx, payload| {
            let f = f.clone();
            Box::pin(async move {
                let blueprint = blueprint.as_any_mut().downcast_mut::<B>().ok_or_else(|| {
                    BlueprintError::Failed("operation dispatched to the wrong blueprint type".into())
                })?;
                let request: Req = serde_json::from_value(payload)?;
                let response = (*f)(blueprint, ctx, request).await?;
                Ok::<_, BlueprintError>(serde_json::to_value(response)?)
            })
        });
        Self {
            handler,
            validator: validate_as::<Req>,
        }
    }

    /// Check that `payload` deserializes into the request type.
    pub fn validate(&self, payload: &Value) -> Result<(), serde_json::Error> {
        (self.validator)(payload)
    }

    pub(crate) fn invoke<'a>(
        &self,
        blueprint: &'a mut (dyn DynBlueprint + 'static),
        ctx: &'a mut BlueprintContext,
        payload: Value,
    ) -> OperationFuture<'a, Value> {
        (self.handler)(blueprint, ctx, payload)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation").finish_non_exhaustive()
    }
}

/// Arguments of the built-in `summary` operation.
#[derive(Debug, Default, Deserialize)]
struct SummaryArgs {
    #[serde(default)]
    detailed: bool,
}

/// A registered blueprint type.
pub struct BlueprintType {
    name: String,
    fresh: fn() -> Box<dyn DynBlueprint>,
    load: fn(Value) -> Result<Box<dyn DynBlueprint>, serde_json::Error>,
    validate_create: Validator,
    routes: BTreeMap<String, Operation>,
    operations: BTreeMap<String, Operation>,
}

impl BlueprintType {
    /// Start describing type `B` under `name`.
    ///
    /// Every type gets the named operations `protect` (bool argument) and
    /// `summary` (optional `{"detailed": bool}`).
    pub fn builder<B: Blueprint>(name: impl Into<String>) -> BlueprintTypeBuilder<B> {
        let ty = BlueprintType {
            name: name.into(),
            fresh: fresh::<B>,
            load: load::<B>,
            validate_create: validate_as::<B::Create>,
            routes: BTreeMap::new(),
            operations: BTreeMap::new(),
        };
        BlueprintTypeBuilder {
            ty,
            _marker: PhantomData,
        }
        .operation::<bool, bool, _>("protect", |_, ctx, protect| {
            Box::pin(ctx.set_protected(protect))
        })
        .operation::<Option<SummaryArgs>, Value, _>("summary", |_, ctx, args| {
            let detailed = args.unwrap_or_default().detailed;
            Box::pin(async move { Ok::<_, BlueprintError>(ctx.instance().summary(detailed)) })
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn validate_create(&self, payload: &Value) -> Result<(), serde_json::Error> {
        (self.validate_create)(payload)
    }

    pub fn route(&self, path: &str) -> Option<&Operation> {
        self.routes.get(path)
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.get(name)
    }

    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.operations.keys().map(String::as_str)
    }

    pub(crate) fn fresh_blueprint(&self) -> Box<dyn DynBlueprint> {
        (self.fresh)()
    }

    pub(crate) fn load_blueprint(&self, state: Value) -> Result<Box<dyn DynBlueprint>, serde_json::Error> {
        (self.load)(state)
    }
}

impl fmt::Debug for BlueprintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlueprintType")
            .field("name", &self.name)
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder returned by [`BlueprintType::builder`].
pub struct BlueprintTypeBuilder<B> {
    ty: BlueprintType,
    _marker: PhantomData<fn() -> B>,
}

impl<B: Blueprint> BlueprintTypeBuilder<B> {
    /// Add a DAY2 route.
    pub fn route<Req, Resp, F>(mut self, path: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        F: for<'a> Fn(&'a mut B, &'a mut BlueprintContext, Req) -> OperationFuture<'a, Resp>
            + Send
            + Sync
            + 'static,
    {
        self.ty
            .routes
            .insert(path.to_string(), Operation::new::<B, Req, Resp, F>(f));
        self
    }

    /// Add a named operation.
    pub fn operation<Req, Resp, F>(mut self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + 'static,
        F: for<'a> Fn(&'a mut B, &'a mut BlueprintContext, Req) -> OperationFuture<'a, Resp>
            + Send
            + Sync
            + 'static,
    {
        self.ty
            .operations
            .insert(name.to_string(), Operation::new::<B, Req, Resp, F>(f));
        self
    }

    pub fn build(self) -> BlueprintType {
        self.ty
    }
}

/// All registered types, by name.
#[derive(Debug, Default)]
pub struct BlueprintTypeRegistry {
    types: BTreeMap<String, Arc<BlueprintType>>,
}

impl BlueprintTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, ty: BlueprintType) -> &mut Self {
        let name = ty.name.clone();
        if self.types.insert(name.clone(), Arc::new(ty)).is_some() {
            warn!(blueprint_type = %name, "Blueprint type registered twice, keeping the last");
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<BlueprintType>> {
        self.types.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    #[derive(Deserialize)]
    struct Start {
        value: i64,
    }

    #[async_trait]
    impl Blueprint for Counter {
        type Create = Start;

        async fn create(
            &mut self,
            _ctx: &mut BlueprintContext,
            request: Start,
        ) -> Result<(), BlueprintError> {
            self.value = request.value;
            Ok(())
        }
    }

    fn counter_type() -> BlueprintType {
        BlueprintType::builder::<Counter>("counter")
            .route::<i64, i64, _>("/add", |bp, _, by| {
                Box::pin(async move {
                    bp.value += by;
                    Ok::<_, BlueprintError>(bp.value)
                })
            })
            .build()
    }

    #[test]
    fn test_builtin_operations_are_present() {
        let ty = counter_type();
        let names: Vec<_> = ty.operations().collect();
        assert_eq!(names, vec!["protect", "summary"]);
        assert_eq!(ty.routes().collect::<Vec<_>>(), vec!["/add"]);
    }

    #[test]
    fn test_validators() {
        let ty = counter_type();
        assert!(ty.validate_create(&json!({"value": 3})).is_ok());
        assert!(ty.validate_create(&json!({"value": "three"})).is_err());
        assert!(ty.route("/add").unwrap().validate(&json!(2)).is_ok());
        assert!(ty.route("/add").unwrap().validate(&json!({})).is_err());
        assert!(ty.operation("protect").unwrap().validate(&json!(true)).is_ok());
        assert!(ty.operation("summary").unwrap().validate(&Value::Null).is_ok());
    }

    #[test]
    fn test_load_null_state_gives_default() {
        let ty = counter_type();
        let bp = ty.load_blueprint(Value::Null).unwrap();
        assert_eq!(bp.snapshot().unwrap(), json!({"value": 0}));

        let bp = ty.load_blueprint(json!({"value": 9})).unwrap();
        assert_eq!(bp.snapshot().unwrap(), json!({"value": 9}));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = BlueprintTypeRegistry::new();
        registry.register(counter_type());
        assert!(registry.get("counter").is_some());
        assert!(registry.get("router").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["counter"]);
    }
}
