//! Endpoint declarations.
//!
//! An endpoint maps a caller argument to transport arguments, optionally
//! transforms the raw response, and describes the tags it provides (queries)
//! or invalidates (mutations).

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::error::CacheError;
use super::tags::TagSpec;

type QueryFn<A> = Arc<dyn Fn(&Value) -> A + Send + Sync>;
type TransformFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Query,
    Mutation,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointKind::Query => "query",
            EndpointKind::Mutation => "mutation",
        }
    }
}

/// A single declared query or mutation.
///
/// `A` is the transport's argument type.
pub struct EndpointDefinition<A> {
    name: String,
    kind: EndpointKind,
    query: QueryFn<A>,
    transform_response: Option<TransformFn>,
    tags: Option<TagSpec>,
}

impl<A> EndpointDefinition<A> {
    pub fn query<F>(name: impl Into<String>, query: F) -> Self
    where
        F: Fn(&Value) -> A + Send + Sync + 'static,
    {
        Self::new(name.into(), EndpointKind::Query, Arc::new(query))
    }

    pub fn mutation<F>(name: impl Into<String>, query: F) -> Self
    where
        F: Fn(&Value) -> A + Send + Sync + 'static,
    {
        Self::new(name.into(), EndpointKind::Mutation, Arc::new(query))
    }

    fn new(name: String, kind: EndpointKind, query: QueryFn<A>) -> Self {
        Self {
            name,
            kind,
            query,
            transform_response: None,
            tags: None,
        }
    }

    /// Tags a query provides. Ignored on mutations.
    pub fn provides(mut self, spec: TagSpec) -> Self {
        if self.kind == EndpointKind::Query {
            self.tags = Some(spec);
        }
        self
    }

    /// Tags a mutation invalidates. Ignored on queries.
    pub fn invalidates(mut self, spec: TagSpec) -> Self {
        if self.kind == EndpointKind::Mutation {
            self.tags = Some(spec);
        }
        self
    }

    pub fn transform_response<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform_response = Some(Arc::new(transform));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    /// Provided tags for queries, invalidated tags for mutations.
    pub fn tags(&self) -> Option<&TagSpec> {
        self.tags.as_ref()
    }

    pub fn build_args(&self, arg: &Value) -> A {
        (self.query)(arg)
    }

    /// Apply the response transform; identity when none is declared.
    pub fn transform(&self, raw: Value) -> Value {
        match &self.transform_response {
            Some(transform) => transform(raw),
            None => raw,
        }
    }
}

impl<A> fmt::Debug for EndpointDefinition<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("transform_response", &self.transform_response.is_some())
            .field("tags", &self.tags)
            .finish()
    }
}

/// The declared entity types and endpoints of one api.
pub struct ApiDefinition<A> {
    entity_types: BTreeSet<String>,
    endpoints: HashMap<String, Arc<EndpointDefinition<A>>>,
}

impl<A> ApiDefinition<A> {
    pub fn new<I, S>(entity_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity_types: entity_types.into_iter().map(Into::into).collect(),
            endpoints: HashMap::new(),
        }
    }

    /// Register an endpoint, replacing any previous one with the same name.
    pub fn endpoint(mut self, definition: EndpointDefinition<A>) -> Self {
        self.endpoints
            .insert(definition.name.clone(), Arc::new(definition));
        self
    }

    pub fn entity_types(&self) -> &BTreeSet<String> {
        &self.entity_types
    }

    pub fn get(&self, name: &str) -> Result<&Arc<EndpointDefinition<A>>, CacheError> {
        self.endpoints
            .get(name)
            .ok_or_else(|| CacheError::unknown_endpoint(name))
    }

    pub fn query_endpoint(&self, name: &str) -> Result<&Arc<EndpointDefinition<A>>, CacheError> {
        self.expect_kind(name, EndpointKind::Query)
    }

    pub fn mutation_endpoint(
        &self,
        name: &str,
    ) -> Result<&Arc<EndpointDefinition<A>>, CacheError> {
        self.expect_kind(name, EndpointKind::Mutation)
    }

    fn expect_kind(
        &self,
        name: &str,
        expected: EndpointKind,
    ) -> Result<&Arc<EndpointDefinition<A>>, CacheError> {
        let endpoint = self.get(name)?;
        if endpoint.kind != expected {
            return Err(CacheError::WrongEndpointKind {
                endpoint: name.to_string(),
                expected: expected.as_str(),
                actual: endpoint.kind.as_str(),
            });
        }
        Ok(endpoint)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl<A> fmt::Debug for ApiDefinition<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.endpoints.keys().collect();
        names.sort();
        f.debug_struct("ApiDefinition")
            .field("entity_types", &self.entity_types)
            .field("endpoints", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn definition() -> ApiDefinition<String> {
        ApiDefinition::new(["Counter"])
            .endpoint(
                EndpointDefinition::query("getCount", |_| "GET /count".to_string())
                    .provides(TagSpec::fixed(["Counter"]))
                    .transform_response(|raw| raw["payload"].clone()),
            )
            .endpoint(
                EndpointDefinition::mutation("incrementCount", |arg| {
                    format!("PATCH /increment {arg}")
                })
                .invalidates(TagSpec::fixed(["Counter"])),
            )
    }

    #[test]
    fn lookup_checks_endpoint_kind() {
        let api = definition();
        assert!(api.query_endpoint("getCount").is_ok());
        assert!(api.mutation_endpoint("incrementCount").is_ok());

        let err = api
            .query_endpoint("incrementCount")
            .expect_err("mutation is not a query");
        assert!(matches!(err, CacheError::WrongEndpointKind { .. }));

        let err = api.get("missing").expect_err("unknown endpoint");
        assert!(matches!(err, CacheError::UnknownEndpoint(name) if name == "missing"));
    }

    #[test]
    fn transform_defaults_to_identity() {
        let api = definition();
        let mutation = api.get("incrementCount").expect("declared");
        assert_eq!(mutation.transform(json!({"count": 1})), json!({"count": 1}));

        let query = api.get("getCount").expect("declared");
        assert_eq!(query.transform(json!({"payload": 3})), json!(3));
    }

    #[test]
    fn query_maps_argument_to_transport_args() {
        let api = definition();
        let mutation = api.get("incrementCount").expect("declared");
        assert_eq!(mutation.build_args(&json!(1)), "PATCH /increment 1");
    }

    #[test]
    fn provides_is_ignored_on_mutations() {
        let endpoint = EndpointDefinition::mutation("m", |_| ())
            .provides(TagSpec::fixed(["Counter"]));
        assert!(endpoint.tags().is_none());
    }
}
